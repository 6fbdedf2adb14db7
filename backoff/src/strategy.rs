/// Exponential (and its degenerate fixed form) interval computation.
pub mod exponential;
