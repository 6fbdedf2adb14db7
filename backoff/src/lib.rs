//! Pause bookkeeping for partitions that have to back off before their messages are retried.
//!
//! [`PauseTracker`] counts consecutive processing attempts of a partition and turns that count
//! into a pause interval using one of the [`strategy`] implementations.

/// Interval strategies used to compute how long a partition stays paused.
pub mod strategy;

mod pause;

pub use pause::{PauseSettings, PauseTracker};
