//! Batch coordination: jobs, the process wide jobs queue, per partition coordinators, dispatch
//! ordering and the worker side executor.

pub mod coordinator;
pub(crate) mod executor;
pub mod job;
pub mod jobs_queue;
pub mod scheduler;
pub mod virtual_offsets;
