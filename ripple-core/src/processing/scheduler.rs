//! Dispatch ordering of freshly built jobs.

use crate::processing::job::Job;

/// Orders the jobs built in one poll cycle before they are enqueued. Implementations are pure
/// orderings: no I/O, no blocking, no dropping of jobs.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, jobs: Vec<Job>) -> Vec<Job>;
}

/// Dispatches jobs in the order they were built.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fifo;

impl Scheduler for Fifo {
    fn schedule(&self, jobs: Vec<Job>) -> Vec<Job> {
        jobs
    }
}
