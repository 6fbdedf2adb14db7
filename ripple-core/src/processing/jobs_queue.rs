use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::processing::job::{GroupId, Job, JobState};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct QueueState {
    /// Jobs waiting for a worker, in enqueue order.
    pending: VecDeque<Job>,
    /// Groups with a running job.
    in_flight: HashSet<GroupId>,
    /// Pending and running jobs per group: job id -> non-blocking.
    groups: HashMap<GroupId, HashMap<u64, bool>>,
    closed: bool,
}

impl QueueState {
    fn forget(&mut self, group_id: &GroupId, job_id: u64) {
        if let Some(jobs) = self.groups.get_mut(group_id) {
            jobs.remove(&job_id);
            if jobs.is_empty() {
                self.groups.remove(group_id);
            }
        }
    }

    fn has_blocking(&self, group_id: &GroupId) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|jobs| jobs.values().any(|non_blocking| !non_blocking))
    }
}

/// Process wide queue of jobs enforcing at most one running job per group.
///
/// Every state change wakes all waiters, they re-check their condition under the lock. The
/// `stop` token releases backpressure waiters when the process is shutting down.
#[derive(Debug)]
pub struct JobsQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    stop: CancellationToken,
}

impl JobsQueue {
    pub fn new(stop: CancellationToken) -> Self {
        JobsQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            stop,
        }
    }

    /// Appends `job`. Fails with [`Error::Synchronization`] when its group already has a
    /// running job. A closed queue silently drops the job.
    pub fn enqueue(&self, mut job: Job) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                debug!(group = %job.group_id, "Queue is closed, dropping job");
                return Ok(());
            }
            if state.in_flight.contains(&job.group_id) {
                return Err(Error::Synchronization(format!(
                    "job for group {} is already in flight",
                    job.group_id
                )));
            }
            job.set_state(JobState::Pending);
            state
                .groups
                .entry(job.group_id.clone())
                .or_default()
                .insert(job.id(), job.is_non_blocking());
            state.pending.push_back(job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits for the oldest pending job whose group is not running and marks it in flight.
    /// Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            // registered before checking, so a notification between the check and the await is
            // not lost
            let notified = self.notify.notified();
            {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                if state.closed {
                    return None;
                }
                let position = state
                    .pending
                    .iter()
                    .position(|job| !state.in_flight.contains(&job.group_id));
                if let Some(mut job) = position.and_then(|p| state.pending.remove(p)) {
                    state.in_flight.insert(job.group_id.clone());
                    job.set_state(JobState::Running);
                    return Some(job);
                }
            }
            notified.await;
        }
    }

    /// Releases the group of a finished job and wakes everyone waiting on it.
    pub fn complete(&self, job: &mut Job) {
        {
            let mut state = self.state.lock();
            state.in_flight.remove(&job.group_id);
            state.forget(&job.group_id, job.id());
        }
        job.set_state(JobState::Completed);
        self.notify.notify_waiters();
    }

    /// Waits until `group_id` has no pending or running blocking job, the queue is closed or the
    /// process is stopping.
    pub async fn wait(&self, group_id: &GroupId) {
        self.wait_until(true, |state| !state.has_blocking(group_id))
            .await
    }

    /// Like [`JobsQueue::wait`] but also waits for non-blocking jobs.
    pub async fn wait_idle(&self, group_id: &GroupId) {
        self.wait_until(true, |state| !state.groups.contains_key(group_id))
            .await
    }

    /// Waits until no job is pending or running at all. Ignores the stop signal, this is what
    /// shutdown uses to drain.
    pub async fn drain(&self) {
        self.wait_until(false, |state| {
            state.pending.is_empty() && state.in_flight.is_empty()
        })
        .await
    }

    async fn wait_until(&self, honor_stop: bool, done: impl Fn(&QueueState) -> bool) {
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if state.closed || done(&state) {
                    return;
                }
            }
            if honor_stop {
                if self.stop.is_cancelled() {
                    return;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = self.stop.cancelled() => return,
                }
            } else {
                notified.await;
            }
        }
    }

    /// Drops the pending jobs of `group_id`. A running job is left alone. Returns how many jobs
    /// were dropped.
    pub fn clear(&self, group_id: &GroupId) -> usize {
        let cleared = {
            let mut state = self.state.lock();
            let (dropped, kept): (VecDeque<Job>, VecDeque<Job>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|job| &job.group_id == group_id);
            state.pending = kept;
            for job in &dropped {
                state.forget(&job.group_id, job.id());
            }
            dropped.len()
        };
        if cleared > 0 {
            debug!(group = %group_id, cleared, "Cleared pending jobs");
            self.notify.notify_waiters();
        }
        cleared
    }

    /// Idempotent. Pending jobs are dropped and every blocked caller is released.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            if !state.pending.is_empty() {
                warn!(
                    pending = state.pending.len(),
                    "Closing jobs queue with pending jobs"
                );
            }
            state.pending.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Groups with pending or running jobs.
    pub fn groups(&self) -> Vec<GroupId> {
        self.state.lock().groups.keys().cloned().collect()
    }

    /// Whether `group_id` has neither a pending nor a running job.
    pub fn is_idle(&self, group_id: &GroupId) -> bool {
        !self.state.lock().groups.contains_key(group_id)
    }

    pub fn is_in_flight(&self, group_id: &GroupId) -> bool {
        self.state.lock().in_flight.contains(group_id)
    }

    /// Number of pending jobs.
    pub fn size(&self) -> usize {
        self.state.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{group, tick_job};

    fn queue() -> Arc<JobsQueue> {
        Arc::new(JobsQueue::new(CancellationToken::new()))
    }

    #[tokio::test]
    async fn test_fifo_per_group() {
        let queue = queue();
        let first = tick_job("t", 0, false);
        let second = tick_job("t", 0, false);
        let (first_id, second_id) = (first.id(), second.id());
        queue.enqueue(first).unwrap();
        queue.enqueue(second).unwrap();
        assert_eq!(queue.size(), 2);

        let mut job = queue.dequeue().await.unwrap();
        assert_eq!(job.id(), first_id);
        assert_eq!(job.state(), JobState::Running);
        assert!(queue.is_in_flight(&job.group_id));

        // the second job of the group is held back while the first one runs
        let blocked = tokio::time::timeout(Duration::from_millis(50), queue.dequeue()).await;
        assert!(blocked.is_err());

        queue.complete(&mut job);
        assert_eq!(job.state(), JobState::Completed);
        let job = queue.dequeue().await.unwrap();
        assert_eq!(job.id(), second_id);
    }

    #[tokio::test]
    async fn test_other_groups_are_not_blocked() {
        let queue = queue();
        queue.enqueue(tick_job("t", 0, false)).unwrap();
        queue.enqueue(tick_job("t", 0, false)).unwrap();
        queue.enqueue(tick_job("t", 1, false)).unwrap();

        let a = queue.dequeue().await.unwrap();
        let b = queue.dequeue().await.unwrap();
        assert_eq!(a.group_id, group("t", 0));
        assert_eq!(b.group_id, group("t", 1));
    }

    #[tokio::test]
    async fn test_enqueue_for_in_flight_group_fails() {
        let queue = queue();
        queue.enqueue(tick_job("t", 0, false)).unwrap();
        let _running = queue.dequeue().await.unwrap();

        let result = queue.enqueue(tick_job("t", 0, false));
        assert!(matches!(result, Err(Error::Synchronization(_))));
    }

    #[tokio::test]
    async fn test_never_two_jobs_of_a_group_in_flight() {
        let queue = queue();
        for _ in 0..20 {
            for partition in 0..4 {
                queue.enqueue(tick_job("t", partition, false)).unwrap();
            }
        }

        let running = Arc::new(Mutex::new(HashSet::new()));
        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            workers.spawn(async move {
                while let Some(mut job) = queue.dequeue().await {
                    assert!(running.lock().insert(job.group_id.clone()));
                    tokio::task::yield_now().await;
                    assert!(running.lock().remove(&job.group_id));
                    queue.complete(&mut job);
                }
            });
        }

        tokio::time::timeout(Duration::from_secs(5), queue.drain())
            .await
            .unwrap();
        queue.close();
        workers.join_all().await;
    }

    #[tokio::test]
    async fn test_wait_ignores_non_blocking_jobs() {
        let queue = queue();
        queue.enqueue(tick_job("t", 0, true)).unwrap();
        let group_id = group("t", 0);

        tokio::time::timeout(Duration::from_millis(100), queue.wait(&group_id))
            .await
            .unwrap();
        // but the group is not idle
        assert!(!queue.is_idle(&group_id));
        let idle = tokio::time::timeout(Duration::from_millis(50), queue.wait_idle(&group_id)).await;
        assert!(idle.is_err());
    }

    #[tokio::test]
    async fn test_wait_returns_when_group_completes() {
        let queue = queue();
        queue.enqueue(tick_job("t", 0, false)).unwrap();
        let group_id = group("t", 0);

        let waiter = {
            let queue = Arc::clone(&queue);
            let group_id = group_id.clone();
            tokio::spawn(async move { queue.wait(&group_id).await })
        };

        let mut job = queue.dequeue().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.complete(&mut job);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.is_idle(&group_id));
    }

    #[tokio::test]
    async fn test_wait_returns_when_stopping() {
        let stop = CancellationToken::new();
        let queue = Arc::new(JobsQueue::new(stop.clone()));
        queue.enqueue(tick_job("t", 0, false)).unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(&group("t", 0)).await })
        };
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_clear_drops_only_pending_jobs_of_group() {
        let queue = queue();
        queue.enqueue(tick_job("t", 0, false)).unwrap();
        let mut running = queue.dequeue().await.unwrap();

        queue.enqueue(tick_job("t", 1, false)).unwrap();
        queue.enqueue(tick_job("t", 1, false)).unwrap();
        queue.enqueue(tick_job("t", 2, false)).unwrap();

        assert_eq!(queue.clear(&group("t", 1)), 2);
        assert_eq!(queue.clear(&group("t", 0)), 0);
        assert_eq!(queue.size(), 1);
        assert!(queue.is_idle(&group("t", 1)));

        queue.complete(&mut running);
        assert_eq!(queue.dequeue().await.unwrap().group_id, group("t", 2));
    }

    #[tokio::test]
    async fn test_close_releases_everyone() {
        let queue = queue();
        let dequeuer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };
        queue.enqueue(tick_job("t", 0, false)).unwrap();
        let _running = dequeuer.await.unwrap().unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.drain().await })
        };
        let blocked_dequeue = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        queue.close();
        queue.close();
        assert!(queue.is_closed());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        let dequeued = tokio::time::timeout(Duration::from_secs(1), blocked_dequeue)
            .await
            .unwrap()
            .unwrap();
        assert!(dequeued.is_none());

        // enqueue after close is a no-op
        queue.enqueue(tick_job("t", 5, false)).unwrap();
        assert_eq!(queue.size(), 0);
    }
}
