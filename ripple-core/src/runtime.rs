//! The processing runtime: owns the jobs queue and the worker pool, turns polled batches into
//! jobs and reacts to rebalances.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Client, Producer};
use crate::config::Settings;
use crate::handler::Handler;
use crate::message::{Batch, Message, TopicPartition};
use crate::monitor::{Event, Monitor};
use crate::processing::coordinator::Coordinator;
use crate::processing::executor::Executor;
use crate::processing::job::{GroupId, Job};
use crate::processing::jobs_queue::JobsQueue;
use crate::processing::scheduler::{Fifo, Scheduler};
use crate::processing::virtual_offsets::VirtualOffsetManager;
use crate::routing::{Routes, Topic};
use crate::strategy::Feature;
use crate::{Error, Result};

/// An assigned partition.
struct Assignment {
    topic: Arc<Topic>,
    coordinator: Arc<Coordinator>,
    /// Bumped on every revocation so jobs of a lost assignment never share a group with jobs of
    /// a new one.
    generation: u64,
}

pub struct Runtime<H> {
    routes: Routes,
    queue: Arc<JobsQueue>,
    scheduler: Box<dyn Scheduler>,
    executor: Arc<Executor<H>>,
    assignments: Mutex<HashMap<TopicPartition, Assignment>>,
    /// Generation the next assignment of a previously revoked partition starts with.
    generations: Mutex<HashMap<TopicPartition, u64>>,
    workers: Mutex<JoinSet<Result<()>>>,
    stop: CancellationToken,
    shutdown_timeout: Duration,
}

impl<H: Handler> Runtime<H> {
    /// Starts `settings.concurrency` workers. Has to be called within a tokio runtime.
    pub fn new(
        settings: &Settings,
        routes: Routes,
        client: Arc<dyn Client>,
        producer: Arc<dyn Producer>,
        handler: H,
        monitor: Monitor,
    ) -> Self {
        let stop = CancellationToken::new();
        let queue = Arc::new(JobsQueue::new(stop.clone()));
        let executor = Arc::new(Executor {
            handler: Arc::new(handler),
            client,
            producer,
            monitor,
            stop: stop.clone(),
        });

        let concurrency = settings.concurrency.max(1);
        let mut workers = JoinSet::new();
        for id in 0..concurrency {
            workers.spawn(work(id, Arc::clone(&queue), Arc::clone(&executor)));
        }
        info!(concurrency, topics = ?routes.names(), "Started processing runtime");

        Runtime {
            routes,
            queue,
            scheduler: Box::new(Fifo),
            executor,
            assignments: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            workers: Mutex::new(workers),
            stop,
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }

    /// Replaces the FIFO dispatch order.
    pub fn with_scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Box::new(scheduler);
        self
    }

    pub fn monitor(&self) -> &Monitor {
        &self.executor.monitor
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    /// Coordinator of an assigned partition.
    pub fn coordinator(&self, partition: &TopicPartition) -> Option<Arc<Coordinator>> {
        self.assignments
            .lock()
            .get(partition)
            .map(|assignment| Arc::clone(&assignment.coordinator))
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Turns the batches of one poll cycle into jobs and enqueues them. A batch of a partition
    /// that is still busy waits for the previous batch to finish, except for long-running jobs
    /// whose partition is paused anyway: such a batch is dropped and fetched again on resume.
    pub async fn submit(&self, batches: Vec<Batch>) -> Result<()> {
        if self.stop.is_cancelled() {
            debug!(batches = batches.len(), "Stopping, not accepting batches");
            return Ok(());
        }

        let mut jobs = Vec::new();
        for batch in batches {
            jobs.extend(self.build_jobs(batch).await?);
        }

        for job in self.scheduler.schedule(jobs) {
            let lifecycle = self.executor.lifecycle(&job.topic, &job.coordinator);
            if let Err(e) = lifecycle.before_enqueue() {
                error!(group = %job.group_id, error = %e, "Before enqueue failed");
                self.monitor().instrument(Event::Error {
                    partition: Some(job.group_id.partition.clone()),
                    error: e.to_string(),
                });
            }
            self.queue.enqueue(job)?;
        }
        Ok(())
    }

    /// Single batch form of [`Runtime::submit`].
    pub async fn submit_batch(&self, partition: TopicPartition, messages: Vec<Message>) -> Result<()> {
        let high_watermark = messages.last().map_or(0, |m| m.offset + 1);
        self.submit(vec![Batch::new(partition, messages, high_watermark)])
            .await
    }

    async fn build_jobs(&self, batch: Batch) -> Result<Vec<Job>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let Some(topic) = self.routes.get(&batch.partition.topic) else {
            warn!(partition = %batch.partition, "No route for topic, dropping batch");
            return Ok(Vec::new());
        };
        let (coordinator, generation) = self.assignment(&batch.partition, &topic);

        if !self.is_partition_idle(&batch.partition, generation) {
            if topic.has(Feature::LongRunningJob) {
                debug!(partition = %batch.partition, "Long-running job in progress, dropping batch");
                return Ok(Vec::new());
            }
            self.wait_partition_idle(&batch.partition, generation)
                .await;
        }
        if coordinator.is_revoked() || self.stop.is_cancelled() {
            return Ok(Vec::new());
        }

        let lifecycle = self.executor.lifecycle(&topic, &coordinator);
        let Some(admitted) = lifecycle.before_schedule_consume(batch.messages).await? else {
            return Ok(Vec::new());
        };
        let Some(first) = admitted.messages.first().map(|m| m.offset) else {
            return Ok(Vec::new());
        };

        let virtual_partitions = topic
            .virtual_partitions
            .as_ref()
            .filter(|_| !coordinator.is_collapsed(first));

        let mut segments: BTreeMap<usize, Vec<Arc<Message>>> = BTreeMap::new();
        for message in &admitted.messages {
            let segment = virtual_partitions.map_or(0, |vp| vp.segment(message));
            segments
                .entry(segment)
                .or_default()
                .push(Arc::clone(message));
        }
        let virtual_offsets = virtual_partitions.map(|_| {
            VirtualOffsetManager::new(segments.iter().flat_map(|(segment, messages)| {
                messages.iter().map(move |m| (m.offset, *segment))
            }))
        });

        coordinator.start(
            Arc::from(admitted.messages),
            segments.len(),
            virtual_offsets,
            admitted.throttle,
        );

        Ok(segments
            .into_iter()
            .map(|(segment, messages)| {
                Job::consume(
                    GroupId {
                        partition: batch.partition.clone(),
                        segment,
                        generation,
                    },
                    messages,
                    Arc::clone(&coordinator),
                    Arc::clone(&topic),
                )
            })
            .collect())
    }

    fn assignment(&self, partition: &TopicPartition, topic: &Arc<Topic>) -> (Arc<Coordinator>, u64) {
        let mut assignments = self.assignments.lock();
        let assignment = assignments.entry(partition.clone()).or_insert_with(|| {
            let generation = self
                .generations
                .lock()
                .get(partition)
                .copied()
                .unwrap_or_default();
            debug!(%partition, generation, "New assignment");
            Assignment {
                topic: Arc::clone(topic),
                coordinator: Arc::new(Coordinator::new(
                    partition.clone(),
                    &topic.pause,
                    topic.throttling.clone(),
                )),
                generation,
            }
        });
        (Arc::clone(&assignment.coordinator), assignment.generation)
    }

    /// Registers newly assigned partitions, so periodic ticks run before their first batch.
    pub fn on_assign(&self, partitions: &[TopicPartition]) {
        for partition in partitions {
            match self.routes.get(&partition.topic) {
                Some(topic) => {
                    self.assignment(partition, &topic);
                }
                None => warn!(%partition, "Assigned partition of an unrouted topic"),
            }
        }
    }

    /// The partition was taken away: drops its queued jobs, runs the revocation hooks and
    /// forgets the coordinator. A job that is already running finishes, but nothing it does
    /// afterwards reaches the broker.
    pub async fn on_revoke(&self, partition: &TopicPartition) {
        let Some(assignment) = self.assignments.lock().remove(partition) else {
            debug!(%partition, "Revoked partition was never assigned");
            return;
        };
        self.generations
            .lock()
            .insert(partition.clone(), assignment.generation + 1);

        let cleared: usize = self
            .partition_groups(partition, assignment.generation)
            .iter()
            .map(|group| self.queue.clear(group))
            .sum();

        self.executor
            .lifecycle(&assignment.topic, &assignment.coordinator)
            .revoked();
        self.executor.handler.revoked(partition).await;
        info!(%partition, cleared, "Partition revoked");
    }

    fn partition_groups(&self, partition: &TopicPartition, generation: u64) -> Vec<GroupId> {
        self.queue
            .groups()
            .into_iter()
            .filter(|group| &group.partition == partition && group.generation == generation)
            .collect()
    }

    fn is_partition_idle(&self, partition: &TopicPartition, generation: u64) -> bool {
        self.partition_groups(partition, generation).is_empty()
    }

    async fn wait_partition_idle(&self, partition: &TopicPartition, generation: u64) {
        for group in self.partition_groups(partition, generation) {
            self.queue.wait_idle(&group).await;
        }
    }

    /// Backpressure for the poll loop: waits until every blocking job finished. Long-running
    /// jobs do not block.
    pub async fn wait(&self) {
        for group in self.queue.groups() {
            self.queue.wait(&group).await;
        }
    }

    /// Resumes partitions whose pause expired.
    pub fn resume_expired_pauses(&self) {
        for (topic, coordinator) in self.snapshot().into_iter().map(|(_, t, c, _)| (t, c)) {
            if !coordinator.pause_tracker().is_expired() {
                continue;
            }
            let actions = self.executor.lifecycle(&topic, &coordinator).actions();
            if let Err(e) = actions.resume() {
                warn!(partition = %coordinator.partition(), error = %e, "Resuming partition failed");
            }
        }
    }

    /// Enqueues a tick for every idle, unpaused partition of a periodic topic whose last
    /// activity is older than the topic's interval.
    pub fn schedule_ticks(&self) -> Result<()> {
        let mut jobs = Vec::new();
        for (partition, topic, coordinator, generation) in self.snapshot() {
            let Some(interval) = topic.periodic_interval else {
                continue;
            };
            if !coordinator.is_idle()
                || coordinator.pause_tracker().is_paused()
                || coordinator.last_activity().elapsed() < interval
                || !self.is_partition_idle(&partition, generation)
            {
                continue;
            }

            self.executor
                .lifecycle(&topic, &coordinator)
                .before_schedule_tick();
            coordinator.touch();
            let group = GroupId {
                partition,
                segment: 0,
                generation,
            };
            jobs.push(Job::tick(group, coordinator, topic));
        }

        for job in self.scheduler.schedule(jobs) {
            self.queue.enqueue(job)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<(TopicPartition, Arc<Topic>, Arc<Coordinator>, u64)> {
        self.assignments
            .lock()
            .iter()
            .map(|(partition, assignment)| {
                (
                    partition.clone(),
                    Arc::clone(&assignment.topic),
                    Arc::clone(&assignment.coordinator),
                    assignment.generation,
                )
            })
            .collect()
    }

    /// Stops accepting work, waits (at most the shutdown timeout) for in-flight and queued jobs,
    /// then closes the queue and stops the workers. Returns the fatal error a worker stopped
    /// with, if any.
    pub async fn shutdown(&self) -> Result<()> {
        info!(timeout = ?self.shutdown_timeout, "Shutting down, draining jobs");
        self.stop.cancel();

        let drained = tokio::time::timeout(self.shutdown_timeout, self.queue.drain())
            .await
            .is_ok();
        self.queue.close();

        let mut workers = std::mem::take(&mut *self.workers.lock());
        if !drained {
            warn!("Jobs did not finish within the shutdown timeout, aborting workers");
            workers.abort_all();
        }

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error!(error = ?e, "Worker panicked");
                    if result.is_ok() {
                        result = Err(Error::Shutdown(format!("worker panicked: {e}")));
                    }
                }
            }
        }
        info!("Runtime stopped");
        result
    }
}

async fn work<H: Handler>(id: usize, queue: Arc<JobsQueue>, executor: Arc<Executor<H>>) -> Result<()> {
    while let Some(mut job) = queue.dequeue().await {
        let result = executor.execute(&job).await;
        queue.complete(&mut job);
        if let Err(e) = result {
            error!(worker = id, group = %job.group_id, error = %e, "Worker stopped on a fatal error");
            executor.monitor.instrument(Event::Error {
                partition: Some(job.group_id.partition.clone()),
                error: e.to_string(),
            });
            return Err(e);
        }
    }
    debug!(worker = id, "Worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use bytes::Bytes;
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::config::{
        DeadLetterQueueSettings, PeriodicJobSettings, ThrottlingSettings, TopicSettings,
        VirtualPartitionsSettings,
    };
    use crate::context::{ConsumeContext, SeekTarget};
    use crate::handler::{ActiveJobHandler, Perform};
    use crate::routing::DlqEnhancer;
    use crate::test_utils::{MockClient, MockProducer, message, pause_config};
    use crate::{HandlerResult, client::DeadLetter};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct FnHandler<F>(F);

    impl<F> Handler for FnHandler<F>
    where
        F: Fn(&ConsumeContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        async fn consume(&self, ctx: &ConsumeContext<'_>) -> HandlerResult {
            (self.0)(ctx)
        }
    }

    fn handler<F>(f: F) -> FnHandler<F>
    where
        F: Fn(&ConsumeContext<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        FnHandler(f)
    }

    fn succeed() -> FnHandler<impl Fn(&ConsumeContext<'_>) -> HandlerResult + Send + Sync + 'static> {
        handler(|_| Ok(()))
    }

    struct Harness<H> {
        runtime: Runtime<H>,
        client: Arc<MockClient>,
        producer: Arc<MockProducer>,
    }

    fn harness<H: Handler>(topic: TopicSettings, handler: H) -> Harness<H> {
        harness_with(Routes::from_settings(&settings(topic)).unwrap(), handler)
    }

    fn settings(topic: TopicSettings) -> Settings {
        Settings {
            concurrency: 4,
            shutdown_timeout_ms: 5_000,
            pause: pause_config(),
            topics: vec![topic],
            ..Default::default()
        }
    }

    fn harness_with<H: Handler>(routes: Routes, handler: H) -> Harness<H> {
        let client = MockClient::new();
        let producer = MockProducer::new();
        let runtime = Runtime::new(
            &Settings {
                concurrency: 4,
                shutdown_timeout_ms: 5_000,
                ..Default::default()
            },
            routes,
            Arc::clone(&client) as Arc<dyn Client>,
            Arc::clone(&producer) as Arc<dyn Producer>,
            handler,
            Monitor::default(),
        );
        Harness {
            runtime,
            client,
            producer,
        }
    }

    fn partition() -> TopicPartition {
        TopicPartition::new("orders", 0)
    }

    fn batch(offsets: std::ops::Range<i64>) -> Vec<Message> {
        offsets.map(|offset| message("orders", 0, offset)).collect()
    }

    impl<H: Handler> Harness<H> {
        async fn process(&self, offsets: std::ops::Range<i64>) {
            self.runtime
                .submit_batch(partition(), batch(offsets))
                .await
                .unwrap();
            tokio::time::timeout(TIMEOUT, self.runtime.wait())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_successful_batch_commits_last_offset() {
        let harness = harness(TopicSettings::new("orders"), succeed());
        harness.process(0..10).await;

        assert_eq!(harness.client.commits(), vec![10]);
        assert!(harness.client.pauses().is_empty());
        let coordinator = harness.runtime.coordinator(&partition()).unwrap();
        assert_eq!(coordinator.seek_offset(), Some(10));
        assert_eq!(coordinator.pause_tracker().attempt(), 0);

        // the next batch moves the commit forward
        harness.process(10..12).await;
        assert_eq!(harness.client.commits(), vec![10, 12]);
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_pauses_without_commit() {
        let harness = harness(
            TopicSettings::new("orders"),
            handler(|_| Err("boom".into())),
        );
        harness.process(0..10).await;
        harness.process(0..10).await;

        assert!(harness.client.commits().is_empty());
        // backoff doubles with every attempt
        assert_eq!(
            harness.client.pauses(),
            vec![(0, Duration::from_millis(200)), (0, Duration::from_millis(400))]
        );
        let cause = harness
            .runtime
            .coordinator(&partition())
            .unwrap()
            .failure_cause()
            .unwrap();
        assert_eq!(cause.to_string(), "boom");
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_failure() {
        let harness = harness(
            TopicSettings::new("orders"),
            handler(|_| panic!("handler bug")),
        );
        harness.process(0..3).await;

        assert!(harness.client.commits().is_empty());
        assert_eq!(harness.client.pauses().len(), 1);
        // the worker survived
        harness.process(0..3).await;
        assert_eq!(harness.client.pauses().len(), 2);
        harness.runtime.shutdown().await.unwrap();
    }

    struct Enhancer;

    impl DlqEnhancer for Enhancer {
        fn enhance(&self, _message: &Message, record: &mut DeadLetter) {
            record.payload = Bytes::from_static(b"enhanced");
            record.topic = "somewhere-else".to_string();
            record
                .headers
                .insert("original_offset".to_string(), "tampered".to_string());
            record
                .headers
                .insert("reason".to_string(), "poison".to_string());
        }
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_retries() {
        let topic = TopicSettings {
            dead_letter_queue: Some(DeadLetterQueueSettings {
                topic: Some("orders-dlq".to_string()),
                max_retries: 2,
            }),
            ..TopicSettings::new("orders")
        };
        let routes = Routes::from_settings(&settings(topic))
            .unwrap()
            .update("orders", |t| t.with_enhancer(Enhancer));
        // offset 0 is poison
        let harness = harness_with(
            routes,
            handler(|ctx| {
                if ctx.messages()[0].offset == 0 {
                    Err("poison".into())
                } else {
                    Ok(())
                }
            }),
        );

        for _ in 0..3 {
            harness.process(0..10).await;
        }

        assert_eq!(
            harness.client.pauses(),
            vec![
                (0, Duration::from_millis(200)),
                (0, Duration::from_millis(400)),
                // attempts were reset, regular pause on the next offset
                (1, Duration::from_millis(100)),
            ]
        );
        assert_eq!(harness.client.commits(), vec![1]);

        let records = harness.producer.records();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.topic, "orders-dlq");
        assert_eq!(record.key.as_deref(), Some("0"));
        assert_eq!(record.payload, Bytes::from_static(b"enhanced"));
        assert_eq!(record.headers["original_topic"], "orders");
        assert_eq!(record.headers["original_partition"], "0");
        assert_eq!(record.headers["original_offset"], "0");
        assert_eq!(record.headers["reason"], "poison");

        // processing continues after the skipped message
        harness.process(1..10).await;
        assert_eq!(harness.client.commits(), vec![1, 10]);
        assert_eq!(harness.producer.records().len(), 1);
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_dispatch_disabled_skips_message() {
        let topic = TopicSettings {
            dead_letter_queue: Some(DeadLetterQueueSettings {
                topic: None,
                max_retries: 0,
            }),
            ..TopicSettings::new("orders")
        };
        let harness = harness(topic, handler(|_| Err("boom".into())));
        harness.process(5..8).await;

        assert!(harness.producer.records().is_empty());
        assert_eq!(harness.client.commits(), vec![6]);
        assert_eq!(harness.client.pauses(), vec![(6, Duration::from_millis(100))]);
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_with_manual_offsets_does_not_commit() {
        let topic = TopicSettings {
            manual_offset_management: true,
            dead_letter_queue: Some(DeadLetterQueueSettings {
                topic: Some("dlq".to_string()),
                max_retries: 0,
            }),
            ..TopicSettings::new("orders")
        };
        let harness = harness(topic, handler(|_| Err("boom".into())));
        harness.process(0..3).await;

        assert_eq!(harness.producer.records().len(), 1);
        assert!(harness.client.commits().is_empty());
        assert_eq!(harness.client.pauses(), vec![(1, Duration::from_millis(100))]);
        let coordinator = harness.runtime.coordinator(&partition()).unwrap();
        assert_eq!(coordinator.seek_offset(), Some(1));
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_offset_management_never_auto_commits() {
        let topic = TopicSettings {
            manual_offset_management: true,
            ..TopicSettings::new("orders")
        };
        let harness = harness(
            topic,
            handler(|ctx| {
                ctx.mark_as_consumed(&ctx.messages()[4], None)?;
                Ok(())
            }),
        );
        harness.process(0..10).await;

        assert_eq!(harness.client.commits(), vec![5]);
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_seek_wins_over_auto_marking() {
        let harness = harness(
            TopicSettings::new("orders"),
            handler(|ctx| {
                ctx.seek(SeekTarget::Offset(2))?;
                Ok(())
            }),
        );
        harness.process(0..10).await;

        assert!(harness.client.commits().is_empty());
        assert_eq!(harness.client.seeks(), vec![2]);
        let coordinator = harness.runtime.coordinator(&partition()).unwrap();
        assert_eq!(coordinator.seek_offset(), Some(2));
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_seek_back_never_regresses_the_commit() {
        let seeked = Arc::new(AtomicBool::new(false));
        let harness = harness(TopicSettings::new("orders"), {
            let seeked = Arc::clone(&seeked);
            handler(move |ctx| {
                let rewind = ctx.messages().iter().any(|m| m.offset == 7);
                if rewind && !seeked.swap(true, Ordering::SeqCst) {
                    ctx.seek(SeekTarget::Offset(2))?;
                }
                Ok(())
            })
        });
        harness.process(0..5).await;
        harness.process(5..10).await;
        assert_eq!(harness.client.commits(), vec![5]);
        assert_eq!(harness.client.seeks(), vec![2]);

        // the redelivered prefix is already committed
        harness.process(2..5).await;
        assert_eq!(harness.client.commits(), vec![5]);
        let coordinator = harness.runtime.coordinator(&partition()).unwrap();
        assert_eq!(coordinator.seek_offset(), Some(5));

        harness.process(5..10).await;
        assert_eq!(harness.client.commits(), vec![5, 10]);
        assert_eq!(coordinator.committed(), Some(10));
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_pause_wins_over_auto_marking() {
        let harness = harness(
            TopicSettings::new("orders"),
            handler(|ctx| {
                ctx.pause(5, Some(Duration::from_secs(10)))?;
                Ok(())
            }),
        );
        harness.process(0..10).await;

        assert!(harness.client.commits().is_empty());
        assert_eq!(harness.client.pauses(), vec![(5, Duration::from_secs(10))]);
        harness.runtime.shutdown().await.unwrap();
    }

    /// Three keys landing in three different virtual partitions.
    fn distinct_keys(topic: &Topic) -> Vec<String> {
        let vp = topic.virtual_partitions.as_ref().unwrap();
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for candidate in 0..1000 {
            let key = format!("key-{candidate}");
            let mut sample = message("orders", 0, 0);
            sample.key = Some(Bytes::from(key.clone()));
            if seen.insert(vp.segment(&sample)) {
                keys.push(key);
            }
            if keys.len() == 3 {
                break;
            }
        }
        keys
    }

    #[tokio::test]
    async fn test_virtual_partitions_commit_only_contiguous_prefix() {
        let topic = TopicSettings {
            virtual_partitions: Some(VirtualPartitionsSettings { max_partitions: 3 }),
            ..TopicSettings::new("orders")
        };
        let routes = Routes::from_settings(&settings(topic)).unwrap();
        let keys = distinct_keys(&routes.get("orders").unwrap());
        assert_eq!(keys.len(), 3);

        let failing = Arc::new(AtomicBool::new(true));
        let jobs = Arc::new(AtomicUsize::new(0));
        let poison = keys[1].clone();
        let harness = harness_with(routes, {
            let failing = Arc::clone(&failing);
            let jobs = Arc::clone(&jobs);
            handler(move |ctx| {
                jobs.fetch_add(1, Ordering::SeqCst);
                let poisoned = ctx
                    .messages()
                    .iter()
                    .any(|m| m.key.as_deref() == Some(poison.as_bytes()));
                if poisoned && failing.load(Ordering::SeqCst) {
                    Err("poison".into())
                } else {
                    Ok(())
                }
            })
        });

        // offsets 0..9 round robin over the three virtual partitions, the second one fails
        let messages: Vec<Message> = (0..9)
            .map(|offset| {
                let mut m = message("orders", 0, offset);
                m.key = Some(Bytes::from(keys[(offset % 3) as usize].clone()));
                m
            })
            .collect();
        harness
            .runtime
            .submit_batch(partition(), messages.clone())
            .await
            .unwrap();
        tokio::time::timeout(TIMEOUT, harness.runtime.wait())
            .await
            .unwrap();

        assert_eq!(jobs.load(Ordering::SeqCst), 3);
        let coordinator = harness.runtime.coordinator(&partition()).unwrap();
        assert!(!coordinator.is_success());
        // offset 0 is the only contiguous confirmed offset
        assert_eq!(harness.client.commits(), vec![1]);
        assert_eq!(harness.client.pauses(), vec![(1, Duration::from_millis(200))]);

        // the redelivery is processed collapsed, as a single job
        failing.store(false, Ordering::SeqCst);
        harness
            .runtime
            .submit_batch(partition(), messages[1..].to_vec())
            .await
            .unwrap();
        tokio::time::timeout(TIMEOUT, harness.runtime.wait())
            .await
            .unwrap();

        assert_eq!(jobs.load(Ordering::SeqCst), 4);
        assert_eq!(harness.client.commits(), vec![1, 9]);
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_virtual_partitions_with_manual_offsets_commit_marked_prefix() {
        let topic = TopicSettings {
            manual_offset_management: true,
            virtual_partitions: Some(VirtualPartitionsSettings { max_partitions: 1 }),
            ..TopicSettings::new("orders")
        };
        let harness = harness(
            topic,
            handler(|ctx| {
                // marks are collected and committed once the batch finished
                ctx.mark_as_consumed(&ctx.messages()[2], None)?;
                Ok(())
            }),
        );
        harness.process(0..5).await;

        assert_eq!(harness.client.commits(), vec![3]);
        harness.runtime.shutdown().await.unwrap();
    }

    struct Blocking {
        started: Arc<Notify>,
        gate: Arc<Semaphore>,
    }

    impl Handler for Blocking {
        async fn consume(&self, _ctx: &ConsumeContext<'_>) -> HandlerResult {
            self.started.notify_one();
            let _permit = self.gate.acquire().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_long_running_job_success_resumes() {
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let topic = TopicSettings {
            long_running_job: true,
            ..TopicSettings::new("orders")
        };
        let harness = harness(
            topic,
            Blocking {
                started: Arc::clone(&started),
                gate: Arc::clone(&gate),
            },
        );

        harness
            .runtime
            .submit_batch(partition(), batch(0..5))
            .await
            .unwrap();
        // paused before the job even started
        assert_eq!(harness.client.pauses().len(), 1);
        assert_eq!(harness.client.pauses()[0].0, 0);

        // long-running jobs do not block the poll loop
        tokio::time::timeout(TIMEOUT, started.notified())
            .await
            .unwrap();
        tokio::time::timeout(TIMEOUT, harness.runtime.wait())
            .await
            .unwrap();
        assert!(harness.client.commits().is_empty());

        gate.add_permits(1);
        harness.runtime.shutdown().await.unwrap();

        assert_eq!(harness.client.commits(), vec![5]);
        assert_eq!(harness.client.seeks(), vec![5]);
        assert_eq!(harness.client.resumes(), 1);
    }

    #[tokio::test]
    async fn test_revocation_during_long_running_job() {
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let topic = TopicSettings {
            long_running_job: true,
            ..TopicSettings::new("orders")
        };
        let harness = harness(
            topic,
            Blocking {
                started: Arc::clone(&started),
                gate: Arc::clone(&gate),
            },
        );

        harness
            .runtime
            .submit_batch(partition(), batch(0..5))
            .await
            .unwrap();
        tokio::time::timeout(TIMEOUT, started.notified())
            .await
            .unwrap();
        let revoked = harness.runtime.coordinator(&partition()).unwrap();

        harness.runtime.on_revoke(&partition()).await;
        assert!(revoked.is_revoked());
        assert!(harness.runtime.coordinator(&partition()).is_none());

        // the partition comes back while the old job still runs
        harness.client.clear();
        harness
            .runtime
            .submit_batch(partition(), batch(0..5))
            .await
            .unwrap();
        let fresh = harness.runtime.coordinator(&partition()).unwrap();
        assert!(!Arc::ptr_eq(&revoked, &fresh));
        assert_eq!(fresh.seek_offset(), Some(0));

        gate.add_permits(1);
        harness.runtime.shutdown().await.unwrap();

        // only the fresh assignment committed, seeked and resumed
        assert_eq!(harness.client.commits(), vec![5]);
        assert_eq!(harness.client.seeks(), vec![5]);
        assert_eq!(harness.client.resumes(), 1);
    }

    #[tokio::test]
    async fn test_revocation_suppresses_running_job_commit() {
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let harness = harness(
            TopicSettings::new("orders"),
            Blocking {
                started: Arc::clone(&started),
                gate: Arc::clone(&gate),
            },
        );

        harness
            .runtime
            .submit_batch(partition(), batch(0..5))
            .await
            .unwrap();
        tokio::time::timeout(TIMEOUT, started.notified())
            .await
            .unwrap();

        harness.runtime.on_revoke(&partition()).await;
        gate.add_permits(1);
        harness.runtime.shutdown().await.unwrap();

        assert!(harness.client.commits().is_empty());
        // non long-running partitions are resumed on revocation
        assert_eq!(harness.client.resumes(), 1);
    }

    #[tokio::test]
    async fn test_throttling_defers_messages_beyond_the_limit() {
        let topic = TopicSettings {
            throttling: Some(ThrottlingSettings {
                limit: 3,
                interval_ms: 60_000,
            }),
            ..TopicSettings::new("orders")
        };
        let consumed = Arc::new(Mutex::new(Vec::new()));
        let harness = harness(topic, {
            let consumed = Arc::clone(&consumed);
            handler(move |ctx| {
                consumed
                    .lock()
                    .extend(ctx.messages().iter().map(|m| m.offset));
                Ok(())
            })
        });

        harness.process(0..5).await;
        assert_eq!(*consumed.lock(), vec![0, 1, 2]);
        assert_eq!(harness.client.commits(), vec![3]);
        let pauses = harness.client.pauses();
        assert_eq!(pauses.len(), 1);
        assert_eq!(pauses[0].0, 3);
        assert!(pauses[0].1 <= Duration::from_secs(60));

        // nothing left in this window
        harness.process(3..5).await;
        assert_eq!(consumed.lock().len(), 3);
        assert_eq!(harness.client.pauses().len(), 2);
        assert_eq!(harness.client.pauses()[1].0, 3);
        harness.runtime.shutdown().await.unwrap();
    }

    struct FailingAt(i64);

    impl Perform for FailingAt {
        async fn perform(&self, message: &Message) -> HandlerResult {
            if message.offset == self.0 {
                return Err("job failed".into());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_active_job_marks_each_message() {
        let topic = TopicSettings {
            active_job: true,
            manual_offset_management: true,
            ..TopicSettings::new("orders")
        };
        let harness = harness(topic, ActiveJobHandler::new(FailingAt(3)));
        harness.process(0..6).await;

        assert_eq!(harness.client.commits(), vec![1, 2, 3]);
        // retried from the failed job
        assert_eq!(harness.client.pauses(), vec![(3, Duration::from_millis(200))]);
        harness.runtime.shutdown().await.unwrap();
    }

    struct Ticking {
        ticks: Arc<AtomicUsize>,
    }

    impl Handler for Ticking {
        async fn consume(&self, _ctx: &ConsumeContext<'_>) -> HandlerResult {
            Ok(())
        }

        async fn tick(&self, ctx: &ConsumeContext<'_>) -> HandlerResult {
            assert!(ctx.messages().is_empty());
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_periodic_ticks_on_idle_partitions() {
        let topic = TopicSettings {
            periodic_job: Some(PeriodicJobSettings { interval_ms: 10 }),
            ..TopicSettings::new("orders")
        };
        let ticks = Arc::new(AtomicUsize::new(0));
        let harness = harness(
            topic,
            Ticking {
                ticks: Arc::clone(&ticks),
            },
        );
        harness.runtime.on_assign(&[partition()]);

        // too early
        harness.runtime.schedule_ticks().unwrap();
        tokio::time::timeout(TIMEOUT, harness.runtime.wait())
            .await
            .unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.runtime.schedule_ticks().unwrap();
        tokio::time::timeout(TIMEOUT, harness.runtime.wait())
            .await
            .unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        harness.runtime.shutdown().await.unwrap();
    }

    struct FailingTick;

    impl Handler for FailingTick {
        async fn consume(&self, _ctx: &ConsumeContext<'_>) -> HandlerResult {
            Ok(())
        }

        async fn tick(&self, _ctx: &ConsumeContext<'_>) -> HandlerResult {
            Err("no heartbeat".into())
        }
    }

    #[tokio::test]
    async fn test_failed_tick_is_reported() {
        let topic = TopicSettings {
            periodic_job: Some(PeriodicJobSettings { interval_ms: 0 }),
            ..TopicSettings::new("orders")
        };
        let harness = harness(topic, FailingTick);
        let mut events = harness.runtime.monitor().subscribe();
        harness.runtime.on_assign(&[partition()]);

        harness.runtime.schedule_ticks().unwrap();
        tokio::time::timeout(TIMEOUT, harness.runtime.wait())
            .await
            .unwrap();

        let mut errors = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::Error { error, .. } = event {
                errors.push(error);
            }
        }
        assert_eq!(errors, vec!["Handler Error - no heartbeat".to_string()]);
        // ticks never pause the partition
        assert!(harness.client.actions().is_empty());
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_pauses_are_resumed() {
        let harness = harness(
            TopicSettings::new("orders"),
            handler(|_| Err("boom".into())),
        );
        harness.process(0..1).await;
        assert_eq!(harness.client.pauses().len(), 1);

        harness.runtime.resume_expired_pauses();
        assert_eq!(harness.client.resumes(), 0);

        harness
            .runtime
            .coordinator(&partition())
            .unwrap()
            .pause_tracker()
            .expire();
        harness.runtime.resume_expired_pauses();
        assert_eq!(harness.client.resumes(), 1);
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_revoked_pauses_are_not_resumed() {
        let harness = harness(
            TopicSettings::new("orders"),
            handler(|_| Err("boom".into())),
        );
        harness.process(0..1).await;
        assert_eq!(harness.client.pauses().len(), 1);

        let coordinator = harness.runtime.coordinator(&partition()).unwrap();
        coordinator.revoke();
        coordinator.pause_tracker().expire();
        harness.runtime.resume_expired_pauses();
        assert_eq!(harness.client.resumes(), 0);
        harness.runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unrouted_topics_are_ignored() {
        let harness = harness(TopicSettings::new("orders"), succeed());
        harness
            .runtime
            .submit_batch(
                TopicPartition::new("unknown", 0),
                vec![message("unknown", 0, 0)],
            )
            .await
            .unwrap();
        harness.runtime.shutdown().await.unwrap();
        assert!(harness.client.actions().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting_work() {
        let harness = harness(TopicSettings::new("orders"), succeed());
        harness.runtime.shutdown().await.unwrap();
        assert!(harness.runtime.is_stopping());

        harness
            .runtime
            .submit_batch(partition(), batch(0..3))
            .await
            .unwrap();
        assert!(harness.client.actions().is_empty());
        // idempotent
        harness.runtime.shutdown().await.unwrap();
    }
}
