use std::sync::Arc;
use std::time::Duration;

use ripple_throttling::RateLimiter;
use tracing::{debug, info, warn};

use crate::client::{Client, CommitMode, DeadLetter, Producer};
use crate::message::Message;
use crate::monitor::{Event, Monitor};
use crate::processing::coordinator::{Coordinator, Throttle};
use crate::routing::Topic;
use crate::strategy::actions::Actions;
use crate::strategy::{
    BeforeEnqueue, BeforeScheduleConsume, Consume, OnFailure, OnSuccess, Revoked, Strategy,
};
use crate::{Error, HandlerResult, Result};

/// Long-running jobs pause "forever", the pause tracker clamps this to its maximum.
const LONG_RUNNING_PAUSE: Duration = Duration::MAX;

/// Messages admitted for processing by `before_schedule_consume`.
#[derive(Debug)]
pub(crate) struct Admitted {
    pub(crate) messages: Vec<Arc<Message>>,
    pub(crate) throttle: Option<Throttle>,
}

/// The hooks of a topic's [`Strategy`] bound to one partition.
#[derive(Clone, Copy)]
pub(crate) struct Lifecycle<'a> {
    pub(crate) topic: &'a Topic,
    pub(crate) coordinator: &'a Coordinator,
    pub(crate) client: &'a dyn Client,
    pub(crate) producer: &'a dyn Producer,
    pub(crate) monitor: &'a Monitor,
    pub(crate) stopping: bool,
}

impl<'a> Lifecycle<'a> {
    fn strategy(&self) -> &'a Strategy {
        self.topic.strategy()
    }

    pub(crate) fn actions(&self) -> Actions<'a> {
        Actions::new(self.coordinator, self.client, self.monitor)
    }

    /// Runs on the poll side before jobs are built. With throttling only the part of the batch
    /// the rate limit admits is processed; when nothing is admitted the partition is paused
    /// until the next window and `None` is returned.
    pub(crate) async fn before_schedule_consume(
        &self,
        messages: Vec<Arc<Message>>,
    ) -> Result<Option<Admitted>> {
        let partition = self.coordinator.partition();
        self.monitor.instrument(Event::BeforeScheduleConsume {
            partition: partition.clone(),
            messages: messages.len(),
        });

        let rate_limit = match self.strategy().before_schedule_consume {
            BeforeScheduleConsume::Instrument => None,
            BeforeScheduleConsume::Throttle => self.coordinator.rate_limit(),
        };
        let Some(rate_limit) = rate_limit else {
            return Ok(Some(Admitted {
                messages,
                throttle: None,
            }));
        };

        let admitted = rate_limit.acquire_n(Some(messages.len()), None).await;
        if admitted >= messages.len() {
            return Ok(Some(Admitted {
                messages,
                throttle: None,
            }));
        }

        let mut messages = messages;
        let throttle = Throttle {
            offset: messages[admitted].offset,
            timeout: rate_limit.window_remaining(),
        };
        if admitted == 0 {
            self.throttle(throttle)?;
            return Ok(None);
        }
        debug!(%partition, admitted, deferred = messages.len() - admitted, "Throttling batch");
        messages.truncate(admitted);
        Ok(Some(Admitted {
            messages,
            throttle: Some(throttle),
        }))
    }

    fn throttle(&self, throttle: Throttle) -> Result<()> {
        self.actions()
            .pause(throttle.offset, Some(throttle.timeout), false)?;
        self.monitor.instrument(Event::Throttled {
            partition: self.coordinator.partition().clone(),
            offset: throttle.offset,
            timeout: throttle.timeout,
        });
        Ok(())
    }

    /// Runs once per batch right before its jobs are enqueued.
    pub(crate) fn before_enqueue(&self) -> Result<()> {
        let actions = self.actions();
        let coordinator = self.coordinator;
        let strategy = self.strategy();
        coordinator
            .on_enqueued(|| match strategy.before_enqueue {
                BeforeEnqueue::Noop => Ok(()),
                BeforeEnqueue::PauseLongRunning => match coordinator.seek_offset() {
                    Some(offset) => actions.pause(offset, Some(LONG_RUNNING_PAUSE), false),
                    None => Ok(()),
                },
            })
            .unwrap_or(Ok(()))
    }

    /// Counts one more attempt, once per batch no matter how many jobs it has.
    pub(crate) fn before_consume(&self) {
        self.coordinator
            .on_started(|| self.coordinator.pause_tracker().increment());
    }

    /// Records the outcome of one job of the batch.
    pub(crate) fn after_job(
        &self,
        segment: usize,
        messages: &[Arc<Message>],
        result: HandlerResult,
    ) -> Result<()> {
        let partition = self.coordinator.partition();
        match result {
            Ok(()) => {
                self.monitor.instrument(Event::Consumed {
                    partition: partition.clone(),
                    segment,
                    messages: messages.len(),
                });
                if self.strategy().consume == Consume::VirtualAutoMark
                    && let Some(last) = messages.last()
                {
                    self.coordinator.mark_virtual(last.offset);
                }
                self.coordinator.success();
            }
            Err(e) => {
                warn!(%partition, segment, error = %e, "Consumption failed");
                self.monitor.instrument(Event::ConsumeFailed {
                    partition: partition.clone(),
                    segment,
                    error: e.to_string(),
                });
                self.coordinator.failure(e);
            }
        }
        self.coordinator.decrement()
    }

    /// Applies the strategy's after-consume policy, exactly once per batch, by the job that
    /// finishes last.
    pub(crate) fn after_consume(&self) -> Result<()> {
        self.coordinator
            .on_finished(|last| self.finish(&last))
            .unwrap_or(Ok(()))
    }

    fn finish(&self, last: &Message) -> Result<()> {
        if self.coordinator.is_revoked() {
            debug!(partition = %self.coordinator.partition(), "Skipping after consume of a revoked partition");
            return Ok(());
        }
        if self.coordinator.is_success() {
            self.on_success(last)
        } else {
            self.on_failure(last)
        }
    }

    fn on_success(&self, last: &Message) -> Result<()> {
        let policy = self.strategy().after_consume;
        let actions = self.actions();
        self.coordinator.pause_tracker().reset();

        // a user pause wins over everything automatic
        if self.coordinator.is_manual_pause() {
            return Ok(());
        }
        let manual_seek = self.coordinator.is_manual_seek();

        if !manual_seek && !(policy.skip_mark_when_stopping && self.stopping) {
            match policy.on_success {
                OnSuccess::MarkLast => {
                    actions.commit(last.offset, None, CommitMode::Async)?;
                }
                OnSuccess::MarkVirtual => {
                    if let Some(markable) = self.coordinator.virtual_markable() {
                        actions.commit(markable, None, CommitMode::Async)?;
                    }
                }
                OnSuccess::Skip => {}
            }
        }

        if policy.throttled
            && let Some(throttle) = self.coordinator.throttle()
        {
            return self.throttle(throttle);
        }

        if policy.long_running {
            if !manual_seek && let Some(offset) = self.coordinator.seek_offset() {
                actions.seek(offset, false)?;
            }
            actions.resume()?;
        }
        Ok(())
    }

    fn on_failure(&self, last: &Message) -> Result<()> {
        let policy = self.strategy().after_consume;
        let actions = self.actions();

        if policy.virtual_partitions && self.coordinator.is_virtual() {
            if let Some(markable) = self.coordinator.virtual_markable() {
                actions.commit(markable, None, CommitMode::Async)?;
            }
            // redeliveries of the failed range are processed without virtual partitions
            self.coordinator.collapse_until(last.offset);
        }

        match policy.on_failure {
            OnFailure::Retry => actions.retry_after_pause(),
            OnFailure::DeadLetter { mark } => {
                let max_retries = self
                    .topic
                    .dead_letter_queue
                    .as_ref()
                    .map_or(0, |dlq| dlq.max_retries);
                if self.coordinator.pause_tracker().attempt() <= max_retries {
                    actions.retry_after_pause()
                } else {
                    self.skip(mark)
                }
            }
        }
    }

    /// Gives up on the first unprocessed message: dispatches it to the dead-letter topic, moves
    /// past it and continues after a regular pause.
    fn skip(&self, mark: bool) -> Result<()> {
        let skippable = self.skippable_message()?;
        self.coordinator.pause_tracker().reset();

        if let Some(topic) = self
            .topic
            .dead_letter_queue
            .as_ref()
            .and_then(|dlq| dlq.topic.as_deref())
        {
            self.dispatch(&skippable, topic)?;
        } else {
            info!(
                partition = %self.coordinator.partition(),
                offset = skippable.offset,
                "Dead-letter dispatch disabled, dropping message"
            );
        }

        let actions = self.actions();
        if mark {
            actions.commit(skippable.offset, None, CommitMode::Async)?;
        } else {
            self.coordinator.advance_seek_offset(skippable.offset + 1);
        }
        match self.coordinator.seek_offset() {
            Some(offset) => actions.pause(offset, None, false),
            None => Ok(()),
        }
    }

    /// First message of the current batch at or after the seek offset. Offsets may have gaps.
    fn skippable_message(&self) -> Result<Arc<Message>> {
        let seek_offset = self.coordinator.seek_offset();
        self.coordinator
            .messages()
            .iter()
            .find(|m| seek_offset.is_some_and(|offset| m.offset >= offset))
            .map(Arc::clone)
            .ok_or_else(|| Error::SkipMessageNotFound {
                topic: self.topic.name.to_string(),
                partition: self.coordinator.partition().partition,
                offset: seek_offset,
            })
    }

    fn dispatch(&self, message: &Message, topic: &str) -> Result<()> {
        let mut record = DeadLetter {
            topic: topic.to_string(),
            key: None,
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        };
        if let Some(enhancer) = self.topic.enhancer.as_ref() {
            enhancer.enhance(message, &mut record);
        }

        // forced after the enhancer, ordering depends on topic and key
        record.topic = topic.to_string();
        record.key = Some(message.partition.to_string());
        record.headers.extend([
            ("original_topic".to_string(), message.topic.to_string()),
            (
                "original_partition".to_string(),
                message.partition.to_string(),
            ),
            ("original_offset".to_string(), message.offset.to_string()),
            (
                "original_consumer_group".to_string(),
                self.topic.consumer_group.to_string(),
            ),
        ]);

        self.producer.produce(record)?;
        self.monitor.instrument(Event::DeadLetterDispatched {
            partition: self.coordinator.partition().clone(),
            offset: message.offset,
            topic: topic.to_string(),
        });
        Ok(())
    }

    /// Runs once when the partition is lost. Long-running jobs never resume a partition that was
    /// taken away.
    pub(crate) fn revoked(&self) {
        let actions = self.actions();
        let coordinator = self.coordinator;
        let strategy = self.strategy();
        coordinator.on_revoked(|| {
            // resuming must happen first, actions of a revoked coordinator are no-ops
            if strategy.revoked == Revoked::ResumeAndRevoke
                && let Err(e) = actions.resume()
            {
                debug!(partition = %coordinator.partition(), error = %e, "Resume of revoked partition failed");
            }
            coordinator.revoke();
        });
        self.monitor.instrument(Event::Revoked {
            partition: coordinator.partition().clone(),
        });
    }

    pub(crate) fn before_schedule_tick(&self) {
        self.monitor.instrument(Event::BeforeScheduleTick {
            partition: self.coordinator.partition().clone(),
        });
    }

    pub(crate) fn tick(&self) {
        self.monitor.instrument(Event::Tick {
            partition: self.coordinator.partition().clone(),
        });
    }
}
