//! User business logic.

use std::future::Future;

use crate::HandlerResult;
use crate::context::ConsumeContext;
use crate::message::{Message, TopicPartition};

/// Business logic driven by the runtime. One handler serves every topic of the consumer group.
///
/// An error returned from [`Handler::consume`] fails the batch; what happens next (retry,
/// dead-letter dispatch) is decided by the topic's strategy. Panics are treated like errors.
pub trait Handler: Send + Sync + 'static {
    fn consume(&self, ctx: &ConsumeContext<'_>) -> impl Future<Output = HandlerResult> + Send;

    /// Called once the partition was taken away from this consumer.
    fn revoked(&self, _partition: &TopicPartition) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Periodic callback of topics with a periodic job, see the `periodic_job` topic setting.
    fn tick(&self, _ctx: &ConsumeContext<'_>) -> impl Future<Output = HandlerResult> + Send {
        async { Ok(()) }
    }
}

/// A job executed for every message of an active job topic.
pub trait Perform: Send + Sync + 'static {
    fn perform(&self, message: &Message) -> impl Future<Output = HandlerResult> + Send;
}

/// Runs active jobs one message at a time, marking each after it succeeded. Stops early when the
/// partition is revoked or the process is stopping, the rest is redelivered.
#[derive(Debug, Clone)]
pub struct ActiveJobHandler<P> {
    performer: P,
}

impl<P: Perform> ActiveJobHandler<P> {
    pub fn new(performer: P) -> Self {
        ActiveJobHandler { performer }
    }
}

impl<P: Perform> Handler for ActiveJobHandler<P> {
    async fn consume(&self, ctx: &ConsumeContext<'_>) -> HandlerResult {
        for message in ctx.messages() {
            if ctx.is_revoked() || ctx.is_stopping() {
                break;
            }
            self.performer.perform(message).await?;
            ctx.mark_as_consumed(message, None)?;
        }
        Ok(())
    }
}
