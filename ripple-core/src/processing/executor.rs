use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::client::{Client, Producer};
use crate::context::ConsumeContext;
use crate::handler::Handler;
use crate::message::Message;
use crate::monitor::{Event, Monitor};
use crate::processing::coordinator::Coordinator;
use crate::processing::job::{Job, JobKind};
use crate::routing::Topic;
use crate::strategy::lifecycle::Lifecycle;
use crate::{Error, HandlerError, HandlerResult, Result};

/// Runs jobs through the lifecycle of their topic's strategy. Shared by all workers.
pub(crate) struct Executor<H> {
    pub(crate) handler: Arc<H>,
    pub(crate) client: Arc<dyn Client>,
    pub(crate) producer: Arc<dyn Producer>,
    pub(crate) monitor: Monitor,
    pub(crate) stop: CancellationToken,
}

impl<H: Handler> Executor<H> {
    pub(crate) fn lifecycle<'a>(
        &'a self,
        topic: &'a Topic,
        coordinator: &'a Coordinator,
    ) -> Lifecycle<'a> {
        Lifecycle {
            topic,
            coordinator,
            client: self.client.as_ref(),
            producer: self.producer.as_ref(),
            monitor: &self.monitor,
            stopping: self.stop.is_cancelled(),
        }
    }

    /// Executes `job`. Only fatal errors are returned, the worker running the job has to stop.
    pub(crate) async fn execute(&self, job: &Job) -> Result<()> {
        match &job.kind {
            JobKind::Consume { messages } => self.consume(job, messages).await,
            JobKind::Tick => {
                self.tick(job).await;
                Ok(())
            }
        }
    }

    async fn consume(&self, job: &Job, messages: &[Arc<Message>]) -> Result<()> {
        let coordinator = job.coordinator.as_ref();
        let segment = job.group_id.segment;
        let lifecycle = self.lifecycle(&job.topic, coordinator);

        lifecycle.before_consume();

        // a job that waited in the queue while its partition was revoked is not run at all
        let result = if coordinator.is_revoked() {
            Ok(())
        } else {
            self.monitor.instrument(Event::Consume {
                partition: coordinator.partition().clone(),
                segment,
                messages: messages.len(),
            });
            let ctx = ConsumeContext::new(
                messages,
                segment,
                &job.topic,
                coordinator,
                self.client.as_ref(),
                &self.monitor,
                &self.stop,
            );
            guarded(self.handler.consume(&ctx)).await
        };

        lifecycle.after_job(segment, messages, result)?;
        coordinator.touch();

        // the last job of the batch re-reads the stop signal, it may have arrived meanwhile
        let lifecycle = self.lifecycle(&job.topic, coordinator);
        if let Err(e) = lifecycle.after_consume() {
            if e.is_fatal() {
                return Err(e);
            }
            error!(group = %job.group_id, error = %e, "After consume failed, retrying batch");
            self.monitor.instrument(Event::Error {
                partition: Some(coordinator.partition().clone()),
                error: e.to_string(),
            });
            if let Err(e) = lifecycle.actions().retry_after_pause() {
                error!(group = %job.group_id, error = %e, "Pausing for retry failed");
            }
        }
        Ok(())
    }

    async fn tick(&self, job: &Job) {
        let coordinator = job.coordinator.as_ref();
        if coordinator.is_revoked() {
            return;
        }
        self.lifecycle(&job.topic, coordinator).tick();

        let ctx = ConsumeContext::new(
            &[],
            job.group_id.segment,
            &job.topic,
            coordinator,
            self.client.as_ref(),
            &self.monitor,
            &self.stop,
        );
        if let Err(e) = guarded(self.handler.tick(&ctx)).await {
            let e = Error::Handler(e.to_string());
            warn!(group = %job.group_id, error = %e, "Tick failed");
            self.monitor.instrument(Event::Error {
                partition: Some(coordinator.partition().clone()),
                error: e.to_string(),
            });
        }
        coordinator.touch();
    }
}

/// Turns a panic of user code into a regular failure.
async fn guarded(future: impl Future<Output = HandlerResult>) -> HandlerResult {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            Err(HandlerError::from(message))
        }
    }
}
