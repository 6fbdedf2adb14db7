//! The poll loop of one consumer: fetches batches, forwards rebalances and drives the periodic
//! work of the runtime.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::client::{Poller, Polled};
use crate::handler::Handler;
use crate::monitor::Event;
use crate::runtime::Runtime;

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener<P, H> {
    poller: P,
    runtime: Arc<Runtime<H>>,
}

impl<P: Poller, H: Handler> Listener<P, H> {
    pub fn new(poller: P, runtime: Arc<Runtime<H>>) -> Self {
        Listener { poller, runtime }
    }

    /// Polls until `cancel` fires, then shuts the runtime down. A failing poll cycle shuts the
    /// runtime down as well and its error is returned.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(topics = ?self.runtime.routes().names(), "Starting listener");
        let polling = self.poll_loop(&cancel).await;
        if let Err(e) = &polling {
            error!(error = %e, "Listener failed, shutting down the runtime");
        } else {
            info!("Listener cancelled, shutting down the runtime");
        }

        let shutdown = self.runtime.shutdown().await;
        polling?;
        shutdown
    }

    async fn poll_loop(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                polled = self.poller.poll() => polled,
            };

            match polled {
                Ok(polled) => self.dispatch(polled).await?,
                Err(e) => {
                    error!(error = %e, "Polling failed");
                    self.runtime.monitor().instrument(Event::Error {
                        partition: None,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                }
            }

            self.runtime.resume_expired_pauses();
            self.runtime.schedule_ticks()?;

            // backpressure, the next poll waits for the blocking jobs of this one
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = self.runtime.wait() => {}
            }
        }
    }

    async fn dispatch(&self, polled: Polled) -> Result<()> {
        for partition in &polled.revoked {
            self.runtime.on_revoke(partition).await;
        }
        if !polled.assigned.is_empty() {
            info!(partitions = ?polled.assigned, "Partitions assigned");
            self.runtime.on_assign(&polled.assigned);
        }
        self.runtime.submit(polled.batches).await
    }
}
