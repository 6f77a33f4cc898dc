use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};

use super::dispatcher::Shared;
use super::internal_event::{
    DispatchThrottled, DispatcherIdle, InternalEvent, MessageDelivered, MessageFailed,
    ObserverErrors,
};
use super::message::OutboundMessage;
use super::notifier::{DeliveryFailure, DeliveryReceipt, DispatchOutcome};
use super::pacing::{PacingDecision, PacingWindow};
use crate::Error;

/// The single consumer of the queue.
///
/// ```text
///  CHECK ──empty──► reset window ──► SLEEP(idle) ──► CHECK
///    │
///    └─head──► THROTTLE? ──► SEND ──► NOTIFY ──► DEQUEUE ──► CHECK
/// ```
///
/// The head message stays in the queue until its outcome has been
/// delivered to observers, so an empty queue means every message has been
/// attempted and reported.
pub(crate) struct DispatchLoop<S>
where
    S: Service<Arc<OutboundMessage>>,
{
    shared: Arc<Shared<S::Response>>,
    client: S,
    pacing: PacingWindow,
    shutdown: CancellationToken,
}

impl<S> DispatchLoop<S>
where
    S: Service<Arc<OutboundMessage>>,
    S::Error: Into<Error>,
{
    pub(crate) fn new(shared: Arc<Shared<S::Response>>, client: S, shutdown: CancellationToken) -> Self {
        let pacing = PacingWindow::new(shared.settings.rate_limit, shared.settings.throttle_tick);
        Self {
            shared,
            client,
            pacing,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            message = "Dispatch loop started.",
            rate_limit = self.shared.settings.rate_limit,
            idle_poll_interval_ms = self.shared.settings.idle_poll_interval.as_millis(),
        );

        while !self.shutdown.is_cancelled() {
            let Some(message) = self.shared.queue.peek() else {
                self.pacing.reset();
                if !self.idle().await {
                    break;
                }
                continue;
            };

            if let PacingDecision::Throttle(delay) = self.pacing.check(Instant::now()) {
                self.shared.counters.record_throttled();
                DispatchThrottled {
                    delay,
                    burst_index: self.pacing.count() - 1,
                }
                .emit();
                if !pause(&self.shutdown, delay).await {
                    break;
                }
            }

            self.dispatch(Arc::clone(&message)).await;

            let removed = self.shared.queue.pop();
            debug_assert!(removed.is_some_and(|head| Arc::ptr_eq(&head, &message)));
        }

        info!(
            message = "Dispatch loop stopped.",
            queued = self.shared.queue.len(),
        );
    }

    /// Sends one message and reports the outcome. Never fails: delivery
    /// errors are turned into failure notifications.
    async fn dispatch(&mut self, message: Arc<OutboundMessage>) {
        let started = Instant::now();
        let result = match self.client.ready().await {
            Ok(client) => client.call(Arc::clone(&message)).await,
            Err(error) => Err(error),
        };
        let elapsed = started.elapsed();

        let outcome = match result.map_err(Into::into) {
            Ok(response) => {
                MessageDelivered {
                    message: &message,
                    elapsed,
                }
                .emit();
                DispatchOutcome::Delivered(DeliveryReceipt { message, response })
            }
            Err(error) => {
                MessageFailed {
                    message: &message,
                    error: &error,
                    elapsed,
                }
                .emit();
                DispatchOutcome::Failed(DeliveryFailure { message, error })
            }
        };

        let observer_errors = self.shared.notifier.notify(&outcome);
        ObserverErrors {
            count: observer_errors,
        }
        .emit();
        self.shared
            .counters
            .record_attempt(outcome.is_delivered(), observer_errors);
    }

    async fn idle(&mut self) -> bool {
        let interval = self.shared.settings.idle_poll_interval;
        self.shared.counters.record_idle_sleep();
        DispatcherIdle { interval }.emit();
        pause(&self.shutdown, interval).await
    }
}

/// Sleeps for `duration` unless shutdown is requested first. Returns
/// `false` on shutdown.
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = sleep(duration) => true,
    }
}
