use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tower::Service;

use super::error::{AlreadyStartedSnafu, ConfigError, EnqueueError, NoRuntimeSnafu, ValidationSnafu};
use super::internal_event::{InternalEvent, MessageEnqueued};
use super::message::{Mailbox, MessageRequest, OutboundMessage};
use super::notifier::{DeliveryFailure, DeliveryReceipt, Notifier, SubscriptionId};
use super::queue::PendingQueue;
use super::stats::{DispatchCounters, DispatchStats};
use super::worker::DispatchLoop;
use super::DispatcherSettings;
use crate::Error;

/// State shared between producers and the dispatch loop.
pub(crate) struct Shared<R> {
    pub(crate) settings: DispatcherSettings,
    pub(crate) queue: PendingQueue<Arc<OutboundMessage>>,
    pub(crate) notifier: Notifier<R>,
    pub(crate) counters: DispatchCounters,
}

/// Producer-facing handle to a rate-paced outbound mail queue.
///
/// Cloning is cheap; every clone feeds the same queue. The delivery client
/// `S` is handed to the dispatch loop by [`Dispatcher::start`] and is never
/// used concurrently.
pub struct Dispatcher<S>
where
    S: Service<Arc<OutboundMessage>>,
{
    shared: Arc<Shared<S::Response>>,
    client: Arc<Mutex<Option<S>>>,
}

impl<S> Clone for Dispatcher<S>
where
    S: Service<Arc<OutboundMessage>>,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            client: Arc::clone(&self.client),
        }
    }
}

impl<S> fmt::Debug for Dispatcher<S>
where
    S: Service<Arc<OutboundMessage>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("settings", &self.shared.settings)
            .field("queued", &self.shared.queue.len())
            .finish_non_exhaustive()
    }
}

impl<S> Dispatcher<S>
where
    S: Service<Arc<OutboundMessage>>,
{
    /// Validates `settings` and wraps `client`. Nothing runs until
    /// [`Dispatcher::start`] is called.
    pub fn new(settings: DispatcherSettings, client: S) -> Result<Self, ConfigError> {
        settings.validate()?;

        Ok(Self {
            shared: Arc::new(Shared {
                settings,
                queue: PendingQueue::new(),
                notifier: Notifier::new(),
                counters: DispatchCounters::default(),
            }),
            client: Arc::new(Mutex::new(Some(client))),
        })
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.shared.settings
    }

    /// Validates and queues a message. See [`Dispatcher::enqueue_with`].
    pub fn enqueue(&self, request: MessageRequest) -> Result<(), EnqueueError> {
        self.enqueue_with(request, |message| message)
    }

    /// Validates a message, lets `build` attach caller metadata to it, and
    /// appends it to the queue.
    ///
    /// The sender falls back to the configured default when the request
    /// names none. Fails without touching the queue when either the
    /// resolved sender or the target address is blank.
    pub fn enqueue_with<F>(&self, request: MessageRequest, build: F) -> Result<(), EnqueueError>
    where
        F: FnOnce(OutboundMessage) -> OutboundMessage,
    {
        let settings = &self.shared.settings;
        let MessageRequest {
            to,
            subject,
            body_html,
            from,
            from_name,
        } = request;

        let sender = non_blank(from)
            .or_else(|| non_blank(settings.default_sender_address.clone()))
            .context(ValidationSnafu {
                field: "sender address",
            })?;
        let to = non_blank(Some(to)).context(ValidationSnafu {
            field: "target address",
        })?;

        let mut from = Mailbox::new(sender);
        from.display_name =
            non_blank(from_name).or_else(|| non_blank(settings.default_sender_display_name.clone()));

        let message = Arc::new(build(OutboundMessage::new(from, to, subject, body_html)));
        let queue_depth = self.shared.queue.push(Arc::clone(&message));
        self.shared.counters.record_enqueued();
        MessageEnqueued {
            message: &message,
            queue_depth,
        }
        .emit();
        Ok(())
    }

    /// Whether every enqueued message has been attempted and notified.
    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    /// Messages still waiting, including the one being sent.
    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    /// Waits until the queue is empty, checking every
    /// `drain_poll_interval`.
    ///
    /// Returns immediately if the queue is already empty. Waits forever on a
    /// dispatcher that was never started or has been stopped with work left.
    pub async fn wait_for_drain(&self) {
        while !self.is_empty() {
            tokio::time::sleep(self.shared.settings.drain_poll_interval).await;
        }
    }

    /// Like [`Dispatcher::wait_for_drain`], giving up after `limit`.
    /// Returns `true` if the queue drained in time.
    pub async fn wait_for_drain_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_for_drain()).await.is_ok()
    }

    pub fn on_success<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&DeliveryReceipt<S::Response>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.shared.notifier.on_success(observer)
    }

    pub fn on_failure<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&DeliveryFailure) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.shared.notifier.on_failure(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.notifier.unsubscribe(id)
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.counters.snapshot()
    }
}

impl<S> Dispatcher<S>
where
    S: Service<Arc<OutboundMessage>> + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
    S::Error: Into<Error> + Send,
{
    /// Spawns the dispatch loop on the current Tokio runtime.
    ///
    /// Can succeed only once per dispatcher. The loop keeps running if the
    /// returned handle is dropped; use [`DispatcherHandle::stop`] to end it.
    pub fn start(&self) -> Result<DispatcherHandle, ConfigError> {
        let runtime = tokio::runtime::Handle::try_current().context(NoRuntimeSnafu)?;
        let client = self
            .client
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context(AlreadyStartedSnafu)?;

        let shutdown = CancellationToken::new();
        let dispatch_loop = DispatchLoop::new(Arc::clone(&self.shared), client, shutdown.clone());
        let task = runtime.spawn(dispatch_loop.run());

        Ok(DispatcherHandle { shutdown, task })
    }
}

/// Owner handle of a running dispatch loop.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Asks the loop to stop at its next suspension point and waits for it.
    ///
    /// A send already in progress completes and is notified first. Messages
    /// not yet attempted stay queued.
    pub async fn stop(self) -> Result<(), JoinError> {
        self.shutdown.cancel();
        self.task.await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
