//! Rate-paced outbound mail dispatcher.
//!
//! Producers enqueue messages from any thread or task; a single background
//! dispatch loop drains the queue in FIFO order, paces sends so a
//! rate-limited delivery service never sees more than `rate_limit` messages
//! per elapsed second of a burst, and reports every attempt to registered
//! success/failure observers.
//!
//! # Lifecycle
//! 1. Build [`dispatch::DispatcherSettings`] (or use the defaults).
//! 2. Construct a [`dispatch::Dispatcher`] around any
//!    `tower::Service<Arc<OutboundMessage>>` delivery client. Invalid
//!    settings are returned as [`dispatch::ConfigError`].
//! 3. Call [`dispatch::Dispatcher::start`] inside a Tokio runtime to spawn
//!    the dispatch loop, and keep the returned handle to stop it later.
//!
//! # Pacing
//! The loop tracks a window per burst (a stretch of time during which the
//! queue never empties). The first message of a burst is sent immediately;
//! message `n` of the burst is delayed by one throttle tick whenever
//! `n > max(1, ceil(elapsed_secs)) * rate_limit`. The window resets each time
//! the queue is observed empty.
//!
//! # Basic Usage
//! ```no_run
//! use std::sync::Arc;
//! use mail_dispatch::dispatch::{Dispatcher, DispatcherSettings, MessageRequest, OutboundMessage};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = tower::service_fn(|message: Arc<OutboundMessage>| async move {
//!     Ok::<_, mail_dispatch::Error>(format!("sent to {}", message.primary_recipient()))
//! });
//!
//! let settings = DispatcherSettings::builder()
//!     .rate_limit(14)
//!     .default_sender_address("noreply@example.com".to_string())
//!     .build();
//! let dispatcher = Dispatcher::new(settings, client)?;
//! dispatcher.on_failure(|failure| {
//!     eprintln!("could not deliver: {}", failure.description());
//!     Ok(())
//! });
//!
//! let handle = dispatcher.start()?;
//! dispatcher.enqueue(
//!     MessageRequest::builder()
//!         .to("ada@example.com")
//!         .subject("Welcome")
//!         .body_html("<p>Hello!</p>")
//!         .build(),
//! )?;
//! dispatcher.wait_for_drain().await;
//! handle.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits counters and gauges through the `metrics` facade; see
//! [`dispatch::internal_event`].
pub mod dispatch;

#[macro_use]
extern crate tracing;

pub use dispatch::{
    ConfigError, DeliveryFailure, DeliveryReceipt, DispatchOutcome, DispatchStats, Dispatcher,
    DispatcherHandle, DispatcherSettings, EnqueueError, Mailbox, MessageRequest, OutboundMessage,
    SubscriptionId,
};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
