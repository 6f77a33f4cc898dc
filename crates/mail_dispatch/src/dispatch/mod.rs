//! Queue, pace, send and notify outbound mail through a single consumer.

mod dispatcher;
mod error;
pub mod internal_event;
mod message;
mod notifier;
pub mod pacing;
mod queue;
mod stats;
mod worker;

use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};

pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use error::{ConfigError, EnqueueError};
pub use message::{Mailbox, MessageRequest, OutboundMessage};
pub use notifier::{
    DeliveryFailure, DeliveryReceipt, DispatchOutcome, FailureObserver, Notifier, SubscriptionId,
    SuccessObserver,
};
pub use pacing::{PacingDecision, PacingWindow};
pub use queue::PendingQueue;
pub use stats::DispatchStats;

/// Configuration of the dispatch loop.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `rate_limit` | 20 | Maximum messages sent per elapsed second of a burst |
/// | `idle_poll_interval` | 30s | Sleep between queue checks while the queue is empty |
/// | `throttle_tick` | 1s | Delay injected before a send that would exceed the budget |
/// | `drain_poll_interval` | 1s | Poll period of [`Dispatcher::wait_for_drain`] |
/// | `default_sender_address` | none | Sender used when a request names none |
/// | `default_sender_display_name` | none | Display name paired with the default sender |
///
/// Settings deserialize from camelCase keys with millisecond durations
/// (`rateLimit`, `idlePollIntervalMs`, `throttleTickMs`, `drainPollIntervalMs`,
/// `defaultSenderAddress`, `defaultSenderDisplayName`).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use mail_dispatch::dispatch::DispatcherSettings;
///
/// let settings = DispatcherSettings::builder()
///     .rate_limit(14)
///     .idle_poll_interval(Duration::from_secs(5))
///     .default_sender_address("noreply@example.com")
///     .build();
/// assert_eq!(settings.rate_limit(), 14);
/// ```
#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DispatcherSettings {
    /// Messages per second the delivery service accepts.
    ///
    /// The budget is a ceiling over whole elapsed seconds since the first
    /// message of the current burst, so short bursts up to this size are
    /// sent back to back.
    #[builder(default = default_rate_limit())]
    #[serde(default = "default_rate_limit")]
    pub(crate) rate_limit: u32,

    /// How long the loop sleeps when it finds the queue empty.
    ///
    /// This bounds the latency between an enqueue into an idle dispatcher
    /// and the send; it is a lower bound on how quickly idleness is noticed,
    /// not a precise timer.
    #[builder(default = default_idle_poll_interval())]
    #[serde(
        rename = "idlePollIntervalMs",
        with = "duration_ms",
        default = "default_idle_poll_interval"
    )]
    pub(crate) idle_poll_interval: Duration,

    /// Delay applied before a send that would exceed the rate budget.
    #[builder(default = default_throttle_tick())]
    #[serde(
        rename = "throttleTickMs",
        with = "duration_ms",
        default = "default_throttle_tick"
    )]
    pub(crate) throttle_tick: Duration,

    /// Poll period used while waiting for the queue to drain.
    #[builder(default = default_drain_poll_interval())]
    #[serde(
        rename = "drainPollIntervalMs",
        with = "duration_ms",
        default = "default_drain_poll_interval"
    )]
    pub(crate) drain_poll_interval: Duration,

    /// Sender address used when an enqueue request does not name one.
    #[builder(into)]
    #[serde(default)]
    pub(crate) default_sender_address: Option<String>,

    /// Display name used alongside the default sender.
    #[builder(into)]
    #[serde(default)]
    pub(crate) default_sender_display_name: Option<String>,
}

const fn default_rate_limit() -> u32 {
    20
}

const fn default_idle_poll_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_throttle_tick() -> Duration {
    Duration::from_secs(1)
}

const fn default_drain_poll_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            idle_poll_interval: default_idle_poll_interval(),
            throttle_tick: default_throttle_tick(),
            drain_poll_interval: default_drain_poll_interval(),
            default_sender_address: None,
            default_sender_display_name: None,
        }
    }
}

impl DispatcherSettings {
    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    pub fn idle_poll_interval(&self) -> Duration {
        self.idle_poll_interval
    }

    pub fn throttle_tick(&self) -> Duration {
        self.throttle_tick
    }

    pub fn drain_poll_interval(&self) -> Duration {
        self.drain_poll_interval
    }

    pub fn default_sender_address(&self) -> Option<&str> {
        self.default_sender_address.as_deref()
    }

    pub fn default_sender_display_name(&self) -> Option<&str> {
        self.default_sender_display_name.as_deref()
    }

    /// Checks the settings for values the dispatch loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        use snafu::ensure;

        ensure!(self.rate_limit > 0, error::ZeroRateLimitSnafu);
        for (name, interval) in [
            ("idle poll interval", self.idle_poll_interval),
            ("throttle tick", self.throttle_tick),
            ("drain poll interval", self.drain_poll_interval),
        ] {
            ensure!(!interval.is_zero(), error::ZeroIntervalSnafu { name });
        }
        if let Some(address) = &self.default_sender_address {
            ensure!(!address.trim().is_empty(), error::BlankDefaultSenderSnafu);
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
