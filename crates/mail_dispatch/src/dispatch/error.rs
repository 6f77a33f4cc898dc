use snafu::Snafu;

/// Errors that leave a dispatcher unable to run.
///
/// Returned from [`super::Dispatcher::new`] and [`super::Dispatcher::start`]
/// so callers find out at construction time instead of through missing
/// notifications later.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    /// The rate limit must allow at least one message per second.
    #[snafu(display("rate limit must allow at least one message per second"))]
    ZeroRateLimit,

    /// A timing setting was zero, which would turn the loop into a busy spin.
    #[snafu(display("{name} must be greater than zero"))]
    ZeroInterval { name: &'static str },

    /// A default sender was configured but contains only whitespace.
    #[snafu(display("default sender address is blank"))]
    BlankDefaultSender,

    /// `start` was called more than once on the same dispatcher.
    #[snafu(display("dispatch loop has already been started"))]
    AlreadyStarted,

    /// `start` was called outside of a Tokio runtime.
    #[snafu(display("dispatch loop must be started inside a Tokio runtime: {source}"))]
    NoRuntime {
        source: tokio::runtime::TryCurrentError,
    },
}

/// Errors returned synchronously from an enqueue call.
///
/// A failed enqueue never mutates the queue.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EnqueueError {
    #[snafu(display("cannot enqueue message: {field} is missing or blank"))]
    Validation { field: &'static str },
}
