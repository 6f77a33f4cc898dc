//! Coarse ceiling-based pacing for a rate-limited delivery service.
//!
//! A window opens on the first message of a burst. Message `n` of the burst
//! (counting from 1) is allowed immediately while
//! `n <= max(1, ceil(elapsed_secs)) * rate_limit`; otherwise the caller must
//! wait one tick before sending. The tracker only ever adds delay: it never
//! drops, reorders or re-checks a message.

use std::time::Duration;

use tokio::time::Instant;

/// What the dispatch loop should do before sending the next message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacingDecision {
    /// Send now.
    Proceed,
    /// Sleep for the given tick, then send.
    Throttle(Duration),
}

impl PacingDecision {
    pub const fn is_throttled(&self) -> bool {
        matches!(self, PacingDecision::Throttle(_))
    }
}

/// Rolling dispatch window: when the current burst started and how many
/// messages have been checked since.
#[derive(Clone, Debug)]
pub struct PacingWindow {
    rate_limit: u64,
    tick: Duration,
    window_start: Option<Instant>,
    count: u64,
}

impl PacingWindow {
    pub fn new(rate_limit: u32, tick: Duration) -> Self {
        Self {
            rate_limit: u64::from(rate_limit),
            tick,
            window_start: None,
            count: 1,
        }
    }

    /// Decides whether the next message may go out at `now`.
    ///
    /// Every call counts one message, throttled or not.
    pub fn check(&mut self, now: Instant) -> PacingDecision {
        let decision = match self.window_start {
            None => {
                self.window_start = Some(now);
                PacingDecision::Proceed
            }
            Some(start) => {
                if self.count > self.allowed_by(now, start) {
                    PacingDecision::Throttle(self.tick)
                } else {
                    PacingDecision::Proceed
                }
            }
        };
        self.count += 1;
        decision
    }

    /// Ends the current burst; the next message opens a fresh window.
    pub fn reset(&mut self) {
        self.window_start = None;
        self.count = 1;
    }

    pub fn window_start(&self) -> Option<Instant> {
        self.window_start
    }

    /// Index the next checked message will have within the burst.
    pub fn count(&self) -> u64 {
        self.count
    }

    fn allowed_by(&self, now: Instant, start: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(start);
        let whole_seconds = elapsed.as_secs() + u64::from(elapsed.subsec_nanos() > 0);
        whole_seconds.max(1).saturating_mul(self.rate_limit)
    }
}
