//! Metrics and log events emitted by the dispatcher.
//!
//! Every event logs through `tracing` and records through the `metrics`
//! facade; install a recorder to export them.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::message::OutboundMessage;
use crate::Error;

pub trait InternalEvent {
    fn emit(self);
}

pub struct MessageEnqueued<'a> {
    pub message: &'a OutboundMessage,
    pub queue_depth: usize,
}

impl InternalEvent for MessageEnqueued<'_> {
    fn emit(self) {
        trace!(
            message = "Message enqueued.",
            recipient = %self.message.primary_recipient(),
            subject = %self.message.subject,
            queue_depth = self.queue_depth,
        );
        counter!("mail_dispatch_messages_enqueued_total").increment(1);
        gauge!("mail_dispatch_queue_depth").set(self.queue_depth as f64);
    }
}

pub struct MessageDelivered<'a> {
    pub message: &'a OutboundMessage,
    pub elapsed: Duration,
}

impl InternalEvent for MessageDelivered<'_> {
    fn emit(self) {
        debug!(
            message = "Message delivered.",
            recipient = %self.message.primary_recipient(),
            sender = %self.message.from.address,
            elapsed_ms = self.elapsed.as_millis(),
        );
        counter!("mail_dispatch_messages_delivered_total").increment(1);
        histogram!("mail_dispatch_send_duration_seconds").record(self.elapsed);
    }
}

pub struct MessageFailed<'a> {
    pub message: &'a OutboundMessage,
    pub error: &'a Error,
    pub elapsed: Duration,
}

impl InternalEvent for MessageFailed<'_> {
    fn emit(self) {
        error!(
            message = "Failed to deliver message; dropping it.",
            recipient = %self.message.primary_recipient(),
            sender = %self.message.from.address,
            subject = %self.message.subject,
            error = %self.error,
        );
        counter!("mail_dispatch_messages_failed_total").increment(1);
        histogram!("mail_dispatch_send_duration_seconds").record(self.elapsed);
    }
}

pub struct DispatchThrottled {
    pub delay: Duration,
    pub burst_index: u64,
}

impl InternalEvent for DispatchThrottled {
    fn emit(self) {
        debug!(
            message = "Rate budget exhausted; delaying next send.",
            delay_ms = self.delay.as_millis(),
            burst_index = self.burst_index,
        );
        counter!("mail_dispatch_throttled_total").increment(1);
    }
}

pub struct DispatcherIdle {
    pub interval: Duration,
}

impl InternalEvent for DispatcherIdle {
    fn emit(self) {
        trace!(message = "Queue empty; sleeping.", interval_ms = self.interval.as_millis());
        counter!("mail_dispatch_idle_sleeps_total").increment(1);
        gauge!("mail_dispatch_queue_depth").set(0.0);
    }
}

pub struct ObserverErrors {
    pub count: usize,
}

impl InternalEvent for ObserverErrors {
    fn emit(self) {
        if self.count > 0 {
            counter!("mail_dispatch_observer_errors_total").increment(self.count as u64);
        }
    }
}
