use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::message::OutboundMessage;
use crate::Error;

/// A message the delivery service accepted, with its response.
#[derive(Debug)]
pub struct DeliveryReceipt<R> {
    pub message: Arc<OutboundMessage>,
    pub response: R,
}

/// A message the delivery service rejected or could not be reached for.
///
/// The message is not retried.
#[derive(Debug)]
pub struct DeliveryFailure {
    pub message: Arc<OutboundMessage>,
    pub error: Error,
}

impl DeliveryFailure {
    pub fn description(&self) -> String {
        self.error.to_string()
    }
}

/// Result of one delivery attempt.
#[derive(Debug)]
pub enum DispatchOutcome<R> {
    Delivered(DeliveryReceipt<R>),
    Failed(DeliveryFailure),
}

impl<R> DispatchOutcome<R> {
    pub fn message(&self) -> &Arc<OutboundMessage> {
        match self {
            DispatchOutcome::Delivered(receipt) => &receipt.message,
            DispatchOutcome::Failed(failure) => &failure.message,
        }
    }

    pub const fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered(_))
    }
}

pub type SuccessObserver<R> = Arc<dyn Fn(&DeliveryReceipt<R>) -> Result<(), Error> + Send + Sync>;
pub type FailureObserver = Arc<dyn Fn(&DeliveryFailure) -> Result<(), Error> + Send + Sync>;

/// Handle returned by observer registration, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Success and failure observer registry.
///
/// Observers run synchronously on the dispatch loop, once per attempt, in
/// registration order. An observer that returns an error or panics is
/// logged and counted; it does not stop the loop or the observers after it.
pub struct Notifier<R> {
    next_id: AtomicU64,
    success: Mutex<Vec<(SubscriptionId, SuccessObserver<R>)>>,
    failure: Mutex<Vec<(SubscriptionId, FailureObserver)>>,
}

impl<R> Default for Notifier<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Notifier<R> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            success: Mutex::new(Vec::new()),
            failure: Mutex::new(Vec::new()),
        }
    }

    pub fn on_success<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&DeliveryReceipt<R>) -> Result<(), Error> + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.success).push((id, Arc::new(observer)));
        id
    }

    pub fn on_failure<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&DeliveryFailure) -> Result<(), Error> + Send + Sync + 'static,
    {
        let id = self.next_id();
        lock(&self.failure).push((id, Arc::new(observer)));
        id
    }

    /// Removes an observer of either kind. Returns `false` if `id` was not
    /// registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut success = lock(&self.success);
        let before = success.len();
        success.retain(|(existing, _)| *existing != id);
        if success.len() != before {
            return true;
        }
        drop(success);

        let mut failure = lock(&self.failure);
        let before = failure.len();
        failure.retain(|(existing, _)| *existing != id);
        failure.len() != before
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.success).len() + lock(&self.failure).len()
    }

    /// Delivers `outcome` to every observer of its kind and returns how many
    /// of them failed.
    pub fn notify(&self, outcome: &DispatchOutcome<R>) -> usize {
        // Snapshot so observers may (un)subscribe from inside a callback.
        let mut failed = 0;
        match outcome {
            DispatchOutcome::Delivered(receipt) => {
                let observers: Vec<SuccessObserver<R>> =
                    lock(&self.success).iter().map(|(_, observer)| Arc::clone(observer)).collect();
                for observer in observers {
                    if !invoke("success", &receipt.message, || observer(receipt)) {
                        failed += 1;
                    }
                }
            }
            DispatchOutcome::Failed(failure) => {
                let observers: Vec<FailureObserver> =
                    lock(&self.failure).iter().map(|(_, observer)| Arc::clone(observer)).collect();
                for observer in observers {
                    if !invoke("failure", &failure.message, || observer(failure)) {
                        failed += 1;
                    }
                }
            }
        }
        failed
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn invoke<F>(kind: &'static str, message: &OutboundMessage, observer: F) -> bool
where
    F: FnOnce() -> Result<(), Error>,
{
    match catch_unwind(AssertUnwindSafe(observer)) {
        Ok(Ok(())) => true,
        Ok(Err(error)) => {
            warn!(
                message = "Dispatch observer returned an error.",
                observer = kind,
                recipient = %message.primary_recipient(),
                %error,
            );
            false
        }
        Err(panic) => {
            warn!(
                message = "Dispatch observer panicked.",
                observer = kind,
                recipient = %message.primary_recipient(),
                panic = panic_message(panic.as_ref()),
            );
            false
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
