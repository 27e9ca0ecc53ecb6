use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use appkeep_core::ErrorKind;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::OperationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller asked for cancellation (for example with Ctrl-C).
    Requested,
    /// The progress stream's consumer went away.
    Disconnected,
    /// The operation outlived its deadline.
    DeadlineExceeded,
}

impl CancelReason {
    fn encode(self) -> u8 {
        match self {
            Self::Requested => 1,
            Self::Disconnected => 2,
            Self::DeadlineExceeded => 3,
        }
    }

    fn decode(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Requested),
            2 => Some(Self::Disconnected),
            3 => Some(Self::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Requested => "cancelled by request",
            Self::Disconnected => "progress stream disconnected",
            Self::DeadlineExceeded => "operation deadline exceeded",
        }
    }
}

/// Cancellation flag and deadline shared by every step of one operation.
///
/// Clones observe the same flag. The first recorded reason wins.
#[derive(Debug, Clone)]
pub struct OperationContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    cancelled: AtomicBool,
    reason: AtomicU8,
    deadline: Instant,
    poll_interval: Duration,
    notify: Notify,
}

impl OperationContext {
    pub fn new(lifetime: Duration) -> Self {
        Self::with_poll_interval(lifetime, Duration::from_millis(100))
    }

    pub fn with_poll_interval(lifetime: Duration, poll_interval: Duration) -> Self {
        let now = Instant::now();
        let deadline = now.checked_add(lifetime).unwrap_or(now + Duration::from_secs(86_400));
        Self {
            inner: Arc::new(ContextInner {
                cancelled: AtomicBool::new(false),
                reason: AtomicU8::new(0),
                deadline,
                poll_interval: poll_interval.max(Duration::from_millis(1)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.inner.reason.compare_exchange(
            0,
            reason.encode(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            tracing::debug!(reason = reason.describe(), "operation cancelled");
        }
        self.inner.notify.notify_waiters();
    }

    /// True once cancelled or past the deadline. Crossing the deadline records
    /// it as the cancellation reason.
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        if Instant::now() >= self.inner.deadline {
            self.cancel(CancelReason::DeadlineExceeded);
            return true;
        }
        false
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        CancelReason::decode(self.inner.reason.load(Ordering::SeqCst))
    }

    pub fn poll_interval(&self) -> Duration {
        self.inner.poll_interval
    }

    pub fn remaining(&self) -> Duration {
        self.inner
            .deadline
            .saturating_duration_since(Instant::now())
    }

    /// The error a step should return once it notices cancellation. Every
    /// reason, the deadline included, is reported as `Cancelled` and named in
    /// the message.
    pub fn cancellation_error(&self) -> OperationError {
        let reason = self.cancel_reason().unwrap_or(CancelReason::Requested);
        let mut err = OperationError::new(ErrorKind::Cancelled, reason.describe());
        err.message = format!("{}: {}", err.message, reason.describe());
        err
    }

    pub fn check(&self) -> Result<(), OperationError> {
        if self.is_cancelled() {
            return Err(self.cancellation_error());
        }
        Ok(())
    }

    /// Resolves once the operation is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let wait = self.poll_interval().min(self.remaining());
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Sleeps for `duration` unless cancellation arrives first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), OperationError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.check(),
            _ = self.cancelled() => Err(self.cancellation_error()),
        }
    }
}
