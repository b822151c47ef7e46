use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cancellation flag plus optional deadline for a history walk.
///
/// Checked between pages; clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct SyncBudget {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl SyncBudget {
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Budget that runs out `timeout` from now; `None` never runs out.
    #[must_use]
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    /// Budget sharing this one's cancellation flag with a fresh deadline.
    #[must_use]
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::clone(&self.cancelled),
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Cancelled, or past the deadline.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
