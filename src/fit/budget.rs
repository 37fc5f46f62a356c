//! Cooperative cancellation and per-fit time limits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Shared flag checked by every running fit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Deadline and cancellation state for a single (stratum, variant) fit.
#[derive(Debug, Clone)]
pub struct FitBudget {
    cancel: CancelToken,
    started: Instant,
    timeout: Option<Duration>,
}

impl FitBudget {
    pub fn new(cancel: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            started: Instant::now(),
            timeout,
        }
    }

    /// A budget that never expires.
    pub fn unlimited() -> Self {
        Self::new(CancelToken::new(), None)
    }

    pub fn check(&self) -> Result<(), AppError> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if let Some(limit) = self.timeout {
            if self.started.elapsed() > limit {
                return Err(AppError::TimedOut(limit));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancelToken::new();
        let budget = FitBudget::new(token.clone(), None);
        assert!(budget.check().is_ok());
        token.cancel();
        assert!(matches!(budget.check(), Err(AppError::Cancelled)));
    }

    #[test]
    fn zero_timeout_expires() {
        let budget = FitBudget::new(CancelToken::new(), Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(budget.check(), Err(AppError::TimedOut(_))));
    }
}
