//! Per-report-type dispatch locks.
//!
//! Only one batch per report type may run at a time, whether it was started
//! by the scheduler or by a manual trigger.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use milo_core::error::{MiloError, Result};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Held for the duration of one batch. Dropping it releases the lock.
pub type DispatchGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct DispatchLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DispatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, report_type: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(report_type.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait until no other batch for this report type is running.
    pub async fn acquire(&self, report_type: &str) -> DispatchGuard {
        self.lock_for(report_type).lock_owned().await
    }

    /// Take the lock or fail immediately with `DispatchInProgress`.
    pub fn try_acquire(&self, report_type: &str) -> Result<DispatchGuard> {
        self.lock_for(report_type)
            .try_lock_owned()
            .map_err(|_| MiloError::DispatchInProgress(report_type.to_string()))
    }

    pub fn is_busy(&self, report_type: &str) -> bool {
        self.lock_for(report_type).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_try_acquire_fails_while_held() {
        let locks = DispatchLocks::new();
        let guard = locks.try_acquire("daily_incidents").unwrap();
        assert!(locks.is_busy("daily_incidents"));

        let err = locks.try_acquire("daily_incidents").unwrap_err();
        assert!(matches!(err, MiloError::DispatchInProgress(_)));

        // Other report types are independent.
        assert!(locks.try_acquire("weekly_summary").is_ok());

        drop(guard);
        assert!(!locks.is_busy("daily_incidents"));
        assert!(locks.try_acquire("daily_incidents").is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let locks = Arc::new(DispatchLocks::new());
        let guard = locks.acquire("daily_incidents").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("daily_incidents").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
