use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock acquisition that survives a panic in another holder.
///
/// Cache state is always safe to keep serving after a poisoned lock: the worst
/// case is an entry whose hit count missed one increment.
pub(crate) trait MutexExt<T> {
    fn lock_recovered(&self, target: &'static str, op: &'static str) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    fn lock_recovered(&self, target: &'static str, op: &'static str) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned cache lock"
            );
            poisoned.into_inner()
        })
    }
}
