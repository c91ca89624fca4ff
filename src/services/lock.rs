//! Per-upload write exclusion.
//!
//! Acquisition never waits: a second writer is turned away immediately. There
//! is no lease or timeout, so a holder that never releases keeps the upload
//! locked for the life of the process.

use dashmap::DashSet;

/// Non-blocking mutual exclusion keyed by upload id.
pub trait UploadLocker: Send + Sync + 'static {
    /// Try to take the lock for `id`. Returns `false` if it is already held.
    fn acquire(&self, id: &str) -> bool;

    /// Release the lock for `id`. Releasing an unheld lock is a no-op.
    fn release(&self, id: &str);
}

/// Lock table held in process memory.
#[derive(Default)]
pub struct InMemoryUploadLocker {
    held: DashSet<String>,
}

impl InMemoryUploadLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.held.contains(id)
    }
}

impl UploadLocker for InMemoryUploadLocker {
    fn acquire(&self, id: &str) -> bool {
        self.held.insert(id.to_string())
    }

    fn release(&self, id: &str) {
        self.held.remove(id);
    }
}

/// Held lock; released on drop, so every exit path gives it back.
pub struct UploadLockGuard<'a> {
    locker: &'a dyn UploadLocker,
    id: &'a str,
}

impl<'a> UploadLockGuard<'a> {
    pub fn try_acquire(locker: &'a dyn UploadLocker, id: &'a str) -> Option<Self> {
        locker.acquire(id).then_some(Self { locker, id })
    }
}

impl Drop for UploadLockGuard<'_> {
    fn drop(&mut self) {
        self.locker.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn second_acquire_fails_fast() {
        let locker = InMemoryUploadLocker::new();
        assert!(locker.acquire("a"));
        assert!(!locker.acquire("a"));
        assert!(locker.acquire("b"));
        locker.release("a");
        assert!(locker.acquire("a"));
    }

    #[test]
    fn guard_releases_on_drop() {
        let locker = InMemoryUploadLocker::new();
        {
            let _guard = UploadLockGuard::try_acquire(&locker, "a").unwrap();
            assert!(locker.is_locked("a"));
            assert!(UploadLockGuard::try_acquire(&locker, "a").is_none());
        }
        assert!(!locker.is_locked("a"));
    }

    #[test]
    fn exactly_one_thread_wins() {
        let locker = Arc::new(InMemoryUploadLocker::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locker = locker.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if locker.acquire("contended") {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
