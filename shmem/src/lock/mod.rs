use std::time::Duration;

#[cfg(target_os = "linux")]
mod robust;

#[cfg(target_os = "linux")]
pub use self::robust::RobustMutex;

/// Timeout used by enqueue and dequeue.
pub const OPERATION_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout used by stats reads, which are best effort.
pub const STATS_TIMEOUT: Duration = Duration::from_millis(100);
/// Timeout used while opening or creating a buffer.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// A named mutual-exclusion object shared by every process that opens the same name.
///
/// `try_acquire` never fails loudly: a timeout is `false`, and a lock abandoned by a
/// terminated holder is handed to the caller as a normal successful acquisition.
pub trait NamedLock: Send + Sync {
    fn try_acquire(&self, timeout: Duration) -> bool;

    /// Errors are swallowed; the caller cannot do anything useful with them.
    fn release(&self);

    fn name(&self) -> &str;
}

/// Holds a [`NamedLock`] until dropped.
pub struct LockGuard<'a> {
    lock: &'a dyn NamedLock,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(lock: &'a dyn NamedLock, timeout: Duration) -> Option<LockGuard<'a>> {
        if lock.try_acquire(timeout) {
            Some(LockGuard { lock })
        } else {
            None
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingLock {
        free: std::sync::Mutex<bool>,
        releases: AtomicUsize,
    }

    impl NamedLock for CountingLock {
        fn try_acquire(&self, _timeout: Duration) -> bool {
            let mut free = self.free.lock().unwrap();
            if *free {
                *free = false;
                true
            } else {
                false
            }
        }

        fn release(&self) {
            *self.free.lock().unwrap() = true;
            self.releases.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn guard_releases_on_drop() {
        let lock = CountingLock::default();
        *lock.free.lock().unwrap() = true;
        {
            let guard = LockGuard::acquire(&lock, OPERATION_TIMEOUT);
            assert!(guard.is_some());
            assert!(LockGuard::acquire(&lock, OPERATION_TIMEOUT).is_none());
        }
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
        assert!(LockGuard::acquire(&lock, OPERATION_TIMEOUT).is_some());
    }

    #[test]
    fn guard_releases_when_critical_section_panics() {
        let lock = CountingLock::default();
        *lock.free.lock().unwrap() = true;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = LockGuard::acquire(&lock, OPERATION_TIMEOUT).unwrap();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
    }
}
