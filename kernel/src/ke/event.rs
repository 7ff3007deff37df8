//! Kernel Event Implementation (KEVENT)
//!
//! A one-shot broadcast flag. Tasks wait until the event is set; `set`
//! wakes every waiter and leaves the event set for good. There is no reset,
//! so once set every later `wait` returns through the fast path.
//!
//! # Usage
//! ```ignore
//! static READY: KEvent = KEvent::new();
//!
//! // Task A
//! READY.wait();
//!
//! // Task B
//! READY.set();
//! ```
//!
//! # NT Compatibility
//! Behaves like a notification KEVENT that is never reset

use core::sync::atomic::{AtomicBool, Ordering};

use super::spinlock::{SpinLock, SpinLockGuard};
use super::wait::{self, Deadline, WaitError, WaitList, WaitMode, Waiter};

/// Kernel Event
pub struct KEvent {
    value: AtomicBool,
    waiters: SpinLock<WaitList>,
}

impl KEvent {
    /// Create an event that is not set
    pub const fn new() -> Self {
        Self {
            value: AtomicBool::new(false),
            waiters: SpinLock::new(WaitList::new()),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    /// Block until the event is set
    pub fn wait(&self) {
        // Without a deadline or signals the wait can only end with the event set
        let _ = self.wait_until(Deadline::Never, WaitMode::Uninterruptible);
    }

    pub fn wait_interruptible(&self) -> Result<(), WaitError> {
        self.wait_until(Deadline::Never, WaitMode::Interruptible)
    }

    pub fn wait_timeout(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.wait_until(Deadline::after(timeout_ns), WaitMode::Uninterruptible)
    }

    /// Set the event and wake every waiter
    ///
    /// Returns the previous state.
    pub fn set(&self) -> bool {
        let was_set = self.value.swap(true, Ordering::Release);

        // Nobody queues once the flag is visible, so this drains
        let mut list = self.waiters.lock();
        while let Some(target) = list.wake_one(false) {
            let level = SpinLockGuard::unlock_keep_level(list);
            target.wake();
            list = self.waiters.relock(level);
        }
        was_set
    }

    fn wait_until(&self, deadline: Deadline, mode: WaitMode) -> Result<(), WaitError> {
        wait::assert_can_block(self as *const KEvent as usize);

        if self.is_set() {
            return Ok(());
        }

        let waiter = Waiter::new();
        loop {
            let mut list = self.waiters.lock();
            list.remove(&waiter);
            if self.is_set() {
                return Ok(());
            }
            wait::check_abort(deadline, mode)?;

            waiter.prepare();
            // SAFETY: `waiter` is removed at the top of the loop before any return
            unsafe { list.push_back(&waiter) };
            SpinLockGuard::unlock_keep_level(list).restore();

            waiter.block(deadline, mode);
        }
    }
}

impl Default for KEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{self, hosted};
    use core::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_set_before_and_after_wait() {
        hosted::install();
        let event = KEvent::new();
        assert!(!event.is_set());
        assert!(!event.set());
        assert!(event.set());
        // Already set: no blocking
        event.wait();
        assert_eq!(event.wait_timeout(0), Ok(()));
    }

    #[test]
    fn test_no_lost_wakeup() {
        hosted::install();
        for _ in 0..200 {
            let event = Arc::new(KEvent::new());
            let woken = Arc::new(AtomicUsize::new(0));
            let handle = {
                let event = event.clone();
                let woken = woken.clone();
                thread::spawn(move || {
                    event.wait();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            };
            event.set();
            handle.join().unwrap();
            assert_eq!(woken.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_wakes_all_waiters() {
        hosted::install();
        let event = Arc::new(KEvent::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let event = event.clone();
                thread::spawn(move || event.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        event.set();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(event.waiters.lock().is_empty());
    }

    #[test]
    fn test_timeout_and_interrupt() {
        hosted::install();
        let event = KEvent::new();
        let start = hal::now_ns();
        assert_eq!(event.wait_timeout(10_000_000), Err(WaitError::Timeout));
        assert!(hal::now_ns() - start >= 10_000_000);
        assert!(event.waiters.lock().is_empty());

        assert!(hosted::send_signal(hal::scheduler().current_task()));
        assert_eq!(event.wait_interruptible(), Err(WaitError::Interrupted));
        hosted::clear_signal();
    }

    #[test]
    #[should_panic(expected = "IRQL_NOT_LESS_OR_EQUAL")]
    fn test_wait_at_dispatch_bugchecks() {
        hosted::install();
        let event = KEvent::new();
        event.set();
        let _dpc = crate::ke::irql::disable_dpc();
        event.wait();
    }
}
