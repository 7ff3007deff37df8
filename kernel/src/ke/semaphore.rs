//! Kernel Semaphore Implementation (KSEMAPHORE)
//!
//! A counting semaphore. `signal` adds one unit; `wait` takes one, blocking
//! while none are available.
//!
//! Units are handed over directly: when tasks are waiting, `signal` does
//! not bump the count but grants the unit to the head of the FIFO, so a
//! task arriving later cannot take it first.
//!
//! # Usage
//! ```ignore
//! static SLOTS: KSemaphore = KSemaphore::new(4);
//!
//! SLOTS.wait();
//! // ... use one of four slots ...
//! SLOTS.signal();
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KSEMAPHORE / KeReleaseSemaphore

use super::spinlock::SpinLock;
use super::wait::{self, Deadline, WaitError, WaitList, WaitMode, Waiter};

struct SemaphoreState {
    count: usize,
    waiters: WaitList,
}

/// Kernel Semaphore
///
/// Equivalent to NT's KSEMAPHORE
pub struct KSemaphore {
    state: SpinLock<SemaphoreState>,
}

impl KSemaphore {
    /// Create a semaphore holding `count` units
    pub const fn new(count: usize) -> Self {
        Self {
            state: SpinLock::new(SemaphoreState {
                count,
                waiters: WaitList::new(),
            }),
        }
    }

    /// Units currently available
    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    /// Tasks currently waiting
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Take a unit if one is available
    pub fn try_wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    /// Take a unit, blocking as long as it takes
    pub fn wait(&self) {
        // Without a deadline or signals the wait can only end in a grant
        let _ = self.wait_until(Deadline::Never, WaitMode::Uninterruptible);
    }

    pub fn wait_interruptible(&self) -> Result<(), WaitError> {
        self.wait_until(Deadline::Never, WaitMode::Interruptible)
    }

    pub fn wait_timeout(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.wait_until(Deadline::after(timeout_ns), WaitMode::Uninterruptible)
    }

    pub fn wait_timeout_interruptible(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.wait_until(Deadline::after(timeout_ns), WaitMode::Interruptible)
    }

    /// Release one unit, handing it to the longest waiter if there is one
    ///
    /// Equivalent to KeReleaseSemaphore with an adjustment of 1
    pub fn signal(&self) {
        let target = {
            let mut state = self.state.lock();
            let target = state.waiters.wake_one(true);
            if target.is_none() {
                state.count += 1;
            }
            target
        };
        if let Some(target) = target {
            target.wake();
        }
    }

    fn wait_until(&self, deadline: Deadline, mode: WaitMode) -> Result<(), WaitError> {
        wait::assert_can_block(self as *const KSemaphore as usize);

        let waiter = Waiter::new();
        {
            let mut state = self.state.lock();
            if state.count > 0 && state.waiters.is_empty() {
                state.count -= 1;
                return Ok(());
            }
            waiter.prepare();
            // SAFETY: `waiter` leaves the list before this frame returns
            unsafe { state.waiters.push_back(&waiter) };
        }

        loop {
            waiter.block(deadline, mode);

            let mut state = self.state.lock();
            // A granted unit wins over a timeout or signal that raced with it
            if waiter.is_granted() {
                return Ok(());
            }
            if let Err(err) = wait::check_abort(deadline, mode) {
                state.waiters.remove(&waiter);
                return Err(err);
            }
            waiter.prepare();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{self, hosted};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    fn wait_for_waiters(sem: &KSemaphore, count: usize) {
        while sem.waiter_count() < count {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_counting() {
        hosted::install();
        let sem = KSemaphore::new(2);
        assert!(sem.try_wait());
        sem.wait();
        assert!(!sem.try_wait());
        sem.signal();
        assert_eq!(sem.count(), 1);
    }

    #[test]
    fn test_fifo_handoff() {
        hosted::install();
        let sem = Arc::new(KSemaphore::new(0));
        let (tx, rx) = mpsc::channel();

        let spawn_waiter = |tag: u32| {
            let sem = sem.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                sem.wait();
                tx.send(tag).unwrap();
            })
        };

        let first = spawn_waiter(1);
        wait_for_waiters(&sem, 1);
        let second = spawn_waiter(2);
        wait_for_waiters(&sem, 2);
        let third = spawn_waiter(3);
        wait_for_waiters(&sem, 3);

        sem.signal();
        // The unit went to the first waiter, not to the count
        assert!(!sem.try_wait());
        assert_eq!(rx.recv().unwrap(), 1);

        sem.signal();
        assert!(!sem.try_wait());
        assert_eq!(rx.recv().unwrap(), 2);

        sem.signal();
        assert_eq!(rx.recv().unwrap(), 3);
        first.join().unwrap();
        second.join().unwrap();
        third.join().unwrap();
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_wait_timeout() {
        hosted::install();
        let sem = KSemaphore::new(0);
        let start = hal::now_ns();
        assert_eq!(sem.wait_timeout(15_000_000), Err(WaitError::Timeout));
        assert!(hal::now_ns() - start >= 15_000_000);
        assert_eq!(sem.waiter_count(), 0);
        sem.signal();
        assert_eq!(sem.wait_timeout(15_000_000), Ok(()));
    }

    #[test]
    fn test_wait_interruptible() {
        hosted::install();
        let sem = KSemaphore::new(0);
        assert!(hosted::send_signal(hal::scheduler().current_task()));
        assert_eq!(sem.wait_interruptible(), Err(WaitError::Interrupted));
        assert_eq!(
            sem.wait_timeout_interruptible(wait::NO_TIMEOUT),
            Err(WaitError::Interrupted)
        );
        hosted::clear_signal();
        assert_eq!(sem.waiter_count(), 0);
    }
}
