//! Kernel Mutex Implementation (KMUTEX)
//!
//! A sleeping mutual-exclusion lock with ownership tracking. Waiters block
//! instead of spinning, freeing the processor for other work.
//!
//! The whole lock state is one 64-bit word: the owner's task id in the low
//! half, and two flags above it:
//!
//! - `WAITERS`: the wait list may be non-empty; unlock must wake the head
//! - `LIST_LOCKED`: a bit spinlock guarding the wait list (taken at Dispatch)
//!
//! A waiter stays on the list until it acquires, times out, or is
//! interrupted. Unlock wakes the head without dequeuing it; the head then
//! competes for the word like anyone else. Acquisition is not strictly FIFO.
//!
//! Not recursive: locking a mutex the caller already owns deadlocks.
//!
//! # Usage
//! ```ignore
//! static MUTEX: KMutex = KMutex::new();
//!
//! let _guard = MUTEX.acquire();
//! // ... critical section ...
//!
//! MUTEX.lock_timeout(10_000_000)?; // 10ms
//! MUTEX.unlock();
//! ```

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::bugcheck::codes;
use super::irql::{self, IrqlGuard};
use super::scheduler::TaskId;
use super::wait::{self, Deadline, WaitError, WaitList, WaitMode, Waiter};
use crate::hal;

bitflags! {
    /// Flag half of the mutex word
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MutexFlags: u64 {
        /// The wait list may be non-empty
        const WAITERS = 1 << 32;
        /// The wait list is being modified
        const LIST_LOCKED = 1 << 33;
    }
}

const OWNER_MASK: u64 = 0xFFFF_FFFF;

/// Decoded mutex word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexWord {
    pub owner: Option<TaskId>,
    pub flags: MutexFlags,
}

impl MutexWord {
    pub const UNLOCKED: Self = Self {
        owner: None,
        flags: MutexFlags::empty(),
    };

    #[inline]
    pub fn pack(self) -> u64 {
        let owner = match self.owner {
            Some(task) => task.as_u32() as u64,
            None => 0,
        };
        owner | self.flags.bits()
    }

    #[inline]
    pub fn unpack(raw: u64) -> Self {
        Self {
            owner: TaskId::from_raw((raw & OWNER_MASK) as u32),
            flags: MutexFlags::from_bits_truncate(raw),
        }
    }
}

/// Kernel Mutex
///
/// Equivalent to NT's KMUTEX
pub struct KMutex {
    word: AtomicU64,
    waiters: UnsafeCell<WaitList>,
}

// Safety: the wait list is only touched with LIST_LOCKED held
unsafe impl Sync for KMutex {}
unsafe impl Send for KMutex {}

/// Holds LIST_LOCKED (and Dispatch) until dropped
struct ListLock<'a> {
    mutex: &'a KMutex,
    _level: IrqlGuard,
}

impl ListLock<'_> {
    #[inline]
    fn list(&mut self) -> &mut WaitList {
        // SAFETY: LIST_LOCKED is held
        unsafe { &mut *self.mutex.waiters.get() }
    }

    /// Drop WAITERS once the last waiter has left
    #[inline]
    fn settle_waiters_flag(&mut self) {
        if self.list().is_empty() {
            self.mutex
                .word
                .fetch_and(!MutexFlags::WAITERS.bits(), Ordering::AcqRel);
        }
    }
}

impl Drop for ListLock<'_> {
    fn drop(&mut self) {
        self.mutex
            .word
            .fetch_and(!MutexFlags::LIST_LOCKED.bits(), Ordering::Release);
    }
}

impl KMutex {
    /// Create a new unowned mutex
    pub const fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
            waiters: UnsafeCell::new(WaitList::new()),
        }
    }

    /// Decoded snapshot of the lock word
    #[inline]
    pub fn word(&self) -> MutexWord {
        MutexWord::unpack(self.word.load(Ordering::Acquire))
    }

    /// The owning task, if any
    #[inline]
    pub fn owner(&self) -> Option<TaskId> {
        self.word().owner
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.owner().is_some()
    }

    /// Acquire without blocking
    pub fn try_lock(&self) -> bool {
        self.try_acquire_for(hal::scheduler().current_task())
    }

    /// Acquire, blocking as long as it takes
    pub fn lock(&self) {
        // Without a deadline or signals the wait can only end in ownership
        let _ = self.lock_until(Deadline::Never, WaitMode::Uninterruptible);
    }

    /// Acquire unless a signal arrives first
    pub fn lock_interruptible(&self) -> Result<(), WaitError> {
        self.lock_until(Deadline::Never, WaitMode::Interruptible)
    }

    /// Acquire within `timeout_ns` ([`wait::NO_TIMEOUT`] waits forever)
    pub fn lock_timeout(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.lock_until(Deadline::after(timeout_ns), WaitMode::Uninterruptible)
    }

    /// Acquire within `timeout_ns` unless a signal arrives first
    pub fn lock_timeout_interruptible(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.lock_until(Deadline::after(timeout_ns), WaitMode::Interruptible)
    }

    /// Acquire and return a guard that unlocks on drop
    pub fn acquire(&self) -> MutexGuard<'_> {
        self.lock();
        MutexGuard { mutex: self }
    }

    /// Release the mutex
    ///
    /// Releasing a mutex the caller does not own is a bug check
    /// (THREAD_NOT_MUTEX_OWNER).
    pub fn unlock(&self) {
        let me = hal::scheduler().current_task();
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let word = MutexWord::unpack(current);
            if word.owner != Some(me) {
                crate::bugcheck!(
                    codes::THREAD_NOT_MUTEX_OWNER,
                    self as *const KMutex as usize,
                    word.owner.map_or(0, TaskId::as_u32),
                    me.as_u32()
                );
            }
            match self.word.compare_exchange_weak(
                current,
                current & !OWNER_MASK,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if MutexWord::unpack(current).flags.contains(MutexFlags::WAITERS) {
            self.wake_head();
        }
    }

    /// Release on behalf of a group of tasks, skipping the owner check
    ///
    /// Used by [`super::rwmutex::KRwMutex`], where the last reader out
    /// releases a mutex the first reader in acquired.
    pub(crate) fn release_group(&self) {
        let previous = self.word.fetch_and(!OWNER_MASK, Ordering::Release);
        if MutexWord::unpack(previous).flags.contains(MutexFlags::WAITERS) {
            self.wake_head();
        }
    }

    fn try_acquire_for(&self, me: TaskId) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            if MutexWord::unpack(current).owner.is_some() {
                return false;
            }
            match self.word.compare_exchange_weak(
                current,
                current | me.as_u32() as u64,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn lock_list(&self) -> ListLock<'_> {
        let level = irql::disable_dpc();
        let locked = MutexFlags::LIST_LOCKED.bits();
        loop {
            let current = self.word.load(Ordering::Relaxed);
            if current & locked == 0
                && self
                    .word
                    .compare_exchange_weak(current, current | locked, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return ListLock {
                    mutex: self,
                    _level: level,
                };
            }
            hal::spin_hint();
        }
    }

    /// Wake the first waiter, leaving it queued
    fn wake_head(&self) {
        let target = {
            let mut list = self.lock_list();
            // SAFETY: the head stays linked while LIST_LOCKED is held
            list.list()
                .peek_front()
                .map(|head| unsafe { Waiter::target(head) })
        };
        if let Some(target) = target {
            target.wake();
        }
    }

    pub(crate) fn lock_until(&self, deadline: Deadline, mode: WaitMode) -> Result<(), WaitError> {
        wait::assert_can_block(self as *const KMutex as usize);

        let waiter = Waiter::new();
        let me = waiter.task();
        if self.try_acquire_for(me) {
            return Ok(());
        }

        {
            let mut list = self.lock_list();
            // Publish before the last try, so an unlock racing with us wakes
            self.word
                .fetch_or(MutexFlags::WAITERS.bits(), Ordering::AcqRel);
            if self.try_acquire_for(me) {
                list.settle_waiters_flag();
                return Ok(());
            }
            waiter.prepare();
            // SAFETY: `waiter` leaves the list before this frame returns
            unsafe { list.list().push_back(&waiter) };
        }

        loop {
            waiter.block(deadline, mode);

            let mut list = self.lock_list();
            let outcome = if self.try_acquire_for(me) {
                Some(Ok(()))
            } else {
                wait::check_abort(deadline, mode).err().map(Err)
            };
            match outcome {
                Some(outcome) => {
                    list.list().remove(&waiter);
                    list.settle_waiters_flag();
                    return outcome;
                }
                // Still contended: go round again with a fresh ticket
                None => {
                    waiter.prepare();
                }
            }
        }
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard, unlocks on drop
pub struct MutexGuard<'a> {
    mutex: &'a KMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted;
    use core::sync::atomic::AtomicUsize;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    struct Counter {
        mutex: KMutex,
        value: UnsafeCell<u64>,
        /// Tasks currently inside the critical section
        inside: AtomicUsize,
    }

    unsafe impl Sync for Counter {}

    #[test]
    fn test_mutex_word_packing() {
        let word = MutexWord {
            owner: TaskId::from_raw(7),
            flags: MutexFlags::WAITERS,
        };
        assert_eq!(word.pack(), (1 << 32) | 7);
        assert_eq!(MutexWord::unpack(word.pack()), word);
        assert_eq!(MutexWord::unpack(0), MutexWord::UNLOCKED);
    }

    #[test]
    fn test_mutex_mutual_exclusion() {
        hosted::install();
        let counter = Arc::new(Counter {
            mutex: KMutex::new(),
            value: UnsafeCell::new(0),
            inside: AtomicUsize::new(0),
        });
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        let _guard = counter.mutex.acquire();
                        assert_eq!(counter.inside.fetch_add(1, Ordering::SeqCst), 0);
                        unsafe { *counter.value.get() += 1 };
                        counter.inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { *counter.value.get() }, 40_000);
        assert_eq!(counter.mutex.word(), MutexWord::UNLOCKED);
    }

    #[test]
    fn test_try_lock_and_owner() {
        hosted::install();
        let mutex = KMutex::new();
        assert!(mutex.try_lock());
        assert_eq!(mutex.owner(), Some(hal::scheduler().current_task()));
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(!mutex.is_locked());
    }

    #[test]
    fn test_lock_timeout_expires() {
        hosted::install();
        let mutex = Arc::new(KMutex::new());
        mutex.lock();
        let contender = mutex.clone();
        let result = thread::spawn(move || contender.lock_timeout(20_000_000))
            .join()
            .unwrap();
        assert_eq!(result, Err(WaitError::Timeout));
        mutex.unlock();
        assert_eq!(mutex.word(), MutexWord::UNLOCKED);
    }

    #[test]
    fn test_lock_interruptible_sees_signal() {
        hosted::install();
        let mutex = Arc::new(KMutex::new());
        mutex.lock();
        let (tx, rx) = mpsc::channel();
        let contender = mutex.clone();
        let handle = thread::spawn(move || {
            tx.send(hal::scheduler().current_task()).unwrap();
            contender.lock_interruptible()
        });
        let task = rx.recv().unwrap();
        thread::sleep(Duration::from_millis(10));
        assert!(hosted::send_signal(task));
        assert_eq!(handle.join().unwrap(), Err(WaitError::Interrupted));
        mutex.unlock();
    }

    #[test]
    fn test_unlock_hands_over_to_waiter() {
        hosted::install();
        let mutex = Arc::new(KMutex::new());
        mutex.lock();
        let contender = mutex.clone();
        let handle = thread::spawn(move || {
            contender.lock_timeout(5_000_000_000).map(|()| {
                let owner = contender.owner();
                contender.unlock();
                owner
            })
        });
        thread::sleep(Duration::from_millis(10));
        mutex.unlock();
        let owner = handle.join().unwrap();
        assert!(matches!(owner, Ok(Some(_))));
        assert_ne!(owner, Ok(Some(hal::scheduler().current_task())));
    }

    #[test]
    #[should_panic(expected = "THREAD_NOT_MUTEX_OWNER")]
    fn test_unlock_by_non_owner_bugchecks() {
        hosted::install();
        let mutex = Arc::new(KMutex::new());
        let holder = mutex.clone();
        thread::spawn(move || holder.lock()).join().unwrap();
        mutex.unlock();
    }
}
