//! Kernel Spinlock Implementation (KSPIN_LOCK)
//!
//! Spinlocks provide mutual exclusion for short critical sections. They
//! busy-wait (test-and-test-and-set) until the lock becomes available, and
//! are neither reentrant nor fair.
//!
//! Three disciplines, chosen by the acquiring call:
//!
//! - [`SpinLock::lock_raw`]: flag only; the caller manages IRQL
//! - [`SpinLock::lock`]: raises to Dispatch, so DPCs and preemption cannot
//!   interleave with the holder on this processor
//! - [`SpinLock::lock_irq`]: disables interrupts and raises to High, for
//!   data shared with interrupt handlers
//!
//! A guard can drop the lock while keeping its level
//! ([`SpinLockGuard::unlock_keep_level`]). Blocking primitives use this to
//! publish a waiter, release the lock, and wake or block without a window
//! where this processor could run a DPC against half-updated state.
//!
//! # Usage
//! ```ignore
//! static COUNTERS: SpinLock<[u64; 4]> = SpinLock::new([0; 4]);
//!
//! let mut counters = COUNTERS.lock();
//! counters[0] += 1;
//! // guard dropped, lock released, IRQL lowered
//! ```

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use super::bugcheck::codes;
use super::irql::{self, Irql, IrqlCookie};
use crate::hal;

#[inline]
fn acquire_flag(locked: &AtomicBool) {
    loop {
        if locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        // Spin on a plain load to keep the cache line shared
        while locked.load(Ordering::Relaxed) {
            hal::spin_hint();
        }
    }
}

#[inline]
fn try_acquire_flag(locked: &AtomicBool) -> bool {
    locked
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

#[inline]
fn release_flag(locked: &AtomicBool) {
    if !locked.swap(false, Ordering::Release) {
        crate::bugcheck!(codes::SPIN_LOCK_NOT_OWNED, locked as *const AtomicBool as usize);
    }
}

/// How a guard entered its critical section
enum Discipline {
    Raw,
    Dpc(IrqlCookie),
    Irq {
        cookie: IrqlCookie,
        interrupts_enabled: bool,
    },
}

impl Discipline {
    fn enter_dpc() -> Self {
        Discipline::Dpc(irql::raise(Irql::Dispatch))
    }

    fn enter_irq() -> Self {
        let interrupts_enabled = hal::save_and_disable_interrupts();
        Discipline::Irq {
            cookie: irql::raise(Irql::High),
            interrupts_enabled,
        }
    }

    fn leave(self) {
        match self {
            Discipline::Raw => {}
            Discipline::Dpc(cookie) => irql::lower(cookie),
            Discipline::Irq {
                cookie,
                interrupts_enabled,
            } => {
                hal::restore_interrupts(interrupts_enabled);
                irql::lower(cookie);
            }
        }
    }
}

/// A spinlock for mutual exclusion
///
/// Equivalent to NT's KSPIN_LOCK
#[repr(C)]
pub struct SpinLock<T> {
    /// Lock state (true = locked)
    locked: AtomicBool,
    /// Protected data
    data: UnsafeCell<T>,
}

// SpinLock is Sync if T is Send (data can be sent between threads)
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire without touching IRQL
    #[inline]
    pub fn lock_raw(&self) -> SpinLockGuard<'_, T> {
        acquire_flag(&self.locked);
        self.guard(Discipline::Raw)
    }

    /// Raise to Dispatch, then acquire
    ///
    /// Equivalent to KeAcquireSpinLock
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let discipline = Discipline::enter_dpc();
        acquire_flag(&self.locked);
        self.guard(discipline)
    }

    /// Disable interrupts, raise to High, then acquire
    ///
    /// Interrupts are restored to their previous state on release.
    #[inline]
    pub fn lock_irq(&self) -> SpinLockGuard<'_, T> {
        let discipline = Discipline::enter_irq();
        acquire_flag(&self.locked);
        self.guard(discipline)
    }

    /// Try to acquire without touching IRQL
    #[inline]
    pub fn try_lock_raw(&self) -> Option<SpinLockGuard<'_, T>> {
        if try_acquire_flag(&self.locked) {
            Some(self.guard(Discipline::Raw))
        } else {
            None
        }
    }

    /// Try to acquire at Dispatch
    ///
    /// On failure the IRQL is restored before returning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.try_lock_with(Discipline::enter_dpc())
    }

    /// Try to acquire at High with interrupts disabled
    #[inline]
    pub fn try_lock_irq(&self) -> Option<SpinLockGuard<'_, T>> {
        self.try_lock_with(Discipline::enter_irq())
    }

    /// Re-acquire at the level kept by [`SpinLockGuard::unlock_keep_level`]
    #[inline]
    pub fn relock(&self, token: LevelToken) -> SpinLockGuard<'_, T> {
        acquire_flag(&self.locked);
        self.guard(token.discipline)
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Mutable access without locking; the borrow proves exclusivity
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn try_lock_with(&self, discipline: Discipline) -> Option<SpinLockGuard<'_, T>> {
        if try_acquire_flag(&self.locked) {
            Some(self.guard(discipline))
        } else {
            discipline.leave();
            None
        }
    }

    #[inline]
    fn guard(&self, discipline: Discipline) -> SpinLockGuard<'_, T> {
        SpinLockGuard {
            lock: self,
            discipline: Some(discipline),
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for spinlock
///
/// Releases the lock, then restores interrupts and IRQL, when dropped
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    discipline: Option<Discipline>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// Release the lock but stay at the guard's IRQL
    ///
    /// The returned token either re-acquires the lock
    /// ([`SpinLock::relock`]) or restores the level ([`LevelToken::restore`]).
    pub fn unlock_keep_level(mut guard: Self) -> LevelToken {
        let discipline = guard.discipline.take().unwrap_or(Discipline::Raw);
        release_flag(&guard.lock.locked);
        core::mem::forget(guard);
        LevelToken { discipline }
    }
}

impl<'a, T> Deref for SpinLockGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for SpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        release_flag(&self.lock.locked);
        if let Some(discipline) = self.discipline.take() {
            discipline.leave();
        }
    }
}

/// IRQL (and interrupt state) left behind by
/// [`SpinLockGuard::unlock_keep_level`]
#[must_use = "the kept IRQL must be restored or handed to relock"]
pub struct LevelToken {
    discipline: Discipline,
}

impl LevelToken {
    /// Lower back to where the original lock call started
    pub fn restore(self) {
        self.discipline.leave();
    }
}

/// A raw spinlock without data protection
///
/// The bare flag; no IRQL or interrupt handling. Use when you need to
/// protect external data or need more control over the critical section.
#[repr(C)]
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    /// Create a new unlocked spinlock
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn acquire(&self) {
        acquire_flag(&self.locked);
    }

    /// Try to acquire without blocking
    #[inline]
    pub fn try_acquire(&self) -> bool {
        try_acquire_flag(&self.locked)
    }

    /// Release the lock
    ///
    /// Releasing a lock that is not held is a bug check (SPIN_LOCK_NOT_OWNED).
    #[inline]
    pub fn release(&self) {
        release_flag(&self.locked);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_spinlock_mutual_exclusion() {
        hal::hosted::install();
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..5_000 {
                        let mut value = lock.lock();
                        let seen = *value;
                        *value = seen + 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock_raw(), 40_000);
    }

    #[test]
    fn test_disciplines_set_and_restore_level() {
        hal::hosted::install();
        let lock = SpinLock::new(());
        {
            let _guard = lock.lock();
            assert_eq!(irql::current_level(), Irql::Dispatch);
            assert!(lock.try_lock().is_none());
            assert_eq!(irql::current_level(), Irql::Dispatch);
        }
        {
            let _guard = lock.lock_irq();
            assert_eq!(irql::current_level(), Irql::High);
            assert!(!hal::platform().arch.interrupts_enabled());
        }
        assert!(hal::platform().arch.interrupts_enabled());
        {
            let _guard = lock.lock_raw();
            assert_eq!(irql::current_level(), Irql::Normal);
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_unlock_keep_level_then_relock() {
        hal::hosted::install();
        let lock = SpinLock::new(1u32);
        let guard = lock.lock();
        let token = SpinLockGuard::unlock_keep_level(guard);
        assert!(!lock.is_locked());
        assert_eq!(irql::current_level(), Irql::Dispatch);

        let mut guard = lock.relock(token);
        *guard += 1;
        drop(guard);
        assert_eq!(irql::current_level(), Irql::Normal);

        let token = SpinLockGuard::unlock_keep_level(lock.lock());
        token.restore();
        assert_eq!(irql::current_level(), Irql::Normal);
        assert_eq!(*lock.lock_raw(), 2);
    }

    #[test]
    #[should_panic(expected = "SPIN_LOCK_NOT_OWNED")]
    fn test_double_release_bugchecks() {
        hal::hosted::install();
        let lock = RawSpinLock::new();
        lock.acquire();
        assert!(!lock.try_acquire());
        lock.release();
        lock.release();
    }
}
