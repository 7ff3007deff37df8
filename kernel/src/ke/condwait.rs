//! Hashed Condition Wait
//!
//! Lets a task sleep until an arbitrary predicate over some object becomes
//! true, without the object embedding a wait list. Waiters are kept in a
//! fixed table of buckets, selected by hashing the object's address.
//!
//! The predicate is evaluated under the bucket lock. Whoever makes it true
//! must then call [`touch`] with the same key, which wakes every waiter in
//! the bucket. Distinct keys can share a bucket, so a touch may wake
//! waiters whose predicate is still false; they re-check and sleep again.
//!
//! # Usage
//! ```ignore
//! let key = CondWaitKey::of(&device.status);
//! condwait(key, || device.status.load(Ordering::Acquire) == READY);
//!
//! // Elsewhere:
//! device.status.store(READY, Ordering::Release);
//! condwait_touch(key);
//! ```

use super::spinlock::{SpinLock, SpinLockGuard};
use super::wait::{self, Deadline, WaitError, WaitList, WaitMode, Waiter};

/// Number of buckets in the table
pub const CONDWAIT_BUCKETS: usize = 256;

const BUCKET: SpinLock<WaitList> = SpinLock::new(WaitList::new());
static TABLE: [SpinLock<WaitList>; CONDWAIT_BUCKETS] = [BUCKET; CONDWAIT_BUCKETS];

/// Identity of the object being waited on (its address)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CondWaitKey(usize);

impl CondWaitKey {
    /// Key for `obj`, by address
    #[inline]
    pub fn of<T: ?Sized>(obj: &T) -> Self {
        Self(obj as *const T as *const () as usize)
    }

    #[inline]
    pub const fn from_addr(addr: usize) -> Self {
        Self(addr)
    }

    /// Bucket index of the key
    #[inline]
    pub const fn bucket(self) -> usize {
        let mut x = self.0;
        x ^= x << 7;
        x ^= x >> 9;
        x & (CONDWAIT_BUCKETS - 1)
    }

    #[inline]
    fn table_entry(self) -> &'static SpinLock<WaitList> {
        &TABLE[self.bucket()]
    }
}

/// Sleep until `predicate` holds, the deadline passes, or (interruptible
/// mode) a signal is pending
///
/// The predicate runs at Dispatch with the bucket lock held; it must not
/// block. Returns `Ok` as soon as it is observed true, even past the
/// deadline.
pub fn wait_on<F>(
    key: CondWaitKey,
    mut predicate: F,
    deadline: Deadline,
    mode: WaitMode,
) -> Result<(), WaitError>
where
    F: FnMut() -> bool,
{
    wait::assert_can_block(key.0);

    let bucket = key.table_entry();
    let waiter = Waiter::new();
    loop {
        let mut list = bucket.lock();
        list.remove(&waiter);
        if predicate() {
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

/// Wake every waiter in `key`'s bucket
///
/// Wakes only those queued when the call starts; waiters that re-queue
/// meanwhile stay asleep.
pub fn touch(key: CondWaitKey) {
    let bucket = key.table_entry();
    let mut list = bucket.lock();
    let mut remaining = list.len();
    while remaining > 0 {
        let Some(target) = list.wake_one(false) else {
            break;
        };
        remaining -= 1;
        // Wake with the lock dropped but preemption still off
        let level = SpinLockGuard::unlock_keep_level(list);
        target.wake();
        list = bucket.relock(level);
    }
}

/// Sleep until `predicate` holds
pub fn condwait<F: FnMut() -> bool>(key: CondWaitKey, predicate: F) {
    // Without a deadline or signals the wait can only end in success
    let _ = wait_on(key, predicate, Deadline::Never, WaitMode::Uninterruptible);
}

pub fn condwait_interruptible<F: FnMut() -> bool>(
    key: CondWaitKey,
    predicate: F,
) -> Result<(), WaitError> {
    wait_on(key, predicate, Deadline::Never, WaitMode::Interruptible)
}

pub fn condwait_timeout<F: FnMut() -> bool>(
    key: CondWaitKey,
    predicate: F,
    timeout_ns: u64,
) -> Result<(), WaitError> {
    wait_on(
        key,
        predicate,
        Deadline::after(timeout_ns),
        WaitMode::Uninterruptible,
    )
}

pub fn condwait_timeout_interruptible<F: FnMut() -> bool>(
    key: CondWaitKey,
    predicate: F,
    timeout_ns: u64,
) -> Result<(), WaitError> {
    wait_on(
        key,
        predicate,
        Deadline::after(timeout_ns),
        WaitMode::Interruptible,
    )
}

#[inline]
pub fn condwait_touch(key: CondWaitKey) {
    touch(key);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{self, hosted};
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_bucket_hash() {
        assert_eq!(CondWaitKey::from_addr(0).bucket(), 0);
        // 1 -> 1 ^ (1 << 7) = 0x81 -> 0x81 ^ 0 = 0x81
        assert_eq!(CondWaitKey::from_addr(1).bucket(), 0x81);
        for addr in [0x1000usize, 0xdead_beef, usize::MAX] {
            assert!(CondWaitKey::from_addr(addr).bucket() < CONDWAIT_BUCKETS);
        }
    }

    fn spin_until(done: impl Fn() -> bool) {
        while !done() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    struct Flag {
        ready: AtomicBool,
        evaluations: AtomicUsize,
    }

    #[test]
    fn test_collision_wakes_spuriously_then_sleeps_again() {
        hosted::install();
        let flag = Arc::new(Flag {
            ready: AtomicBool::new(false),
            evaluations: AtomicUsize::new(0),
        });
        let key = CondWaitKey::of(&*flag);
        let mut addr = 0x10_0000usize;
        let collider = loop {
            let candidate = CondWaitKey::from_addr(addr);
            if candidate != key && candidate.bucket() == key.bucket() {
                break candidate;
            }
            addr += 8;
        };

        let waiting = flag.clone();
        let handle = thread::spawn(move || {
            condwait(key, || {
                waiting.evaluations.fetch_add(1, Ordering::SeqCst);
                waiting.ready.load(Ordering::Acquire)
            })
        });

        // Other tests share the table, so counts only ever grow past these
        spin_until(|| flag.evaluations.load(Ordering::SeqCst) >= 1);
        touch(collider);
        spin_until(|| flag.evaluations.load(Ordering::SeqCst) >= 2);
        assert!(!handle.is_finished());

        flag.ready.store(true, Ordering::Release);
        touch(key);
        handle.join().unwrap();
        assert!(flag.evaluations.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_timeout_and_interrupt() {
        hosted::install();
        let object = 0u64;
        let key = CondWaitKey::of(&object);

        let start = hal::now_ns();
        assert_eq!(condwait_timeout(key, || false, 10_000_000), Err(WaitError::Timeout));
        assert!(hal::now_ns() - start >= 10_000_000);

        // A true predicate wins even with the deadline gone
        assert_eq!(condwait_timeout(key, || true, 0), Ok(()));

        assert!(hosted::send_signal(hal::scheduler().current_task()));
        assert_eq!(condwait_interruptible(key, || false), Err(WaitError::Interrupted));
        assert_eq!(
            condwait_timeout_interruptible(key, || false, 1_000_000_000),
            Err(WaitError::Interrupted)
        );
        hosted::clear_signal();
    }

    #[test]
    fn test_many_waiters_one_touch() {
        hosted::install();
        let ready = Arc::new(AtomicBool::new(false));
        let key = CondWaitKey::of(&*ready);
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let ready = ready.clone();
                thread::spawn(move || condwait(key, || ready.load(Ordering::Acquire)))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        ready.store(true, Ordering::Release);
        condwait_touch(key);
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
