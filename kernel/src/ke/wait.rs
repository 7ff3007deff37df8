//! Wait Support
//!
//! Shared plumbing for the blocking primitives (mutex, semaphore, rwmutex,
//! event, condwait):
//!
//! - [`Deadline`]: absolute timeout against the monotonic clock, fixed when
//!   the wait starts
//! - [`WaitMode`] / [`WaitError`]: interruptible waits and their failures
//! - [`Waiter`]: a wait record living on the blocked caller's stack
//! - [`WaitList`]: FIFO of waiters, guarded by the primitive's lock
//! - [`WakeTarget`]: what a waker copies out before dropping the lock
//!
//! # Wait protocol
//!
//! Under the primitive's lock, a waiter takes a fresh scheduler ticket and
//! queues itself. It drops the lock and blocks with the ticket. A waker
//! dequeues (or marks) the waiter under the same lock, copies the task and
//! ticket into a [`WakeTarget`], and only then releases the waiter record.
//! The wake itself happens after the lock is dropped, and touches nothing
//! on the waiter's stack.
//!
//! A wake is never taken as success: the woken task re-takes the lock and
//! checks its own state (`queued`, `granted`, or the awaited condition).
//!
//! # Status Codes
//!
//! [`WaitError::status`] maps to the NT wait status values.

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use super::bugcheck::codes;
use super::irql::{self, Irql};
use super::list::{ListEntry, ListHead};
use super::scheduler::{TaskId, TaskState, Ticket};
use crate::containing_record;
use crate::hal;

/// Timeout value meaning "wait forever"
pub const NO_TIMEOUT: u64 = u64::MAX;

/// STATUS_SUCCESS - the wait was satisfied
pub const STATUS_SUCCESS: i32 = 0x0000_0000;
/// STATUS_ALERTED - the wait was interrupted by a signal
pub const STATUS_ALERTED: i32 = 0x0000_0101;
/// STATUS_TIMEOUT - the deadline passed
pub const STATUS_TIMEOUT: i32 = 0x0000_0102;

/// Absolute point on the monotonic clock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Deadline {
    Never,
    /// Nanoseconds since boot
    At(u64),
}

impl Deadline {
    /// Deadline `timeout_ns` from now; [`NO_TIMEOUT`] means never
    pub fn after(timeout_ns: u64) -> Self {
        if timeout_ns == NO_TIMEOUT {
            Deadline::Never
        } else {
            Deadline::At(hal::now_ns().saturating_add(timeout_ns))
        }
    }

    #[inline]
    pub fn expired(self) -> bool {
        match self {
            Deadline::Never => false,
            Deadline::At(at) => hal::now_ns() >= at,
        }
    }
}

/// Whether a pending signal ends the wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    Uninterruptible,
    Interruptible,
}

impl WaitMode {
    #[inline]
    pub fn task_state(self) -> TaskState {
        match self {
            WaitMode::Uninterruptible => TaskState::Uninterruptible,
            WaitMode::Interruptible => TaskState::Interruptible,
        }
    }
}

/// Why a wait ended without acquiring
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed
    Timeout,
    /// A signal is pending for the waiting task
    Interrupted,
}

impl WaitError {
    /// NTSTATUS-style code for the failure
    pub const fn status(self) -> i32 {
        match self {
            WaitError::Timeout => STATUS_TIMEOUT,
            WaitError::Interrupted => STATUS_ALERTED,
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "wait timed out"),
            WaitError::Interrupted => write!(f, "wait interrupted by signal"),
        }
    }
}

/// Map a wait result to its status code
pub fn wait_status(result: Result<(), WaitError>) -> i32 {
    match result {
        Ok(()) => STATUS_SUCCESS,
        Err(err) => err.status(),
    }
}

/// Bug check unless the caller may block
///
/// Every blocking entry point calls this; `object` is reported in the
/// bug check parameters.
#[inline]
pub(crate) fn assert_can_block(object: usize) {
    let level = irql::current_level();
    if level != Irql::Normal {
        crate::bugcheck!(codes::IRQL_NOT_LESS_OR_EQUAL, object, level.as_u8());
    }
}

/// Timeout first, then a pending signal
#[inline]
pub(crate) fn check_abort(deadline: Deadline, mode: WaitMode) -> Result<(), WaitError> {
    if deadline.expired() {
        return Err(WaitError::Timeout);
    }
    if mode == WaitMode::Interruptible && hal::scheduler().has_pending_signal() {
        return Err(WaitError::Interrupted);
    }
    Ok(())
}

/// A task's record on a wait list
///
/// Lives on the waiting task's stack. Every field but `queued` is only
/// read or written under the owning primitive's lock.
pub struct Waiter {
    entry: UnsafeCell<ListEntry>,
    task: TaskId,
    ticket: Cell<Ticket>,
    queued: AtomicBool,
    granted: Cell<bool>,
}

impl Waiter {
    /// Wait record for the calling task
    pub fn new() -> Self {
        Self {
            entry: UnsafeCell::new(ListEntry::new()),
            task: hal::scheduler().current_task(),
            ticket: Cell::new(0),
            queued: AtomicBool::new(false),
            granted: Cell::new(false),
        }
    }

    #[inline]
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Take a fresh ticket; call under the lock, before the waiter can be
    /// seen by a waker
    #[inline]
    pub fn prepare(&self) -> Ticket {
        let ticket = hal::scheduler().blocking_ticket();
        self.ticket.set(ticket);
        ticket
    }

    /// Still on a wait list
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }

    /// A waker handed this waiter what it was waiting for
    #[inline]
    pub fn is_granted(&self) -> bool {
        self.granted.get()
    }

    /// Block with the ticket from the last [`Waiter::prepare`]
    ///
    /// Call with the lock dropped and at Normal.
    #[inline]
    pub fn block(&self, deadline: Deadline, mode: WaitMode) {
        hal::scheduler().block(deadline, mode.task_state(), self.ticket.get());
    }

    /// Wake target of a waiter that stays queued
    ///
    /// # Safety
    /// `waiter` must be on a list whose lock the caller holds.
    pub unsafe fn target(waiter: NonNull<Waiter>) -> WakeTarget {
        let waiter = waiter.as_ref();
        WakeTarget {
            task: waiter.task,
            ticket: waiter.ticket.get(),
        }
    }

    /// Finish a waker's handling of a dequeued waiter
    ///
    /// Copies the wake target before clearing `queued`; once `queued` is
    /// clear the waiter may return and its stack frame may be gone.
    ///
    /// # Safety
    /// `waiter` must be off every list, and the caller must hold the lock
    /// that guarded the list it came from.
    pub unsafe fn release(waiter: NonNull<Waiter>, granted: bool) -> WakeTarget {
        let waiter = waiter.as_ref();
        let target = WakeTarget {
            task: waiter.task,
            ticket: waiter.ticket.get(),
        };
        waiter.granted.set(granted);
        waiter.queued.store(false, Ordering::Release);
        target
    }
}

/// Task and ticket to wake, copied out of a [`Waiter`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "a dequeued waiter must be woken"]
pub struct WakeTarget {
    pub task: TaskId,
    pub ticket: Ticket,
}

impl WakeTarget {
    /// Wake the task; false if the ticket went stale
    #[inline]
    pub fn wake(self) -> bool {
        hal::scheduler().wake(self.task, self.ticket)
    }
}

/// FIFO of waiters
///
/// Always accessed under the owning primitive's lock.
pub struct WaitList {
    head: ListHead,
}

// Waiters are only reached through the list while its lock is held
unsafe impl Send for WaitList {}

impl WaitList {
    pub const fn new() -> Self {
        Self {
            head: ListHead::new(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.head.len()
    }

    /// Queue `waiter` at the tail
    ///
    /// # Safety
    /// `waiter` must stay alive (and pinned) until it is off the list.
    pub unsafe fn push_back(&mut self, waiter: &Waiter) {
        waiter.granted.set(false);
        waiter.queued.store(true, Ordering::Relaxed);
        self.head.insert_tail(waiter.entry.get());
    }

    /// Dequeue the head; the caller finishes with [`Waiter::release`]
    pub fn pop_front(&mut self) -> Option<NonNull<Waiter>> {
        // SAFETY: every linked entry belongs to a live Waiter
        unsafe {
            let entry = self.head.remove_head();
            NonNull::new(entry).map(|entry| {
                NonNull::new_unchecked(containing_record!(entry.as_ptr(), Waiter, entry))
            })
        }
    }

    /// Dequeue the head and release it in one step
    pub fn wake_one(&mut self, granted: bool) -> Option<WakeTarget> {
        // SAFETY: popped under the caller's lock
        self.pop_front()
            .map(|waiter| unsafe { Waiter::release(waiter, granted) })
    }

    /// The head, left queued
    pub fn peek_front(&self) -> Option<NonNull<Waiter>> {
        NonNull::new(self.head.first()).map(|entry| {
            // SAFETY: every linked entry belongs to a live Waiter
            unsafe { NonNull::new_unchecked(containing_record!(entry.as_ptr(), Waiter, entry)) }
        })
    }

    /// Take `waiter` off the list if it is still queued
    ///
    /// Returns false if a waker already dequeued it.
    pub fn remove(&mut self, waiter: &Waiter) -> bool {
        if !waiter.queued.load(Ordering::Relaxed) {
            return false;
        }
        // SAFETY: queued waiters are linked into this list
        unsafe {
            self.head.remove_entry(waiter.entry.get());
        }
        waiter.queued.store(false, Ordering::Relaxed);
        true
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(WaitError::Timeout.status(), STATUS_TIMEOUT);
        assert_eq!(WaitError::Interrupted.status(), STATUS_ALERTED);
        assert_eq!(wait_status(Ok(())), STATUS_SUCCESS);
        assert_eq!(wait_status(Err(WaitError::Timeout)), 0x102);
        assert_eq!(std::format!("{}", WaitError::Timeout), "wait timed out");
    }

    #[test]
    fn test_deadline() {
        hal::hosted::install();
        assert_eq!(Deadline::after(NO_TIMEOUT), Deadline::Never);
        assert!(!Deadline::Never.expired());
        assert!(Deadline::after(0).expired());
        assert!(!Deadline::after(60_000_000_000).expired());
    }

    #[test]
    fn test_wait_list_fifo_and_remove() {
        hal::hosted::install();
        let a = Waiter::new();
        let b = Waiter::new();
        let c = Waiter::new();
        let mut list = WaitList::new();
        unsafe {
            list.push_back(&a);
            list.push_back(&b);
            list.push_back(&c);
        }
        assert_eq!(list.len(), 3);
        assert!(list.remove(&b));
        assert!(!list.remove(&b));
        assert_eq!(list.peek_front().map(|w| w.as_ptr() as *const Waiter), Some(&a as *const Waiter));

        let target = list.wake_one(true);
        assert!(target.is_some());
        assert!(!a.is_queued());
        assert!(a.is_granted());
        assert!(c.is_queued());
        assert!(list.remove(&c));
        assert!(list.is_empty());
    }

    #[test]
    fn test_wake_target_carries_latest_ticket() {
        hal::hosted::install();
        let waiter = Waiter::new();
        let mut list = WaitList::new();
        waiter.prepare();
        let ticket = waiter.prepare();
        unsafe { list.push_back(&waiter) };
        let target = list.wake_one(false).unwrap_or_else(|| panic!("waiter missing"));
        assert_eq!(target.ticket, ticket);
        assert_eq!(target.task, waiter.task());
        assert!(target.wake());
        // Consumed: blocking with it returns at once
        waiter.block(Deadline::Never, WaitMode::Uninterruptible);
    }

    #[test]
    #[should_panic(expected = "IRQL_NOT_LESS_OR_EQUAL")]
    fn test_blocking_at_dispatch_bugchecks() {
        hal::hosted::install();
        let _dpc = irql::disable_dpc();
        assert_can_block(0);
    }
}
