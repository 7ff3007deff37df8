//! Scheduler collaborator interface
//!
//! The substrate does not pick tasks or own run queues. It only needs to
//! put the current task to sleep and wake another one without losing a
//! wakeup that races with the sleep. That is done with tickets:
//!
//! 1. The waiter calls [`Scheduler::blocking_ticket`] *before* publishing
//!    itself on a wait list. This invalidates every older ticket.
//! 2. The waker reads the waiter's ticket off the list and calls
//!    [`Scheduler::wake`] with it.
//! 3. The waiter calls [`Scheduler::block`] with its ticket. If a wake for
//!    that ticket already happened, the ticket is stale and `block`
//!    returns at once.
//!
//! A wake carrying a stale ticket (one issued before the task's latest
//! `blocking_ticket`) returns false and has no effect.
//!
//! A wake never implies the awaited condition holds; every primitive
//! re-validates under its own lock after `block` returns.

use core::fmt;
use core::num::NonZeroU32;

use super::wait::Deadline;

/// Identity of a schedulable task
///
/// Non-zero, so `Option<TaskId>` packs into the mutex owner word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(NonZeroU32);

impl TaskId {
    pub const fn new(raw: NonZeroU32) -> Self {
        Self(raw)
    }

    /// Build from a raw id; `None` for 0
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Wake ticket; strictly increasing per task
pub type Ticket = u64;

/// Task state, as seen by a blocking call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable or running
    Runnable,
    /// Blocked; a pending signal ends the block
    Interruptible,
    /// Blocked; only a wake or the deadline ends the block
    Uninterruptible,
    /// Exited, awaiting reaping
    Zombie,
}

/// The scheduler as the substrate sees it
///
/// Implemented by the kernel's scheduler; [`crate::hal::hosted`] provides a
/// std-thread implementation.
pub trait Scheduler: Sync {
    /// The calling task
    fn current_task(&self) -> TaskId;

    /// Issue a fresh ticket for the calling task, invalidating older ones
    fn blocking_ticket(&self) -> Ticket;

    /// Wake `task` if `ticket` is still its current ticket
    ///
    /// Returns false (and does nothing) for a stale ticket.
    fn wake(&self, task: TaskId, ticket: Ticket) -> bool;

    /// Block the calling task until woken with `ticket`, the deadline
    /// passes, or (in [`TaskState::Interruptible`]) a signal is pending
    ///
    /// Returns immediately if `ticket` is already stale. Spurious returns
    /// are allowed.
    fn block(&self, deadline: Deadline, state: TaskState, ticket: Ticket);

    /// Voluntarily give up the processor
    fn schedule(&self);

    /// Whether the calling task has a signal pending
    fn has_pending_signal(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_niche() {
        assert_eq!(
            core::mem::size_of::<Option<TaskId>>(),
            core::mem::size_of::<u32>()
        );
        assert!(TaskId::from_raw(0).is_none());
        assert_eq!(TaskId::from_raw(42).map(TaskId::as_u32), Some(42));
    }
}
