//! Kernel Executive (ke)
//!
//! The IRQL concurrency substrate every other subsystem builds on:
//!
//! - **IRQL**: per-processor NORMAL / DISPATCH / HIGH nesting
//! - **Preemption**: nesting counter plus deferred reschedule
//! - **DPC**: per-processor FIFO of deferred calls, run at DISPATCH
//! - **KTimer**: per-processor ordered timer queue, expired from a DPC
//! - **Spinlocks**: raw, DPC-safe and interrupt-safe disciplines
//! - **Blocking primitives**: KMUTEX, KSEMAPHORE, reader/writer mutex,
//!   hashed condition wait and a one-shot KEVENT
//!
//! # IRQL (Interrupt Request Level)
//!
//! - NORMAL (0): task context, may block
//! - DISPATCH (2): DPCs run, no preemption, must not block
//! - HIGH (31): interrupt handlers, hardware interrupts masked
//!
//! Levels only nest. Lowering back to NORMAL runs pending DPCs and honors
//! a reschedule requested while preemption was off.
//!
//! # Wait protocol
//!
//! Blocking primitives queue a [`wait::Waiter`] on the caller's stack and
//! hand the scheduler a ticket taken under the primitive's lock. A wake
//! with a stale ticket is ignored, and a woken waiter always re-validates.
//! See [`wait`].
//!
//! # Key Structures
//!
//! - `CpuLocal`: per-processor storage, set up at processor bring-up
//! - `KDpc`, `KTimer`: embedded in their owner, linked while queued
//! - `KMutex`, `KSemaphore`, `KRwMutex`, `KEvent`: static or owner-embedded

// Core modules
pub mod bugcheck;
pub mod list;
pub mod percpu;
pub mod scheduler;

// Execution levels
pub mod irql;
pub mod preempt;

// Deferred execution
pub mod dpc;
pub mod timer;

// Synchronization primitives
pub mod spinlock;
pub mod wait;
pub mod mutex;
pub mod semaphore;
pub mod rwmutex;
pub mod condwait;
pub mod event;

// Re-export key types
pub use list::{ListEntry, ListHead};
pub use percpu::{CpuLocal, MAX_CPUS};
pub use scheduler::{Scheduler, TaskId, TaskState, Ticket};
pub use bugcheck::{ke_bugcheck, ke_bugcheck_ex, BugCheckData};

// Re-export IRQL types
pub use irql::{Irql, IrqlCookie, IrqlGuard};
pub use preempt::PreemptGuard;

// Re-export deferred execution types
pub use dpc::{KDpc, DpcRoutine};
pub use timer::{KTimer, TimerCallback, EXPIRE_NEVER};

// Re-export synchronization types
pub use spinlock::{SpinLock, SpinLockGuard, RawSpinLock, LevelToken};
pub use mutex::{KMutex, MutexGuard};
pub use semaphore::KSemaphore;
pub use rwmutex::{KRwMutex, ReadGuard, WriteGuard};
pub use condwait::CondWaitKey;
pub use event::KEvent;

// Re-export wait types
pub use wait::{
    wait_status, Deadline, WaitError, WaitMode,
    NO_TIMEOUT, STATUS_ALERTED, STATUS_SUCCESS, STATUS_TIMEOUT,
};
