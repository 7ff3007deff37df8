//! Preemption Accounting
//!
//! Each processor keeps a preemption nesting counter and a deferred
//! reschedule flag. While the counter is non-zero (or the processor is above
//! Normal) the current task cannot be switched out. A reschedule requested
//! meanwhile is remembered and honored once the last
//! [`preempt_enable`] brings the counter back to zero at Normal.
//!
//! The reschedule loop holds the counter at one while it calls into the
//! scheduler, so a request raised by the scheduler itself is picked up by
//! the next iteration instead of recursing.

use core::cell::Cell;

use super::bugcheck::codes;
use super::irql::{self, Irql};
use super::percpu::{CpuLocal, MAX_CPUS};
use crate::hal;

pub(crate) struct PreemptState {
    nesting: Cell<u32>,
    need_resched: Cell<bool>,
}

impl PreemptState {
    const fn new() -> Self {
        Self {
            nesting: Cell::new(0),
            need_resched: Cell::new(false),
        }
    }
}

const INIT: PreemptState = PreemptState::new();
static PREEMPT: CpuLocal<PreemptState> = CpuLocal::new([INIT; MAX_CPUS]);

pub(crate) fn init_cpu(cpu: usize) {
    // SAFETY: called from bring-up, before `cpu` runs any task
    let state = unsafe { PREEMPT.get_on(cpu) };
    state.nesting.set(0);
    state.need_resched.set(false);
}

/// Current preemption nesting count
#[inline]
pub fn preempt_count() -> u32 {
    PREEMPT.get().nesting.get()
}

/// Whether a reschedule is waiting to be honored
#[inline]
pub fn need_resched() -> bool {
    PREEMPT.get().need_resched.get()
}

/// Whether the current task could be switched out right now
#[inline]
pub fn preemptible() -> bool {
    preempt_count() == 0 && irql::current_level() == Irql::Normal
}

#[inline]
pub fn preempt_disable() {
    let state = PREEMPT.get();
    state.nesting.set(state.nesting.get() + 1);
}

pub fn preempt_enable() {
    let state = PREEMPT.get();
    let nesting = match state.nesting.get().checked_sub(1) {
        Some(nesting) => nesting,
        None => crate::bugcheck!(codes::IRQL_UNEXPECTED_VALUE, 0u32, 0u32),
    };
    state.nesting.set(nesting);
    if nesting == 0 && state.need_resched.get() && irql::current_level() == Irql::Normal {
        reschedule();
    }
}

/// Request a reschedule of the calling processor
///
/// Also marks DPC work pending, so the request is seen the next time the
/// processor lowers to Normal even if nothing else was queued.
pub fn set_pending_reschedule() {
    PREEMPT.get().need_resched.set(true);
    irql::set_pending_dispatch();
}

/// Honor a pending reschedule if the processor is preemptible
///
/// Called by the IRQL code after draining DPCs on the way to Normal.
pub(crate) fn check_pending_reschedule() {
    let state = PREEMPT.get();
    if state.nesting.get() == 0 && state.need_resched.get() {
        reschedule();
    }
}

fn reschedule() {
    loop {
        // The task may resume on another processor
        let state = PREEMPT.get();
        state.nesting.set(1);
        state.need_resched.set(false);
        hal::scheduler().schedule();

        let state = PREEMPT.get();
        state.nesting.set(0);
        if !state.need_resched.get() {
            break;
        }
    }
}

/// Disables preemption until dropped
#[must_use = "dropping the guard re-enables preemption immediately"]
pub struct PreemptGuard {
    _private: (),
}

impl PreemptGuard {
    pub fn new() -> Self {
        preempt_disable();
        Self { _private: () }
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        preempt_enable();
    }
}
