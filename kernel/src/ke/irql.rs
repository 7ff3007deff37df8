//! Interrupt Request Level (IRQL) State Machine
//!
//! Three levels are tracked per processor:
//!
//! - **Normal** (PASSIVE_LEVEL): tasks run, may block and be preempted
//! - **Dispatch** (DISPATCH_LEVEL): no preemption, DPCs deferred
//! - **High** (HIGH_LEVEL): interrupt handlers; further interrupt work deferred
//!
//! The level is derived from two nesting counters, `dispatch_depth` and
//! `high_depth`. Raising to High bumps both, so every High section is also a
//! Dispatch section. A raise only bumps the counters of its target, so
//! raising to Dispatch while at High is legal nesting: the level stays High
//! and the Dispatch section outlives the High one if lowered in that order.
//! Raise and lower are strictly LIFO: every raise returns an [`IrqlCookie`]
//! recording the nesting depth it created, and lowering with a cookie that
//! does not match the innermost raise is a bug check.
//!
//! Lowering is where deferred work runs:
//!
//! - when `high_depth` reaches zero, an interrupt that arrived at High is
//!   replayed, then hardware interrupts are re-enabled
//! - when `dispatch_depth` reaches zero, pending DPCs are drained at
//!   Dispatch, repeatedly until none remain, then a pending reschedule is
//!   honored
//!
//! Pending flags are only read and cleared with hardware interrupts
//! disabled, so an interrupt cannot set one between the check and the
//! clear.
//!
//! # Usage
//! ```ignore
//! let cookie = irql::raise(Irql::Dispatch);
//! // ... no preemption, DPCs deferred ...
//! irql::lower(cookie);
//!
//! // Or scoped:
//! let _guard = irql::disable_dpc();
//! ```

use core::cell::Cell;
use core::marker::PhantomData;

use super::bugcheck::codes;
use super::percpu::{CpuLocal, MAX_CPUS};
use super::{dpc, preempt};
use crate::hal;

/// Interrupt request level
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Irql {
    /// Task context (PASSIVE_LEVEL)
    Normal = 0,
    /// DPC and scheduler level (DISPATCH_LEVEL)
    Dispatch = 2,
    /// Interrupt level (HIGH_LEVEL)
    High = 31,
}

impl Irql {
    /// NT numeric value of the level
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Interrupt-entry routine, run at High
pub type InterruptHandler = fn(vector: u8);

/// Per-processor IRQL state
///
/// Only touched by its own processor (see [`CpuLocal`]).
pub(crate) struct IrqlState {
    dispatch_depth: Cell<u32>,
    high_depth: Cell<u32>,
    /// Number of outstanding cookies
    nesting: Cell<u32>,
    pending_dispatch: Cell<bool>,
    pending_high: Cell<bool>,
    deferred: Cell<Option<(u8, InterruptHandler)>>,
}

impl IrqlState {
    const fn new() -> Self {
        Self {
            dispatch_depth: Cell::new(0),
            high_depth: Cell::new(0),
            nesting: Cell::new(0),
            pending_dispatch: Cell::new(false),
            pending_high: Cell::new(false),
            deferred: Cell::new(None),
        }
    }

    #[inline]
    fn level(&self) -> Irql {
        if self.high_depth.get() > 0 {
            Irql::High
        } else if self.dispatch_depth.get() > 0 {
            Irql::Dispatch
        } else {
            Irql::Normal
        }
    }
}

const INIT: IrqlState = IrqlState::new();
static IRQL: CpuLocal<IrqlState> = CpuLocal::new([INIT; MAX_CPUS]);

/// Reset the IRQL state of a processor being brought up
pub(crate) fn init_cpu(cpu: usize) {
    // SAFETY: called from bring-up, before `cpu` runs any IRQL code
    let state = unsafe { IRQL.get_on(cpu) };
    state.dispatch_depth.set(0);
    state.high_depth.set(0);
    state.nesting.set(0);
    state.pending_dispatch.set(false);
    state.pending_high.set(false);
    state.deferred.set(None);
}

/// Proof of a raise, consumed by [`lower`]
///
/// Neither `Send` nor `Clone`: it belongs to the processor and the nesting
/// level that produced it.
#[must_use = "an IRQL raise must be lowered with its cookie"]
#[derive(Debug)]
pub struct IrqlCookie {
    previous: Irql,
    target: Irql,
    depth: u32,
    /// `(dispatch_depth, high_depth)` before the raise
    counters: (u32, u32),
    _not_send: PhantomData<*const ()>,
}

impl IrqlCookie {
    /// Level in effect before the raise
    #[inline]
    pub fn previous(&self) -> Irql {
        self.previous
    }

    /// Level the raise asked for
    #[inline]
    pub fn target(&self) -> Irql {
        self.target
    }
}

/// Current IRQL of the calling processor
#[inline]
pub fn current_level() -> Irql {
    IRQL.get().level()
}

/// Raise the calling processor through `target`
///
/// Bumps the counters covering `target` and nothing else. At a level
/// already above `target` the current level is kept; the raise still
/// nests and must be lowered in order.
///
/// Equivalent to KeRaiseIrql()
pub fn raise(target: Irql) -> IrqlCookie {
    let state = IRQL.get();
    let previous = state.level();
    let counters = (state.dispatch_depth.get(), state.high_depth.get());

    match target {
        Irql::Normal => {}
        Irql::Dispatch => {
            state.dispatch_depth.set(state.dispatch_depth.get() + 1);
        }
        Irql::High => {
            state.dispatch_depth.set(state.dispatch_depth.get() + 1);
            state.high_depth.set(state.high_depth.get() + 1);
        }
    }

    let depth = state.nesting.get() + 1;
    state.nesting.set(depth);

    IrqlCookie {
        previous,
        target,
        depth,
        counters,
        _not_send: PhantomData,
    }
}

/// Undo the raise that produced `cookie`, running any deferred work
///
/// Equivalent to KeLowerIrql()
pub fn lower(cookie: IrqlCookie) {
    let state = IRQL.get();

    let nesting = state.nesting.get();
    if cookie.depth != nesting {
        crate::bugcheck!(
            codes::IRQL_UNEXPECTED_VALUE,
            cookie.depth,
            nesting,
            cookie.target.as_u8()
        );
    }
    state.nesting.set(nesting - 1);

    match cookie.target {
        Irql::Normal => return,
        Irql::Dispatch => {
            decrement(&state.dispatch_depth, cookie.target);
        }
        Irql::High => {
            decrement(&state.high_depth, cookie.target);
            decrement(&state.dispatch_depth, cookie.target);
            if state.high_depth.get() == 0 {
                replay_deferred_interrupt(state);
            }
        }
    }

    let counters = (state.dispatch_depth.get(), state.high_depth.get());
    if counters != cookie.counters {
        crate::bugcheck!(
            codes::IRQL_UNEXPECTED_VALUE,
            cookie.depth,
            counters.0,
            counters.1
        );
    }

    if cookie.previous == Irql::Normal {
        drain_dispatch(state);
        preempt::check_pending_reschedule();
    }
}

#[inline]
fn decrement(counter: &Cell<u32>, target: Irql) {
    match counter.get().checked_sub(1) {
        Some(value) => counter.set(value),
        None => crate::bugcheck!(codes::IRQL_NOT_GREATER_OR_EQUAL, target.as_u8(), 0u32),
    }
}

/// Run pending DPCs at Dispatch until none remain
///
/// Called with dispatch_depth == 0.
fn drain_dispatch(state: &IrqlState) {
    loop {
        let was_enabled = hal::save_and_disable_interrupts();
        if !state.pending_dispatch.get() {
            hal::restore_interrupts(was_enabled);
            return;
        }
        state.pending_dispatch.set(false);
        state.dispatch_depth.set(1);
        hal::restore_interrupts(was_enabled);

        dpc::dispatch_pending();

        let was_enabled = hal::save_and_disable_interrupts();
        state.dispatch_depth.set(0);
        hal::restore_interrupts(was_enabled);
    }
}

/// Replay an interrupt that arrived while at High
///
/// Called with high_depth == 0 and interrupts disabled by the deferral.
fn replay_deferred_interrupt(state: &IrqlState) {
    if !state.pending_high.get() {
        return;
    }
    while let Some((vector, handler)) = state.deferred.take() {
        state.pending_high.set(false);
        state.dispatch_depth.set(state.dispatch_depth.get() + 1);
        state.high_depth.set(1);
        handler(vector);
        state.high_depth.set(0);
        state.dispatch_depth.set(state.dispatch_depth.get() - 1);
    }
    hal::platform().arch.enable_interrupts();
}

/// Mark DPC work pending on the calling processor
///
/// The work runs the next time the processor lowers to Normal.
#[inline]
pub fn set_pending_dispatch() {
    let state = IRQL.get();
    hal::without_interrupts(|| state.pending_dispatch.set(true));
}

/// Interrupt entry
///
/// If the processor is logically at High, the interrupt is recorded, hardware
/// interrupts stay disabled, and `handler` is replayed when High is left.
/// Otherwise `handler` runs at High immediately and the lower that follows
/// drains any DPCs it queued.
pub fn dispatch_interrupt(vector: u8, handler: InterruptHandler) {
    let state = IRQL.get();
    if state.high_depth.get() > 0 {
        if state.pending_high.get() {
            // Only one interrupt can be outstanding with interrupts disabled
            crate::bugcheck!(codes::TRAP_CAUSE_UNKNOWN, vector);
        }
        state.pending_high.set(true);
        state.deferred.set(Some((vector, handler)));
        hal::platform().arch.disable_interrupts();
        return;
    }

    let cookie = raise(Irql::High);
    handler(vector);
    lower(cookie);
}

// ============================================================================
// Scoped Guards
// ============================================================================

/// Lowers on drop, then restores the interrupt flag if it saved one
#[must_use = "dropping the guard lowers IRQL immediately"]
pub struct IrqlGuard {
    cookie: Option<IrqlCookie>,
    restore_interrupts: bool,
}

impl IrqlGuard {
    /// Level in effect before the guard was taken
    pub fn previous(&self) -> Irql {
        match &self.cookie {
            Some(cookie) => cookie.previous,
            None => Irql::Normal,
        }
    }
}

impl Drop for IrqlGuard {
    fn drop(&mut self) {
        hal::restore_interrupts(self.restore_interrupts);
        if let Some(cookie) = self.cookie.take() {
            lower(cookie);
        }
    }
}

/// Raise to `target` until the guard drops
pub fn raise_scoped(target: Irql) -> IrqlGuard {
    IrqlGuard {
        cookie: Some(raise(target)),
        restore_interrupts: false,
    }
}

/// Raise to Dispatch until the guard drops
#[inline]
pub fn disable_dpc() -> IrqlGuard {
    raise_scoped(Irql::Dispatch)
}

/// Disable hardware interrupts and raise to High until the guard drops
pub fn disable_irq() -> IrqlGuard {
    let was_enabled = hal::save_and_disable_interrupts();
    IrqlGuard {
        cookie: Some(raise(Irql::High)),
        restore_interrupts: was_enabled,
    }
}
