//! Deferred Procedure Call (DPC) Implementation
//!
//! DPCs let code running at High (interrupt handlers) defer work to
//! Dispatch. Each processor owns a FIFO of queued DPCs; the queue is only
//! touched at High on its own processor, so interrupt handlers may enqueue
//! freely. The queue drains whenever the processor lowers to Normal (see
//! [`super::irql::lower`]).
//!
//! A DPC object sits in at most one queue. Enqueueing an already-queued DPC
//! is a no-op that returns false; its routine runs once.
//!
//! # Usage
//! ```ignore
//! fn on_packet(_dpc: &KDpc, nic: usize, _: usize) { /* at Dispatch */ }
//! static RX_DPC: KDpc = KDpc::new(on_packet, NIC0, 0);
//!
//! // From the interrupt handler:
//! RX_DPC.enqueue();
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KDPC / KeInitializeDpc / KeInsertQueueDpc

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use super::irql::{self, Irql};
use super::list::{ListEntry, ListHead};
use super::percpu::{CpuLocal, MAX_CPUS};
use crate::containing_record;

/// DPC routine function signature
///
/// # Arguments
/// * `dpc` - The DPC object being run
/// * `arg1` - First argument given at construction
/// * `arg2` - Second argument given at construction
pub type DpcRoutine = fn(dpc: &KDpc, arg1: usize, arg2: usize);

/// Kernel Deferred Procedure Call object
///
/// Equivalent to NT's KDPC structure
#[repr(C)]
pub struct KDpc {
    /// Entry for linking into DPC queue
    entry: UnsafeCell<ListEntry>,
    routine: DpcRoutine,
    arg1: usize,
    arg2: usize,
    /// True iff the DPC is on a processor's queue
    inserted: AtomicBool,
}

// Safety: the link is only touched by the queueing processor at High,
// and `inserted` arbitrates which processor that is
unsafe impl Sync for KDpc {}
unsafe impl Send for KDpc {}

impl KDpc {
    pub const fn new(routine: DpcRoutine, arg1: usize, arg2: usize) -> Self {
        Self {
            entry: UnsafeCell::new(ListEntry::new()),
            routine,
            arg1,
            arg2,
            inserted: AtomicBool::new(false),
        }
    }

    /// Queue the DPC on the calling processor
    ///
    /// Returns false if it was already queued (anywhere). Callable at any
    /// IRQL. At Normal the DPC runs before this returns.
    ///
    /// Equivalent to KeInsertQueueDpc
    pub fn enqueue(&'static self) -> bool {
        let cookie = irql::raise(Irql::High);

        if self.inserted.swap(true, Ordering::AcqRel) {
            irql::lower(cookie);
            return false;
        }

        let queue = DPC_QUEUE.get();
        // SAFETY: at High on the owning processor; the DPC is unlinked
        unsafe {
            (*queue.list.get()).insert_tail(self.entry.get());
        }
        irql::set_pending_dispatch();

        irql::lower(cookie);
        true
    }

    /// Whether the DPC is queued and has not started running
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.inserted.load(Ordering::Acquire)
    }
}

/// Per-processor DPC queue
struct DpcQueue {
    list: UnsafeCell<ListHead>,
}

impl DpcQueue {
    const fn new() -> Self {
        Self {
            list: UnsafeCell::new(ListHead::new()),
        }
    }
}

const INIT: DpcQueue = DpcQueue::new();
static DPC_QUEUE: CpuLocal<DpcQueue> = CpuLocal::new([INIT; MAX_CPUS]);

pub(crate) fn init_cpu(cpu: usize) {
    // SAFETY: called from bring-up, before `cpu` queues anything
    unsafe {
        (*DPC_QUEUE.get_on(cpu).list.get()).init();
    }
}

/// Run every DPC queued on the calling processor, in FIFO order
///
/// Called at Dispatch by the IRQL code. Each entry is unlinked at High and
/// its routine is invoked back at Dispatch, so a routine may re-enqueue
/// itself; it then runs again in the same drain.
pub(crate) fn dispatch_pending() {
    let queue = DPC_QUEUE.get();
    loop {
        let cookie = irql::raise(Irql::High);
        // SAFETY: at High on the owning processor
        let entry = unsafe { (*queue.list.get()).remove_head() };
        if entry.is_null() {
            irql::lower(cookie);
            return;
        }

        // SAFETY: only KDpc entries are linked into the DPC queue, and
        // queued DPCs are 'static
        let dpc: &'static KDpc = unsafe { &*containing_record!(entry, KDpc, entry) };
        dpc.inserted.store(false, Ordering::Release);
        irql::lower(cookie);

        (dpc.routine)(dpc, dpc.arg1, dpc.arg2);
    }
}
