//! Kernel Timer Implementation (KTIMER)
//!
//! Each processor owns a queue of timers ordered by absolute expiry. The
//! queue caches its earliest deadline so the periodic timer interrupt does
//! O(1) work: compare the clock with the cache and, if due, queue the
//! queue's DPC. The DPC then fires every expired timer, earliest first, at
//! Dispatch.
//!
//! A timer is queued on the processor that enqueued it and may only be
//! removed from that processor. Callbacks run at Dispatch and may re-arm
//! their timer.
//!
//! The queue is a sorted intrusive list, so enqueue is O(n) in the number
//! of timers queued on the processor. Fine for the handful of timers a
//! processor carries; a wheel or heap would be needed for thousands.
//!
//! # Usage
//! ```ignore
//! fn watchdog(timer: &KTimer, _arg: usize) { /* at Dispatch */ }
//! static WATCHDOG: KTimer = KTimer::new(watchdog, 0);
//!
//! WATCHDOG.enqueue_after(500_000_000); // 500ms
//! WATCHDOG.remove();
//!
//! // From the periodic timer interrupt:
//! timer::handle_timer_interrupt();
//! ```
//!
//! # NT Compatibility
//! Equivalent to NT's KTIMER / KeSetTimer / KeCancelTimer

use core::cell::{Cell, UnsafeCell};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::bugcheck::codes;
use super::dpc::KDpc;
use super::irql;
use super::list::{ListEntry, ListHead};
use super::percpu::{CpuLocal, MAX_CPUS};
use crate::containing_record;
use crate::hal;

/// Cached deadline of an empty queue
pub const EXPIRE_NEVER: u64 = u64::MAX;

/// Timer callback, run at Dispatch on the owning processor
pub type TimerCallback = fn(timer: &KTimer, arg: usize);

/// Kernel Timer object
///
/// Equivalent to NT's KTIMER
#[repr(C)]
pub struct KTimer {
    /// Entry in the owning processor's timer queue
    entry: UnsafeCell<ListEntry>,
    /// Absolute expiration time (ns since boot)
    expiry: Cell<u64>,
    callback: TimerCallback,
    arg: usize,
    /// True iff the timer is in a queue
    on_queue: AtomicBool,
    /// Processor whose queue holds the timer
    cpu: AtomicUsize,
}

// Safety: link and expiry are only touched by the owning processor at
// Dispatch, and `on_queue` arbitrates ownership
unsafe impl Sync for KTimer {}
unsafe impl Send for KTimer {}

impl KTimer {
    pub const fn new(callback: TimerCallback, arg: usize) -> Self {
        Self {
            entry: UnsafeCell::new(ListEntry::new()),
            expiry: Cell::new(EXPIRE_NEVER),
            callback,
            arg,
            on_queue: AtomicBool::new(false),
            cpu: AtomicUsize::new(0),
        }
    }

    /// Queue the timer on the calling processor to fire at `at_ns`
    ///
    /// Returns false (leaving the existing deadline) if it is already
    /// queued. Timers with equal expiry fire in enqueue order.
    ///
    /// Equivalent to KeSetTimer
    pub fn enqueue(&'static self, at_ns: u64) -> bool {
        let _dpc = irql::disable_dpc();

        if self.on_queue.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.cpu.store(hal::current_cpu(), Ordering::Relaxed);
        self.expiry.set(at_ns);

        let queue = TIMER_QUEUE.get();
        // SAFETY: at Dispatch on the owning processor
        unsafe {
            let list = &mut *queue.list.get();
            let mut later = core::ptr::null_mut();
            for entry in list.iter() {
                let timer = &*containing_record!(entry, KTimer, entry);
                if timer.expiry.get() > at_ns {
                    later = entry;
                    break;
                }
            }
            if later.is_null() {
                list.insert_tail(self.entry.get());
            } else {
                list.insert_before(later, self.entry.get());
            }
        }

        hal::without_interrupts(|| {
            if at_ns < queue.next_expiry.get() {
                queue.next_expiry.set(at_ns);
            }
        });
        true
    }

    /// Queue the timer to fire `delta_ns` from now
    pub fn enqueue_after(&'static self, delta_ns: u64) -> bool {
        self.enqueue(hal::now_ns().saturating_add(delta_ns))
    }

    /// Take the timer off its queue
    ///
    /// Returns false if it was not queued. Removing a timer queued by
    /// another processor is a bug check (TIMER_OR_DPC_INVALID).
    ///
    /// Equivalent to KeCancelTimer
    pub fn remove(&'static self) -> bool {
        let _dpc = irql::disable_dpc();

        if !self.on_queue.load(Ordering::Acquire) {
            return false;
        }

        let owner = self.cpu.load(Ordering::Relaxed);
        let cpu = hal::current_cpu();
        if owner != cpu {
            crate::bugcheck!(
                codes::TIMER_OR_DPC_INVALID,
                self as *const KTimer as usize,
                owner,
                cpu
            );
        }

        let queue = TIMER_QUEUE.get();
        // SAFETY: at Dispatch on the owning processor; the timer is linked
        unsafe {
            (*queue.list.get()).remove_entry(self.entry.get());
        }
        self.on_queue.store(false, Ordering::Release);
        queue.recompute_next_expiry();
        true
    }

    #[inline]
    pub fn is_queued(&self) -> bool {
        self.on_queue.load(Ordering::Acquire)
    }

    /// Absolute expiry of the last enqueue (ns since boot)
    #[inline]
    pub fn expiry(&self) -> u64 {
        self.expiry.get()
    }
}

/// Per-processor timer queue
pub struct KTimerQueue {
    list: UnsafeCell<ListHead>,
    /// Earliest expiry in `list`, written with interrupts disabled
    next_expiry: Cell<u64>,
    dpc: KDpc,
}

impl KTimerQueue {
    const fn new() -> Self {
        Self {
            list: UnsafeCell::new(ListHead::new()),
            next_expiry: Cell::new(EXPIRE_NEVER),
            dpc: KDpc::new(expire_timers, 0, 0),
        }
    }

    /// Reset the cache to the head of the queue
    ///
    /// Called at Dispatch on the owning processor.
    fn recompute_next_expiry(&self) {
        // SAFETY: at Dispatch on the owning processor
        let first = unsafe { (*self.list.get()).first() };
        let next = if first.is_null() {
            EXPIRE_NEVER
        } else {
            // SAFETY: only KTimer entries are linked into a timer queue
            unsafe { (*containing_record!(first, KTimer, entry)).expiry.get() }
        };
        hal::without_interrupts(|| self.next_expiry.set(next));
    }
}

const INIT: KTimerQueue = KTimerQueue::new();
static TIMER_QUEUE: CpuLocal<KTimerQueue> = CpuLocal::new([INIT; MAX_CPUS]);

pub(crate) fn init_cpu(cpu: usize) {
    // SAFETY: called from bring-up, before `cpu` queues any timer
    let queue = unsafe { TIMER_QUEUE.get_on(cpu) };
    unsafe {
        (*queue.list.get()).init();
    }
    queue.next_expiry.set(EXPIRE_NEVER);
}

/// Earliest deadline queued on the calling processor
pub fn next_expiry() -> u64 {
    let queue = TIMER_QUEUE.get();
    hal::without_interrupts(|| queue.next_expiry.get())
}

/// Timer interrupt hook; O(1)
///
/// Queues the expiry DPC if the earliest deadline has passed. Called at
/// High from the periodic timer interrupt.
pub fn handle_timer_interrupt() {
    let queue: &'static KTimerQueue = TIMER_QUEUE.get();
    if hal::now_ns() >= queue.next_expiry.get() {
        queue.dpc.enqueue();
    }
}

/// Fire every expired timer on the calling processor, earliest first
fn expire_timers(_dpc: &KDpc, _: usize, _: usize) {
    let queue = TIMER_QUEUE.get();
    let mut now = hal::now_ns();
    let mut fired = 0usize;

    loop {
        // SAFETY: at Dispatch on the owning processor
        let timer: &KTimer = unsafe {
            let list = &mut *queue.list.get();
            let first = list.first();
            if first.is_null() {
                break;
            }
            let timer = &*containing_record!(first, KTimer, entry);
            if timer.expiry.get() > now {
                // Earlier callbacks may have run long enough for it to fall due
                now = hal::now_ns();
                if timer.expiry.get() > now {
                    break;
                }
            }
            list.remove_entry(first);
            timer
        };
        timer.on_queue.store(false, Ordering::Release);
        fired += 1;
        (timer.callback)(timer, timer.arg);
    }

    queue.recompute_next_expiry();
    log::trace!("ktimer: fired {} timer(s) at {}ns", fired, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    const MS: u64 = 1_000_000;

    fn timer_tick(_vector: u8) {
        handle_timer_interrupt();
    }

    /// Simulate the periodic timer interrupt until `done` or 5s pass
    fn tick_until(done: impl Fn() -> bool) {
        let start = Instant::now();
        while !done() && start.elapsed() < Duration::from_secs(5) {
            irql::dispatch_interrupt(0x20, timer_tick);
            thread::sleep(Duration::from_millis(2));
        }
    }

    static FIRED: spin::Mutex<Vec<usize>> = spin::Mutex::new(Vec::new());

    fn record_fire(timer: &KTimer, tag: usize) {
        assert_eq!(irql::current_level(), irql::Irql::Dispatch);
        assert!(!timer.is_queued());
        FIRED.lock().push(tag);
    }

    static T100: KTimer = KTimer::new(record_fire, 100);
    static T50: KTimer = KTimer::new(record_fire, 50);
    static T150: KTimer = KTimer::new(record_fire, 150);

    #[test]
    fn test_timers_fire_in_expiry_order() {
        hal::hosted::install();
        let now = hal::now_ns();
        assert!(T100.enqueue(now + 100 * MS));
        assert!(T50.enqueue(now + 50 * MS));
        assert!(T150.enqueue(now + 150 * MS));
        assert!(!T50.enqueue(now));
        assert_eq!(next_expiry(), now + 50 * MS);

        tick_until(|| FIRED.lock().len() == 3);

        assert_eq!(*FIRED.lock(), [50, 100, 150]);
        assert!(hal::now_ns() >= now + 150 * MS);
        assert_eq!(next_expiry(), EXPIRE_NEVER);
    }

    fn ignore(_timer: &KTimer, _arg: usize) {}

    static NEAR: KTimer = KTimer::new(ignore, 0);
    static FAR: KTimer = KTimer::new(ignore, 0);

    #[test]
    fn test_remove_recomputes_cached_deadline() {
        hal::hosted::install();
        let now = hal::now_ns();
        assert!(FAR.enqueue(now + 20_000 * MS));
        assert!(NEAR.enqueue(now + 10_000 * MS));
        assert_eq!(next_expiry(), now + 10_000 * MS);

        assert!(NEAR.remove());
        assert!(!NEAR.remove());
        assert_eq!(next_expiry(), now + 20_000 * MS);

        assert!(FAR.remove());
        assert_eq!(next_expiry(), EXPIRE_NEVER);
    }

    static FOREIGN: KTimer = KTimer::new(ignore, 0);

    #[test]
    fn test_remove_from_other_processor_bugchecks() {
        hal::hosted::install();
        assert!(FOREIGN.enqueue_after(60_000 * MS));
        let result = thread::spawn(|| FOREIGN.remove()).join();
        assert!(result.is_err());
        assert!(FOREIGN.is_queued());
        assert!(FOREIGN.remove());
    }

    fn hold_until_slow_due(_timer: &KTimer, _arg: usize) {
        while hal::now_ns() < SLOW_SECOND.expiry() {
            core::hint::spin_loop();
        }
    }

    static SLOW_FIRST: KTimer = KTimer::new(hold_until_slow_due, 0);
    static SLOW_SECOND: KTimer = KTimer::new(ignore, 0);

    #[test]
    fn test_timer_due_during_expiry_fires_same_pass() {
        hal::hosted::install();
        let now = hal::now_ns();
        assert!(SLOW_FIRST.enqueue(now));
        assert!(SLOW_SECOND.enqueue(now + 30 * MS));

        // Run one expiry pass directly, without the periodic interrupt
        let cookie = irql::raise(irql::Irql::Dispatch);
        expire_timers(&TIMER_QUEUE.get().dpc, 0, 0);
        irql::lower(cookie);

        assert!(!SLOW_FIRST.is_queued());
        assert!(!SLOW_SECOND.is_queued());
        assert_eq!(next_expiry(), EXPIRE_NEVER);
    }

    static PERIODIC_COUNT: spin::Mutex<usize> = spin::Mutex::new(0);

    fn rearm(timer: &KTimer, _arg: usize) {
        let mut count = PERIODIC_COUNT.lock();
        *count += 1;
        if *count < 3 {
            assert!(PERIODIC.enqueue(timer.expiry() + 10 * MS));
        }
    }

    static PERIODIC: KTimer = KTimer::new(rearm, 0);

    #[test]
    fn test_callback_may_rearm() {
        hal::hosted::install();
        assert!(PERIODIC.enqueue_after(10 * MS));
        tick_until(|| *PERIODIC_COUNT.lock() == 3);
        assert_eq!(*PERIODIC_COUNT.lock(), 3);
        assert!(!PERIODIC.is_queued());
    }
}
