//! Hosted platform backend
//!
//! Runs the substrate on top of std so it can be exercised by ordinary
//! tests:
//!
//! - Every std thread that touches per-processor state claims a free
//!   virtual processor slot, brings it up, and frees it when the thread
//!   exits. With all slots taken, new threads yield until one frees.
//! - The interrupt flag is a per-slot boolean. Interrupts are simulated by
//!   calling [`crate::ke::irql::dispatch_interrupt`] directly.
//! - Each thread is a task. Tickets, park/unpark and a pending-signal flag
//!   implement [`Scheduler`].
//! - The clock is `Instant` based, starting at install.
//!
//! # Usage
//! ```ignore
//! hal::hosted::install();
//! let mutex = KMutex::new();
//! mutex.lock();
//! ```

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use spin::Once;

use super::{Arch, Clock, Platform};
use crate::ke::percpu::{self, MAX_CPUS};
use crate::ke::scheduler::{Scheduler, TaskId, TaskState, Ticket};
use crate::ke::wait::Deadline;

// ============================================================================
// Virtual Processors
// ============================================================================

const FREE: AtomicBool = AtomicBool::new(false);
const ENABLED: AtomicBool = AtomicBool::new(true);

/// Slot claimed by a live thread
static SLOTS: [AtomicBool; MAX_CPUS] = [FREE; MAX_CPUS];

/// Interrupt flag of each slot
static INTERRUPTS: [AtomicBool; MAX_CPUS] = [ENABLED; MAX_CPUS];

struct CpuSlot {
    cpu: usize,
}

impl CpuSlot {
    fn claim() -> Self {
        loop {
            for (cpu, slot) in SLOTS.iter().enumerate() {
                if slot
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    INTERRUPTS[cpu].store(true, Ordering::Release);
                    percpu::bring_up(cpu);
                    return Self { cpu };
                }
            }
            thread::yield_now();
        }
    }
}

impl Drop for CpuSlot {
    fn drop(&mut self) {
        SLOTS[self.cpu].store(false, Ordering::Release);
    }
}

thread_local! {
    static CPU: CpuSlot = CpuSlot::claim();
}

/// Processor operations backed by the thread's slot
pub struct HostedArch;

impl Arch for HostedArch {
    fn current_cpu(&self) -> usize {
        CPU.with(|slot| slot.cpu)
    }

    fn interrupts_enabled(&self) -> bool {
        INTERRUPTS[self.current_cpu()].load(Ordering::Acquire)
    }

    fn disable_interrupts(&self) {
        INTERRUPTS[self.current_cpu()].store(false, Ordering::Release);
    }

    fn enable_interrupts(&self) {
        INTERRUPTS[self.current_cpu()].store(true, Ordering::Release);
    }

    fn spin_hint(&self) {
        // Host threads may be descheduled while holding a lock
        thread::yield_now();
    }
}

// ============================================================================
// Clock
// ============================================================================

pub struct HostedClock {
    start: Once<Instant>,
}

impl HostedClock {
    pub const fn new() -> Self {
        Self { start: Once::new() }
    }
}

impl Clock for HostedClock {
    fn ns_since_boot(&self) -> u64 {
        self.start.call_once(Instant::now).elapsed().as_nanos() as u64
    }
}

// ============================================================================
// Tasks
// ============================================================================

struct TaskRecord {
    id: TaskId,
    ticket: AtomicU64,
    signal: AtomicBool,
    schedules: AtomicU64,
    thread: Thread,
}

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

static TASKS: spin::Mutex<BTreeMap<u32, Arc<TaskRecord>>> = spin::Mutex::new(BTreeMap::new());

struct TaskHandle(Arc<TaskRecord>);

impl TaskHandle {
    fn register() -> Self {
        let raw = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let id = TaskId::from_raw(raw).unwrap_or_else(|| {
            crate::bugcheck!(crate::ke::bugcheck::codes::TRAP_CAUSE_UNKNOWN, raw)
        });
        let record = Arc::new(TaskRecord {
            id,
            ticket: AtomicU64::new(0),
            signal: AtomicBool::new(false),
            schedules: AtomicU64::new(0),
            thread: thread::current(),
        });
        TASKS.lock().insert(raw, record.clone());
        Self(record)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        TASKS.lock().remove(&self.0.id.as_u32());
    }
}

thread_local! {
    static TASK: TaskHandle = TaskHandle::register();
}

fn lookup(task: TaskId) -> Option<Arc<TaskRecord>> {
    TASKS.lock().get(&task.as_u32()).cloned()
}

/// Thread-per-task scheduler
pub struct HostedScheduler;

impl Scheduler for HostedScheduler {
    fn current_task(&self) -> TaskId {
        TASK.with(|task| task.0.id)
    }

    fn blocking_ticket(&self) -> Ticket {
        TASK.with(|task| task.0.ticket.fetch_add(1, Ordering::AcqRel) + 1)
    }

    fn wake(&self, task: TaskId, ticket: Ticket) -> bool {
        let Some(record) = lookup(task) else {
            return false;
        };
        if record
            .ticket
            .compare_exchange(ticket, ticket + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        record.thread.unpark();
        true
    }

    fn block(&self, deadline: Deadline, state: TaskState, ticket: Ticket) {
        TASK.with(|task| {
            let task = &task.0;
            loop {
                if task.ticket.load(Ordering::Acquire) != ticket {
                    return;
                }
                if state == TaskState::Interruptible && task.signal.load(Ordering::Acquire) {
                    return;
                }
                match deadline {
                    Deadline::Never => thread::park(),
                    Deadline::At(at) => {
                        let now = super::now_ns();
                        if now >= at {
                            return;
                        }
                        thread::park_timeout(Duration::from_nanos(at - now));
                    }
                }
            }
        })
    }

    fn schedule(&self) {
        TASK.with(|task| task.0.schedules.fetch_add(1, Ordering::Relaxed));
        thread::yield_now();
    }

    fn has_pending_signal(&self) -> bool {
        TASK.with(|task| task.0.signal.load(Ordering::Acquire))
    }
}

/// Post a signal to `task`, ending any interruptible block
///
/// Returns false if the task no longer exists.
pub fn send_signal(task: TaskId) -> bool {
    match lookup(task) {
        Some(record) => {
            record.signal.store(true, Ordering::Release);
            record.thread.unpark();
            true
        }
        None => false,
    }
}

/// Consume the calling task's pending signal
pub fn clear_signal() {
    TASK.with(|task| task.0.signal.store(false, Ordering::Release));
}

/// Number of voluntary reschedules made by the calling task
pub fn schedule_count() -> u64 {
    TASK.with(|task| task.0.schedules.load(Ordering::Relaxed))
}

// ============================================================================
// Installation
// ============================================================================

static ARCH: HostedArch = HostedArch;
static CLOCK: HostedClock = HostedClock::new();
static SCHEDULER: HostedScheduler = HostedScheduler;

/// Install the hosted platform (idempotent)
pub fn install() -> &'static Platform {
    let platform = super::install(Platform {
        arch: &ARCH,
        clock: &CLOCK,
        scheduler: &SCHEDULER,
    });
    // Start the clock
    platform.clock.ns_since_boot();
    platform
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal;

    #[test]
    fn test_threads_get_distinct_processors() {
        install();
        let mine = hal::current_cpu();
        let theirs = thread::spawn(hal::current_cpu).join().unwrap();
        assert_ne!(mine, theirs);
        assert!(mine < MAX_CPUS && theirs < MAX_CPUS);
    }

    #[test]
    fn test_interrupt_flag_is_per_processor() {
        install();
        let arch = hal::platform().arch;
        assert!(arch.interrupts_enabled());
        arch.disable_interrupts();
        let other = thread::spawn(|| hal::platform().arch.interrupts_enabled())
            .join()
            .unwrap();
        assert!(other);
        assert!(!arch.interrupts_enabled());
        arch.enable_interrupts();
    }

    #[test]
    fn test_stale_ticket_wake_is_rejected() {
        install();
        let sched = hal::scheduler();
        let me = sched.current_task();
        let old = sched.blocking_ticket();
        let new = sched.blocking_ticket();
        assert!(!sched.wake(me, old));
        assert!(sched.wake(me, new));
        // Already consumed: block returns immediately
        sched.block(Deadline::Never, TaskState::Uninterruptible, new);
    }

    #[test]
    fn test_block_times_out() {
        install();
        let sched = hal::scheduler();
        let ticket = sched.blocking_ticket();
        let start = hal::now_ns();
        sched.block(Deadline::after(20_000_000), TaskState::Uninterruptible, ticket);
        assert!(hal::now_ns() - start >= 20_000_000);
    }

    #[test]
    fn test_signal_ends_interruptible_block() {
        install();
        let sched = hal::scheduler();
        let me = sched.current_task();
        let ticket = sched.blocking_ticket();
        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            send_signal(me)
        });
        sched.block(Deadline::Never, TaskState::Interruptible, ticket);
        assert!(sched.has_pending_signal());
        assert!(poster.join().unwrap());
        clear_signal();
        assert!(!sched.has_pending_signal());
    }
}
