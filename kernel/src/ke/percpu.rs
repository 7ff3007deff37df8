//! Per-Processor Storage and Bring-up
//!
//! [`CpuLocal<T>`] holds one `T` per processor, indexed by the processor
//! the caller runs on. Each slot is owned by its processor: it is only
//! touched by code running on that processor, at an IRQL that excludes
//! every other user of the same slot. That single-owner rule is what lets
//! the IRQL and preemption counters be plain `Cell`s.
//!
//! Processor bring-up runs an ordered constructor table over the slots of
//! the processor being started: IRQL state first, then preemption, the DPC
//! queue and the timer queue. Other subsystems may append constructors with
//! [`register_constructor`].
//!
//! # Usage
//! ```ignore
//! const INIT: MyState = MyState::new();
//! static STATE: CpuLocal<MyState> = CpuLocal::new([INIT; MAX_CPUS]);
//!
//! let mine = STATE.get();
//! ```

use crate::hal;
use crate::ke::bugcheck::codes;

/// Maximum number of processors supported
pub const MAX_CPUS: usize = 256;

/// Maximum number of constructors other subsystems may register
pub const MAX_EXTRA_CONSTRUCTORS: usize = 16;

/// One slot per processor
pub struct CpuLocal<T> {
    slots: [T; MAX_CPUS],
}

// Safety: a slot is only accessed from its own processor (see module docs)
unsafe impl<T> Sync for CpuLocal<T> {}

impl<T> CpuLocal<T> {
    pub const fn new(slots: [T; MAX_CPUS]) -> Self {
        Self { slots }
    }

    /// The calling processor's slot
    #[inline]
    pub fn get(&'static self) -> &'static T {
        let cpu = hal::current_cpu();
        if cpu >= MAX_CPUS {
            crate::bugcheck!(codes::MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED, cpu);
        }
        &self.slots[cpu]
    }

    /// Another processor's slot
    ///
    /// # Safety
    /// Only valid while `cpu` is not running code that uses the slot,
    /// i.e. during its bring-up.
    #[inline]
    pub unsafe fn get_on(&'static self, cpu: usize) -> &'static T {
        if cpu >= MAX_CPUS {
            crate::bugcheck!(codes::MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED, cpu);
        }
        &self.slots[cpu]
    }
}

// ============================================================================
// Constructor Table
// ============================================================================

/// Per-processor constructor, given the index of the processor being started
///
/// Runs before the processor is online; it must use `cpu` and never
/// [`hal::current_cpu`].
pub type CpuConstructor = fn(cpu: usize);

/// Built-in constructors, in dependency order
static CONSTRUCTORS: [(&str, CpuConstructor); 4] = [
    ("irql", super::irql::init_cpu),
    ("preempt", super::preempt::init_cpu),
    ("dpc", super::dpc::init_cpu),
    ("ktimer", super::timer::init_cpu),
];

struct ExtraConstructors {
    entries: [Option<(&'static str, CpuConstructor)>; MAX_EXTRA_CONSTRUCTORS],
    count: usize,
}

static EXTRA_CONSTRUCTORS: spin::Mutex<ExtraConstructors> = spin::Mutex::new(ExtraConstructors {
    entries: [None; MAX_EXTRA_CONSTRUCTORS],
    count: 0,
});

/// Append a constructor run after the built-in ones on every later bring-up
///
/// Returns false if the table is full.
pub fn register_constructor(name: &'static str, ctor: CpuConstructor) -> bool {
    let mut table = EXTRA_CONSTRUCTORS.lock();
    if table.count == MAX_EXTRA_CONSTRUCTORS {
        return false;
    }
    let index = table.count;
    table.entries[index] = Some((name, ctor));
    table.count += 1;
    true
}

/// Initialize every per-processor slot of `cpu`
///
/// Called once per processor before it takes its first interrupt.
pub fn bring_up(cpu: usize) {
    if cpu >= MAX_CPUS {
        crate::bugcheck!(codes::MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED, cpu);
    }

    for (name, ctor) in CONSTRUCTORS.iter() {
        ctor(cpu);
        log::debug!("ke: cpu {} {} ready", cpu, name);
    }

    // Snapshot so extra constructors may register further ones
    let extras = {
        let table = EXTRA_CONSTRUCTORS.lock();
        table.entries
    };
    for (name, ctor) in extras.iter().flatten() {
        ctor(cpu);
        log::debug!("ke: cpu {} {} ready", cpu, name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static SEEN: AtomicUsize = AtomicUsize::new(0);

    fn count_bring_up(_cpu: usize) {
        SEEN.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_registered_constructor_runs_on_bring_up() {
        hal::hosted::install();
        assert!(register_constructor("test-counter", count_bring_up));
        // A fresh thread claims a processor slot, which brings it up
        std::thread::spawn(|| {
            let _ = hal::current_cpu();
        })
        .join()
        .unwrap();
        assert!(SEEN.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_slots_are_per_processor() {
        use core::cell::Cell;
        const INIT: Cell<usize> = Cell::new(0);
        static SLOTS: CpuLocal<Cell<usize>> = CpuLocal::new([INIT; MAX_CPUS]);

        hal::hosted::install();
        SLOTS.get().set(7);
        let other = std::thread::spawn(|| SLOTS.get().get()).join().unwrap();
        assert_eq!(SLOTS.get().get(), 7);
        assert_eq!(other, 0);
    }

    #[test]
    #[should_panic(expected = "MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED")]
    fn test_bring_up_rejects_out_of_range_cpu() {
        hal::hosted::install();
        bring_up(MAX_CPUS);
    }
}
