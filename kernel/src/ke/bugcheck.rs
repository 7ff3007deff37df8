//! Kernel Bug Check Implementation
//!
//! Every invariant violation in the IRQL substrate (unbalanced lowering, a
//! spinlock released twice, a mutex released by a stranger, a timer removed
//! from the wrong processor) ends here. A bug check:
//!
//! 1. Disables interrupts on the current processor (when a platform exists)
//! 2. Records the STOP code and parameters for the debugger
//! 3. Logs the STOP line through `log::error!`
//! 4. Panics, handing control to the kernel's panic handler, which halts
//!
//! Ending in a panic rather than a halt loop lets the hosted test platform
//! observe the stop with `#[should_panic]`.
//!
//! # Windows Equivalent
//! This implements NT's bugcheck.c functionality.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Bug check has been initiated
static BUGCHECK_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Number of bug checks raised since boot
static BUGCHECK_COUNT: AtomicU32 = AtomicU32::new(0);

/// Bug check data of the most recent stop, saved for debugging
static BUGCHECK_DATA: spin::Mutex<BugCheckData> = spin::Mutex::new(BugCheckData::new());

/// Bug check information structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BugCheckData {
    /// The bug check code
    pub code: u32,
    /// First parameter
    pub parameter1: u64,
    /// Second parameter
    pub parameter2: u64,
    /// Third parameter
    pub parameter3: u64,
    /// Fourth parameter
    pub parameter4: u64,
}

impl BugCheckData {
    const fn new() -> Self {
        Self {
            code: 0,
            parameter1: 0,
            parameter2: 0,
            parameter3: 0,
            parameter4: 0,
        }
    }
}

// ============================================================================
// Bug Check Codes (STOP Codes)
// ============================================================================

pub mod codes {
    //! Bug check codes raised by the IRQL substrate

    /// IRQL_NOT_GREATER_OR_EQUAL (0x09)
    /// IRQL too low for operation (lowering below zero)
    /// Parameter1: Level being lowered from
    /// Parameter2: Current dispatch depth
    pub const IRQL_NOT_GREATER_OR_EQUAL: u32 = 0x00000009;

    /// IRQL_NOT_LESS_OR_EQUAL (0x0A)
    /// Blocking call made above NORMAL
    /// Parameter1: Object address
    /// Parameter2: Current IRQL
    pub const IRQL_NOT_LESS_OR_EQUAL: u32 = 0x0000000A;

    /// SPIN_LOCK_NOT_OWNED (0x10)
    /// Attempt to release spinlock not owned
    /// Parameter1: Lock address
    pub const SPIN_LOCK_NOT_OWNED: u32 = 0x00000010;

    /// THREAD_NOT_MUTEX_OWNER (0x11)
    /// Task releasing mutex it doesn't own
    /// Parameter1: Mutex address
    /// Parameter2: Owner task id (0 if unowned)
    /// Parameter3: Caller task id
    pub const THREAD_NOT_MUTEX_OWNER: u32 = 0x00000011;

    /// TRAP_CAUSE_UNKNOWN (0x12)
    /// Interrupt entry reached with inconsistent state
    pub const TRAP_CAUSE_UNKNOWN: u32 = 0x00000012;

    /// MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED (0x3E)
    /// Processor index beyond the per-CPU storage
    /// Parameter1: Processor index
    pub const MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED: u32 = 0x0000003E;

    /// HAL_INITIALIZATION_FAILED (0x5C)
    /// Substrate used before the platform was installed
    pub const HAL_INITIALIZATION_FAILED: u32 = 0x0000005C;

    /// TIMER_OR_DPC_INVALID (0xC7)
    /// Timer manipulated from a processor that does not own it
    /// Parameter1: Timer address
    /// Parameter2: Owning processor
    /// Parameter3: Current processor
    pub const TIMER_OR_DPC_INVALID: u32 = 0x000000C7;

    /// IRQL_UNEXPECTED_VALUE (0xC8)
    /// Lowering cookie does not match the current nesting, or the
    /// lowering left the depth counters other than the raise found them
    /// Parameter1: Cookie depth
    /// Parameter2: Current depth, or current dispatch depth
    /// Parameter3: Cookie target level, or current high depth
    pub const IRQL_UNEXPECTED_VALUE: u32 = 0x000000C8;
}

/// Get the human-readable name for a bug check code
pub fn bugcheck_code_name(code: u32) -> &'static str {
    match code {
        codes::IRQL_NOT_GREATER_OR_EQUAL => "IRQL_NOT_GREATER_OR_EQUAL",
        codes::IRQL_NOT_LESS_OR_EQUAL => "IRQL_NOT_LESS_OR_EQUAL",
        codes::SPIN_LOCK_NOT_OWNED => "SPIN_LOCK_NOT_OWNED",
        codes::THREAD_NOT_MUTEX_OWNER => "THREAD_NOT_MUTEX_OWNER",
        codes::TRAP_CAUSE_UNKNOWN => "TRAP_CAUSE_UNKNOWN",
        codes::MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED => {
            "MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED"
        }
        codes::HAL_INITIALIZATION_FAILED => "HAL_INITIALIZATION_FAILED",
        codes::TIMER_OR_DPC_INVALID => "TIMER_OR_DPC_INVALID",
        codes::IRQL_UNEXPECTED_VALUE => "IRQL_UNEXPECTED_VALUE",
        _ => "UNKNOWN_BUGCHECK",
    }
}

// ============================================================================
// Bug Check Functions
// ============================================================================

/// Crash the system with a bug check code
pub fn ke_bugcheck(code: u32) -> ! {
    ke_bugcheck_ex(code, 0, 0, 0, 0)
}

/// Crash the system with a bug check code and parameters
///
/// # Arguments
/// * `code` - The bug check code identifying the error
/// * `p1` - First parameter (meaning depends on code)
/// * `p2` - Second parameter
/// * `p3` - Third parameter
/// * `p4` - Fourth parameter
///
/// # Never Returns
/// Ends in a panic; the kernel's panic handler halts the machine.
#[cold]
pub fn ke_bugcheck_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    if let Some(platform) = crate::hal::try_platform() {
        platform.arch.disable_interrupts();
    }

    let count = BUGCHECK_COUNT.fetch_add(1, Ordering::SeqCst);
    BUGCHECK_ACTIVE.store(true, Ordering::SeqCst);

    let data = BugCheckData {
        code,
        parameter1: p1,
        parameter2: p2,
        parameter3: p3,
        parameter4: p4,
    };

    // A recursive stop must not wait on the record of the first one
    if let Some(mut slot) = BUGCHECK_DATA.try_lock() {
        *slot = data;
    }

    log::error!(
        "*** STOP: 0x{:08X} (0x{:016X}, 0x{:016X}, 0x{:016X}, 0x{:016X}) {}{}",
        code,
        p1,
        p2,
        p3,
        p4,
        bugcheck_code_name(code),
        if count > 0 { " [recursive]" } else { "" }
    );

    panic!("*** STOP: 0x{:08X} {}", code, bugcheck_code_name(code))
}

/// Check if a bugcheck has been raised
pub fn is_bugcheck_active() -> bool {
    BUGCHECK_ACTIVE.load(Ordering::SeqCst)
}

/// Get the data of the most recent bugcheck (if any)
pub fn get_bugcheck_data() -> Option<BugCheckData> {
    if is_bugcheck_active() {
        BUGCHECK_DATA.try_lock().map(|data| *data)
    } else {
        None
    }
}

// ============================================================================
// Convenience Macros
// ============================================================================

/// Trigger a bugcheck, widening each parameter to u64
#[macro_export]
macro_rules! bugcheck {
    ($code:expr) => {
        $crate::ke::bugcheck::ke_bugcheck($code)
    };
    ($code:expr, $p1:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, 0, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, 0, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, 0)
    };
    ($code:expr, $p1:expr, $p2:expr, $p3:expr, $p4:expr) => {
        $crate::ke::bugcheck::ke_bugcheck_ex($code, $p1 as u64, $p2 as u64, $p3 as u64, $p4 as u64)
    };
}
