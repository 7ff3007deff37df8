//! Hardware Abstraction Layer (hal)
//!
//! The substrate never touches hardware or the scheduler directly. It
//! consumes three collaborators, installed once at boot:
//!
//! - **Arch**: processor index, interrupt flag, spin-wait hint
//! - **Clock**: monotonic nanoseconds since boot
//! - **Scheduler**: ticketed block/wake (see [`crate::ke::scheduler`])
//!
//! # Backends
//!
//! - [`x86_64`]: bare-metal, `cli`/`sti` and `rdtscp`/TSC_AUX
//! - [`hosted`]: std threads as virtual processors (tests and the `hosted` feature)
//!
//! # Usage
//!
//! ```ignore
//! hal::install(Platform {
//!     arch: &X86_64_ARCH,
//!     clock: &TSC_CLOCK,
//!     scheduler: &KERNEL_SCHEDULER,
//! });
//! ke::percpu::bring_up(0);
//! ```

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(any(test, feature = "hosted"))]
pub mod hosted;

use spin::Once;

use crate::ke::bugcheck::{codes, ke_bugcheck};
use crate::ke::scheduler::Scheduler;

/// Processor-level operations the substrate needs
///
/// All methods act on the calling processor.
pub trait Arch: Sync {
    /// Index of the calling processor, dense from 0
    fn current_cpu(&self) -> usize;

    /// Whether hardware interrupts are currently enabled
    fn interrupts_enabled(&self) -> bool;

    /// Disable hardware interrupts (cli)
    fn disable_interrupts(&self);

    /// Enable hardware interrupts (sti)
    fn enable_interrupts(&self);

    /// Hint issued inside spin-wait loops
    #[inline]
    fn spin_hint(&self) {
        core::hint::spin_loop();
    }
}

/// Monotonic time source
pub trait Clock: Sync {
    /// Nanoseconds since boot; never decreases
    fn ns_since_boot(&self) -> u64;
}

/// The collaborators installed at boot
#[derive(Clone, Copy)]
pub struct Platform {
    pub arch: &'static dyn Arch,
    pub clock: &'static dyn Clock,
    pub scheduler: &'static dyn Scheduler,
}

static PLATFORM: Once<Platform> = Once::new();

/// Install the platform collaborators
///
/// Only the first call takes effect; later calls return the platform that
/// is already installed.
pub fn install(platform: Platform) -> &'static Platform {
    PLATFORM.call_once(|| {
        log::debug!("hal: platform installed");
        platform
    })
}

/// The installed platform, if any
#[inline]
pub fn try_platform() -> Option<&'static Platform> {
    PLATFORM.get()
}

/// The installed platform
///
/// Bug checks with HAL_INITIALIZATION_FAILED if nothing was installed.
#[inline]
pub fn platform() -> &'static Platform {
    match PLATFORM.get() {
        Some(platform) => platform,
        None => ke_bugcheck(codes::HAL_INITIALIZATION_FAILED),
    }
}

#[inline]
pub fn current_cpu() -> usize {
    platform().arch.current_cpu()
}

#[inline]
pub fn spin_hint() {
    platform().arch.spin_hint();
}

/// Monotonic nanoseconds since boot
#[inline]
pub fn now_ns() -> u64 {
    platform().clock.ns_since_boot()
}

#[inline]
pub fn scheduler() -> &'static dyn Scheduler {
    platform().scheduler
}

/// Disable interrupts, returning whether they were enabled
#[inline]
pub fn save_and_disable_interrupts() -> bool {
    let arch = platform().arch;
    let enabled = arch.interrupts_enabled();
    if enabled {
        arch.disable_interrupts();
    }
    enabled
}

/// Re-enable interrupts if `was_enabled`
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        platform().arch.enable_interrupts();
    }
}

/// Execute a closure with interrupts disabled
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = save_and_disable_interrupts();
    let result = f();
    restore_interrupts(was_enabled);
    result
}
