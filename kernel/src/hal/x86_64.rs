//! Bare-metal x86_64 platform backend
//!
//! - Interrupt flag through the `x86_64` crate (`cli`/`sti`/`pushfq`)
//! - Processor index from IA32_TSC_AUX, read back with `rdtscp`
//! - Monotonic clock from the invariant TSC, calibrated once at boot
//!
//! The kernel supplies the scheduler; this module only provides
//! [`Arch`] and [`Clock`].

use core::sync::atomic::{AtomicU64, Ordering};

use ::x86_64::instructions::interrupts;
use ::x86_64::registers::model_specific::Msr;

use super::{Arch, Clock};
use crate::ke::bugcheck::codes;
use crate::ke::percpu::MAX_CPUS;

/// IA32_TSC_AUX - value returned in ECX by rdtscp
pub const MSR_TSC_AUX: u32 = 0xC0000103;

/// Read the time-stamp counter and TSC_AUX atomically
#[inline]
pub fn rdtscp() -> (u64, u32) {
    let (tsc_low, tsc_high, aux): (u32, u32, u32);
    unsafe {
        core::arch::asm!(
            "rdtscp",
            out("eax") tsc_low,
            out("edx") tsc_high,
            out("ecx") aux,
            options(nomem, nostack, preserves_flags)
        );
    }
    (((tsc_high as u64) << 32) | (tsc_low as u64), aux)
}

/// x86_64 processor operations
pub struct X86_64Arch;

impl X86_64Arch {
    pub const fn new() -> Self {
        Self
    }

    /// Tag the calling processor with its index
    ///
    /// Must run on each processor before [`crate::ke::percpu::bring_up`].
    ///
    /// # Safety
    /// Writes an MSR; `cpu` must be unique among online processors.
    pub unsafe fn init_cpu_index(cpu: usize) {
        if cpu >= MAX_CPUS {
            crate::bugcheck!(codes::MULTIPROCESSOR_CONFIGURATION_NOT_SUPPORTED, cpu);
        }
        let mut msr = Msr::new(MSR_TSC_AUX);
        msr.write(cpu as u64);
    }
}

impl Arch for X86_64Arch {
    #[inline]
    fn current_cpu(&self) -> usize {
        rdtscp().1 as usize
    }

    #[inline]
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    #[inline]
    fn enable_interrupts(&self) {
        interrupts::enable();
    }
}

/// Invariant-TSC clock
///
/// Reads 0 until [`TscClock::calibrate`] has been called.
pub struct TscClock {
    base: AtomicU64,
    khz: AtomicU64,
}

impl TscClock {
    pub const fn new() -> Self {
        Self {
            base: AtomicU64::new(0),
            khz: AtomicU64::new(0),
        }
    }

    /// Set the TSC frequency (from CPUID leaf 0x15 or a PIT measurement)
    /// and make the current counter value time zero
    pub fn calibrate(&self, tsc_khz: u64) {
        self.base.store(rdtscp().0, Ordering::Relaxed);
        self.khz.store(tsc_khz, Ordering::Release);
    }
}

impl Clock for TscClock {
    fn ns_since_boot(&self) -> u64 {
        let khz = self.khz.load(Ordering::Acquire);
        if khz == 0 {
            return 0;
        }
        let ticks = rdtscp().0.saturating_sub(self.base.load(Ordering::Relaxed));
        ((ticks as u128 * 1_000_000) / khz as u128) as u64
    }
}
