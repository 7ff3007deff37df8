//! Nostalgia OS Kernel: IRQL concurrency substrate
//!
//! The execution-level and synchronization core every other kernel
//! subsystem builds on, following the NT model.
//!
//! # Architecture Overview
//!
//! - **ke::irql** - NORMAL / DISPATCH / HIGH nesting with validated cookies
//! - **ke::preempt** - Preemption counter and deferred reschedule
//! - **ke::dpc** - Deferred procedure calls, per-processor FIFO
//! - **ke::timer** - Per-processor ordered kernel timers
//! - **ke::spinlock** - Spinlocks with raw, DPC-safe and interrupt-safe disciplines
//! - **ke::mutex / semaphore / rwmutex / event / condwait** - Blocking primitives
//! - **hal** - Processor, clock and scheduler seams
//!
//! # Initialization
//!
//! The kernel installs its [`hal::Platform`] once, then calls
//! [`ke::percpu::bring_up`] on every processor before that processor takes
//! its first interrupt.
//!
//! With the `hosted` feature (and always under `cargo test`) the crate builds
//! against std and [`hal::hosted`] maps each std thread to a virtual processor.

#![cfg_attr(not(any(test, feature = "hosted")), no_std)]
// Kernel-specific lint configurations:
// - missing_safety_doc: intrusive list and per-CPU accessors are unsafe by nature
// - declare_interior_mutable_const: common pattern for static initialization in no_std
// - new_without_default: kernel objects are built by const fn for statics
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::declare_interior_mutable_const)]
#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod hal;
pub mod ke;
