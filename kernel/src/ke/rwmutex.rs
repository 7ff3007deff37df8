//! Reader/Writer Mutex
//!
//! Built from two [`KMutex`]es and a reader count:
//!
//! - `common` is held by one writer, or collectively by all readers
//! - `readers` counts readers inside; non-zero means the group holds `common`
//! - `reader_mutex` serializes readers joining an empty group
//!
//! A reader joins a non-empty group with a single atomic increment. The
//! first reader of a group takes `common` on the group's behalf; the last
//! reader out releases it, even if it is a different task.
//!
//! Writers can starve: as long as readers keep overlapping, `readers` never
//! drops to zero and a waiting writer never gets `common`.
//!
//! # Usage
//! ```ignore
//! static ROUTES: KRwMutex = KRwMutex::new();
//!
//! {
//!     let _read = ROUTES.read();
//!     // ... many readers at once ...
//! }
//! let _write = ROUTES.write();
//! ```

use core::sync::atomic::{AtomicUsize, Ordering};

use super::mutex::KMutex;
use super::wait::{self, Deadline, WaitError, WaitMode};

/// Increment unless the count is zero; true if incremented
#[inline]
fn inc_unless_zero(count: &AtomicUsize) -> bool {
    count
        .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| {
            if n == 0 {
                None
            } else {
                Some(n + 1)
            }
        })
        .is_ok()
}

/// Reader/writer mutex
pub struct KRwMutex {
    common: KMutex,
    readers: AtomicUsize,
    reader_mutex: KMutex,
}

impl KRwMutex {
    pub const fn new() -> Self {
        Self {
            common: KMutex::new(),
            readers: AtomicUsize::new(0),
            reader_mutex: KMutex::new(),
        }
    }

    /// Readers currently inside
    #[inline]
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Held by a writer or by readers
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.common.is_locked()
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    pub fn try_read_lock(&self) -> bool {
        if inc_unless_zero(&self.readers) {
            return true;
        }
        if !self.reader_mutex.try_lock() {
            return false;
        }
        let joined = if inc_unless_zero(&self.readers) {
            true
        } else if self.common.try_lock() {
            self.readers.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        };
        self.reader_mutex.unlock();
        joined
    }

    pub fn read_lock(&self) {
        // Without a deadline or signals the wait can only end in ownership
        let _ = self.read_lock_until(Deadline::Never, WaitMode::Uninterruptible);
    }

    pub fn read_lock_interruptible(&self) -> Result<(), WaitError> {
        self.read_lock_until(Deadline::Never, WaitMode::Interruptible)
    }

    pub fn read_lock_timeout(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.read_lock_until(Deadline::after(timeout_ns), WaitMode::Uninterruptible)
    }

    pub fn read_lock_timeout_interruptible(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.read_lock_until(Deadline::after(timeout_ns), WaitMode::Interruptible)
    }

    /// Leave the reader group; the last reader releases `common`
    pub fn read_unlock(&self) {
        if self.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.common.release_group();
        }
    }

    /// Read-lock and return a guard that read-unlocks on drop
    pub fn read(&self) -> ReadGuard<'_> {
        self.read_lock();
        ReadGuard { rw: self }
    }

    fn read_lock_until(&self, deadline: Deadline, mode: WaitMode) -> Result<(), WaitError> {
        wait::assert_can_block(self as *const KRwMutex as usize);

        if inc_unless_zero(&self.readers) {
            return Ok(());
        }

        self.reader_mutex.lock_until(deadline, mode)?;
        // Another reader may have opened the group while we waited
        if inc_unless_zero(&self.readers) {
            self.reader_mutex.unlock();
            return Ok(());
        }

        let result = self.common.lock_until(deadline, mode);
        if result.is_ok() {
            self.readers.fetch_add(1, Ordering::AcqRel);
        }
        self.reader_mutex.unlock();
        result
    }

    // ------------------------------------------------------------------
    // Writers
    // ------------------------------------------------------------------

    pub fn try_write_lock(&self) -> bool {
        self.common.try_lock()
    }

    pub fn write_lock(&self) {
        self.common.lock();
    }

    pub fn write_lock_interruptible(&self) -> Result<(), WaitError> {
        self.common.lock_interruptible()
    }

    pub fn write_lock_timeout(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.common.lock_timeout(timeout_ns)
    }

    pub fn write_lock_timeout_interruptible(&self, timeout_ns: u64) -> Result<(), WaitError> {
        self.common.lock_timeout_interruptible(timeout_ns)
    }

    pub fn write_unlock(&self) {
        self.common.unlock();
    }

    /// Write-lock and return a guard that write-unlocks on drop
    pub fn write(&self) -> WriteGuard<'_> {
        self.write_lock();
        WriteGuard { rw: self }
    }
}

impl Default for KRwMutex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReadGuard<'a> {
    rw: &'a KRwMutex,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.rw.read_unlock();
    }
}

pub struct WriteGuard<'a> {
    rw: &'a KRwMutex,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.rw.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::hosted;
    use core::cell::UnsafeCell;
    use std::sync::{mpsc, Arc, Barrier};
    use std::thread;

    #[test]
    fn test_readers_share() {
        hosted::install();
        let rw = Arc::new(KRwMutex::new());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rw = rw.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let _read = rw.read();
                    // Only passes if all four readers are inside at once
                    barrier.wait();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(rw.reader_count(), 0);
        assert!(!rw.is_locked());
    }

    #[test]
    fn test_writer_excluded_by_reader() {
        hosted::install();
        let rw = Arc::new(KRwMutex::new());
        rw.read_lock();
        assert!(!rw.try_write_lock());

        let writer = rw.clone();
        let result = thread::spawn(move || writer.write_lock_timeout(20_000_000))
            .join()
            .unwrap();
        assert_eq!(result, Err(WaitError::Timeout));

        // A second reader joins without the common mutex
        let reader = rw.clone();
        assert!(thread::spawn(move || {
            let joined = reader.try_read_lock();
            if joined {
                reader.read_unlock();
            }
            joined
        })
        .join()
        .unwrap());

        rw.read_unlock();
        assert!(rw.try_write_lock());
        assert!(!rw.try_read_lock());
        rw.write_unlock();
    }

    #[test]
    fn test_last_reader_releases_for_first() {
        hosted::install();
        let rw = Arc::new(KRwMutex::new());
        rw.read_lock();
        let (joined_tx, joined_rx) = mpsc::channel();
        let (leave_tx, leave_rx) = mpsc::channel::<()>();
        let other = rw.clone();
        // Joins the group, then outlives the first reader's hold
        let handle = thread::spawn(move || {
            other.read_lock();
            joined_tx.send(()).unwrap();
            leave_rx.recv().unwrap();
            // Released by a task that did not acquire `common`
            other.read_unlock();
        });
        joined_rx.recv().unwrap();
        rw.read_unlock();
        assert!(rw.is_locked());
        leave_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(!rw.is_locked());
        assert_eq!(rw.reader_count(), 0);
    }

    struct Pair {
        rw: KRwMutex,
        a: UnsafeCell<u64>,
        b: UnsafeCell<u64>,
    }

    unsafe impl Sync for Pair {}

    #[test]
    fn test_writers_exclusive_readers_consistent() {
        hosted::install();
        let pair = Arc::new(Pair {
            rw: KRwMutex::new(),
            a: UnsafeCell::new(0),
            b: UnsafeCell::new(0),
        });
        let mut handles = Vec::new();
        for _ in 0..4 {
            let pair = pair.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    let _write = pair.rw.write();
                    unsafe {
                        *pair.a.get() += 1;
                        *pair.b.get() += 1;
                    }
                }
            }));
        }
        for _ in 0..4 {
            let pair = pair.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..2_000 {
                    let _read = pair.rw.read();
                    unsafe { assert_eq!(*pair.a.get(), *pair.b.get()) };
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(unsafe { *pair.a.get() }, 8_000);
    }
}
