//! Intrusive doubly-linked list (NT LIST_ENTRY style)
//!
//! The list entry is embedded within the containing structure, giving O(1)
//! insertion and removal without allocation. Unlike the circular NT list,
//! the head here is a `{first, last}` pair that never points at itself, so
//! an object embedding an empty head can be moved freely. Waiter records
//! live on the blocking caller's stack and DPC/timer objects in statics,
//! so nothing in this module allocates.
//!
//! # Safety
//!
//! This is an intrusive data structure. The caller must ensure:
//! - An entry is in at most one list at a time
//! - The containing structure outlives its list membership
//! - Every list operation is serialized by the owning lock or by the
//!   owning processor's IRQL

use core::ptr;

/// Doubly-linked list entry (embedded in containing structure)
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct ListEntry {
    /// Forward link (next entry, null at the tail)
    pub flink: *mut ListEntry,
    /// Backward link (previous entry, null at the head)
    pub blink: *mut ListEntry,
}

impl ListEntry {
    /// Create a new unlinked list entry
    pub const fn new() -> Self {
        Self {
            flink: ptr::null_mut(),
            blink: ptr::null_mut(),
        }
    }
}

impl Default for ListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Head of an intrusive list
#[derive(Debug)]
pub struct ListHead {
    first: *mut ListEntry,
    last: *mut ListEntry,
    len: usize,
}

// Entries are only reached through the head while the owner's lock is held.
unsafe impl Send for ListHead {}

impl ListHead {
    /// Create a new empty list
    pub const fn new() -> Self {
        Self {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
            len: 0,
        }
    }

    /// Forget every entry (used when a processor is brought up)
    #[inline]
    pub fn init(&mut self) {
        *self = Self::new();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// First entry, or null if the list is empty
    #[inline]
    pub fn first(&self) -> *mut ListEntry {
        self.first
    }

    /// Insert entry at the tail of the list
    ///
    /// Equivalent to InsertTailList()
    ///
    /// # Safety
    /// The entry must not already be in a list
    #[inline]
    pub unsafe fn insert_tail(&mut self, entry: *mut ListEntry) {
        (*entry).flink = ptr::null_mut();
        (*entry).blink = self.last;
        if self.last.is_null() {
            self.first = entry;
        } else {
            (*self.last).flink = entry;
        }
        self.last = entry;
        self.len += 1;
    }

    /// Insert entry at the head of the list
    ///
    /// Equivalent to InsertHeadList()
    ///
    /// # Safety
    /// The entry must not already be in a list
    #[inline]
    pub unsafe fn insert_head(&mut self, entry: *mut ListEntry) {
        (*entry).blink = ptr::null_mut();
        (*entry).flink = self.first;
        if self.first.is_null() {
            self.last = entry;
        } else {
            (*self.first).blink = entry;
        }
        self.first = entry;
        self.len += 1;
    }

    /// Insert `entry` immediately before `next`, which must be in this list
    ///
    /// # Safety
    /// `entry` must be unlinked and `next` must be linked into `self`
    pub unsafe fn insert_before(&mut self, next: *mut ListEntry, entry: *mut ListEntry) {
        let prev = (*next).blink;
        if prev.is_null() {
            self.insert_head(entry);
            return;
        }
        (*entry).flink = next;
        (*entry).blink = prev;
        (*prev).flink = entry;
        (*next).blink = entry;
        self.len += 1;
    }

    /// Remove and return the first entry, or null if the list is empty
    ///
    /// Equivalent to RemoveHeadList()
    ///
    /// # Safety
    /// Every entry in the list must still be valid
    #[inline]
    pub unsafe fn remove_head(&mut self) -> *mut ListEntry {
        let entry = self.first;
        if !entry.is_null() {
            self.remove_entry(entry);
        }
        entry
    }

    /// Remove `entry` from this list
    ///
    /// Equivalent to RemoveEntryList()
    ///
    /// # Safety
    /// The entry must be linked into `self`
    #[inline]
    pub unsafe fn remove_entry(&mut self, entry: *mut ListEntry) {
        let flink = (*entry).flink;
        let blink = (*entry).blink;

        if blink.is_null() {
            self.first = flink;
        } else {
            (*blink).flink = flink;
        }

        if flink.is_null() {
            self.last = blink;
        } else {
            (*flink).blink = blink;
        }

        // Clear pointers to help catch bugs
        (*entry).flink = ptr::null_mut();
        (*entry).blink = ptr::null_mut();
        self.len -= 1;
    }

    /// Iterate over the raw entries from head to tail
    ///
    /// # Safety
    /// The list must not be modified while the iterator is alive
    pub unsafe fn iter(&self) -> ListIter {
        ListIter { current: self.first }
    }
}

impl Default for ListHead {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw iterator over list entries
pub struct ListIter {
    current: *mut ListEntry,
}

impl Iterator for ListIter {
    type Item = *mut ListEntry;

    fn next(&mut self) -> Option<*mut ListEntry> {
        if self.current.is_null() {
            return None;
        }
        let entry = self.current;
        // SAFETY: the creator of the iterator guarantees the list is stable
        self.current = unsafe { (*entry).flink };
        Some(entry)
    }
}

/// Get a pointer to the containing structure from a list entry pointer
///
/// Equivalent to CONTAINING_RECORD() macro in Windows:
/// ```c
/// #define CONTAINING_RECORD(address, type, field) \
///     ((type *)((char *)(address) - offsetof(type, field)))
/// ```
#[macro_export]
macro_rules! containing_record {
    ($ptr:expr, $type:ty, $field:ident) => {{
        let offset = core::mem::offset_of!($type, $field);
        ($ptr as *mut u8).sub(offset) as *mut $type
    }};
}
