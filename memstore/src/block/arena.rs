//! Page-aligned raw memory backing the block store.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// Size of an arena page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// An owned, page-aligned allocation holding one block's bytes.
///
/// The region is divided by its owning [`Block`](super::manager::Block) into
/// a payload area growing from the head and a metadata area growing from the
/// tail; `BlockMem` itself only provides raw, range-checked access.
///
/// # Safety model
///
/// A block has exactly one writer at a time: the holder currently filling
/// it. Readers are only ever handed ranges that were completely written
/// before the reference escaped, so reads and writes never overlap. The
/// manager recycles a block's memory only while the containing [`Arc`] is
/// sole-owned (`Arc::strong_count == 1`), which makes it impossible for a
/// reader of an old incarnation to alias a later writer.
///
/// [`Arc`]: std::sync::Arc
#[derive(Debug)]
pub struct BlockMem {
    ptr: NonNull<u8>,
    capacity: usize,
}

// SAFETY: the backing region is plain bytes; the discipline above keeps
// concurrent access to disjoint ranges.
unsafe impl Send for BlockMem {}
unsafe impl Sync for BlockMem {}

impl BlockMem {
    /// Allocate a zeroed, page-aligned region of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity % PAGE_SIZE == 0,
            "block capacity must be a positive multiple of the page size"
        );
        let layout = Self::layout(capacity);
        // SAFETY: `layout` has non-zero size, asserted above.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| handle_alloc_error(layout));
        Self { ptr, capacity }
    }

    fn layout(capacity: usize) -> Layout {
        Layout::from_size_align(capacity, PAGE_SIZE).expect("invalid block layout")
    }

    /// Usable bytes in this allocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `src` into the region starting at `offset`.
    ///
    /// Panics if the range is out of bounds. The caller must be the block's
    /// single writer and `offset..offset + src.len()` must not have been
    /// handed to any reader (see the safety model above).
    pub(crate) fn write(&self, offset: usize, src: &[u8]) {
        let end = offset.checked_add(src.len()).expect("write range overflow");
        assert!(end <= self.capacity, "write beyond block capacity");
        // SAFETY: range checked above; disjoint from every range readers
        // hold per the caller contract.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }

    /// Read `len` bytes starting at `offset`.
    ///
    /// Panics if the range is out of bounds. The caller must only pass
    /// ranges that were completely written.
    pub(crate) fn read(&self, offset: usize, len: usize) -> &[u8] {
        let end = offset.checked_add(len).expect("read range overflow");
        assert!(end <= self.capacity, "read beyond block capacity");
        // SAFETY: range checked above and fully written per the caller
        // contract; the single writer never touches ranges already handed
        // out.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }
}

impl Drop for BlockMem {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the identical layout.
        unsafe { dealloc(self.ptr.as_ptr(), Self::layout(self.capacity)) }
    }
}
