//! Views of a shared memory range.

use core::mem::{align_of, size_of};

/// A borrowed view of a mapped memory range.
///
/// `Region` is a (base, len) pair. It does not own the memory; whoever mapped
/// it keeps it alive for as long as any `Region` derived from it is in use.
/// Two `Region`s may describe the same physical bytes at different virtual
/// addresses (for example a host view and a device view of one segment).
#[derive(Debug, Clone, Copy)]
pub struct Region {
    base: *mut u8,
    len: usize,
}

// SAFETY: Region is a plain address range; all shared mutation inside it goes
// through atomics or through slots owned by exactly one side at a time.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region from a raw base pointer and length.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be mapped, readable and writable for as long as
    /// the region (or anything built on it) is used.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    /// Base address as seen from the current address space.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.base as usize as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to `offset` bytes into the region.
    #[inline]
    pub fn offset(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset out of region");
        // SAFETY: offset is within the mapped range.
        unsafe { self.base.add(offset) }
    }

    /// Typed reference at `offset`.
    ///
    /// # Safety
    ///
    /// A valid, initialized `T` must live at `offset`.
    #[inline]
    pub unsafe fn get<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + size_of::<T>() <= self.len);
        debug_assert!((self.base as usize + offset).is_multiple_of(align_of::<T>()));
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Sub-range starting at `offset` with length `len`.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Region> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        Some(Region {
            base: self.offset(offset),
            len,
        })
    }

    /// The part of this region that starts at the first address aligned to
    /// `align` (a power of two) at or after the base.
    pub fn align_up(&self, align: usize) -> Option<Region> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let addr = self.base as usize;
        let aligned = addr.checked_add(align - 1)? & !(align - 1);
        self.slice(aligned - addr, self.len - (aligned - addr).min(self.len))
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let base = self.addr();
        match (addr.checked_sub(base), addr.checked_add(len as u64)) {
            (Some(_), Some(end)) => end <= base + self.len as u64,
            _ => false,
        }
    }
}

/// A zeroed, page-aligned heap allocation usable as a [`Region`].
///
/// Used for tests and for in-process channels that never leave the current
/// address space.
#[cfg(any(test, feature = "alloc"))]
pub struct HeapRegion {
    ptr: core::ptr::NonNull<u8>,
    layout: alloc::alloc::Layout,
}

#[cfg(any(test, feature = "alloc"))]
unsafe impl Send for HeapRegion {}
#[cfg(any(test, feature = "alloc"))]
unsafe impl Sync for HeapRegion {}

#[cfg(any(test, feature = "alloc"))]
impl HeapRegion {
    pub const ALIGN: usize = 4096;

    pub fn new_zeroed(len: usize) -> Self {
        assert!(len > 0, "region length must be > 0");
        let layout = alloc::alloc::Layout::from_size_align(len, Self::ALIGN)
            .expect("region layout overflows");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(ptr) = core::ptr::NonNull::new(raw) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        Self { ptr, layout }
    }

    pub fn region(&self) -> Region {
        Region {
            base: self.ptr.as_ptr(),
            len: self.layout.size(),
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with this layout.
        unsafe { alloc::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn align_up_skips_to_boundary() {
        let heap = HeapRegion::new_zeroed(8192);
        let region = heap.region();
        let shifted = region.slice(100, 8000).unwrap();

        let aligned = shifted.align_up(4096).unwrap();
        assert_eq!(aligned.addr() % 4096, 0);
        assert_eq!(aligned.addr(), region.addr() + 4096);
        assert_eq!(aligned.len(), 8100 - 4096);
    }

    #[test]
    fn align_up_keeps_aligned_base() {
        let heap = HeapRegion::new_zeroed(4096);
        let region = heap.region();
        let aligned = region.align_up(4096).unwrap();
        assert_eq!(aligned.addr(), region.addr());
        assert_eq!(aligned.len(), 4096);
    }

    #[test]
    fn contains_checks_both_ends() {
        let heap = HeapRegion::new_zeroed(4096);
        let region = heap.region();
        assert!(region.contains(region.addr(), 4096));
        assert!(region.contains(region.addr() + 10, 10));
        assert!(!region.contains(region.addr() + 4090, 7));
        assert!(!region.contains(region.addr().wrapping_sub(1), 1));
    }
}
