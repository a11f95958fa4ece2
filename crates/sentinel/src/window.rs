//! Validated access to a slot's data area.

use std::ffi::CStr;
use std::mem::size_of;
use std::ptr;

use sentinel_shm::{AddressSpace, RelocError, RelocPtr};

use crate::error::CallError;
use crate::message::Plain;

/// A slot's data area as seen from one address space.
///
/// Pointer fields read out of a record are only dereferenced through a
/// window, which checks that they are tagged with the window's space and
/// land inside the slot.
pub struct SlotWindow<'a> {
    data: &'a mut [u8],
    base: u64,
    space: AddressSpace,
}

impl<'a> SlotWindow<'a> {
    /// `base` is the address of `data[0]` in `space`.
    pub fn new(data: &'a mut [u8], base: u64, space: AddressSpace) -> Self {
        Self { data, base, space }
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.base
    }

    #[inline]
    pub fn space(&self) -> AddressSpace {
        self.space
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset into the window of `len` bytes at `ptr`.
    pub fn locate(&self, ptr: RelocPtr, len: usize) -> Result<usize, CallError> {
        if ptr.space_raw() != self.space as u32 {
            return Err(CallError::WrongSpace(RelocError::WrongSpace {
                expected: self.space,
                found: ptr.space_raw(),
            }));
        }
        if ptr.is_null() {
            return Err(CallError::NullPointer);
        }
        let out_of_window = CallError::OutOfWindow {
            addr: ptr.addr(),
            len,
        };
        let offset = ptr
            .addr()
            .checked_sub(self.base)
            .ok_or(out_of_window.clone())? as usize;
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(offset),
            _ => Err(out_of_window),
        }
    }

    pub fn bytes(&self, ptr: RelocPtr, len: usize) -> Result<&[u8], CallError> {
        let offset = self.locate(ptr, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn bytes_mut(&mut self, ptr: RelocPtr, len: usize) -> Result<&mut [u8], CallError> {
        let offset = self.locate(ptr, len)?;
        Ok(&mut self.data[offset..offset + len])
    }

    /// The NUL-terminated string at `ptr`.
    pub fn c_str(&self, ptr: RelocPtr) -> Result<&CStr, CallError> {
        let offset = self.locate(ptr, 1)?;
        CStr::from_bytes_until_nul(&self.data[offset..])
            .map_err(|_| CallError::Unterminated { addr: ptr.addr() })
    }

    pub fn read<T: Plain>(&self, ptr: RelocPtr) -> Result<T, CallError> {
        let offset = self.locate(ptr, size_of::<T>())?;
        Ok(self.read_at(offset))
    }

    pub fn write<T: Plain>(&mut self, ptr: RelocPtr, value: &T) -> Result<(), CallError> {
        let offset = self.locate(ptr, size_of::<T>())?;
        self.write_at(offset, value);
        Ok(())
    }

    /// The fixed record at the start of the window. `length` is the record
    /// length the slot header reports.
    pub fn read_record<T: Plain>(&self, length: usize) -> Result<T, CallError> {
        let needed = size_of::<T>();
        if length < needed || self.data.len() < needed {
            return Err(CallError::RecordTooShort { needed, length });
        }
        Ok(self.read_at(0))
    }

    pub fn write_record<T: Plain>(&mut self, value: &T) {
        self.write_at(0, value);
    }

    /// Give up validated access and return the raw data area.
    pub(crate) fn into_data(self) -> &'a mut [u8] {
        self.data
    }

    fn read_at<T: Plain>(&self, offset: usize) -> T {
        assert!(offset + size_of::<T>() <= self.data.len());
        // SAFETY: in bounds (checked); T: Plain accepts any bytes.
        unsafe { ptr::read_unaligned(self.data.as_ptr().add(offset) as *const T) }
    }

    fn write_at<T: Plain>(&mut self, offset: usize, value: &T) {
        assert!(offset + size_of::<T>() <= self.data.len());
        // SAFETY: in bounds (checked).
        unsafe { ptr::write_unaligned(self.data.as_mut_ptr().add(offset) as *mut T, *value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x1000;

    #[test]
    fn c_str_requires_terminator() {
        let mut data = *b"abc\0def";
        let window = SlotWindow::new(&mut data, BASE, AddressSpace::Host);

        let s = window.c_str(RelocPtr::new(BASE, AddressSpace::Host)).unwrap();
        assert_eq!(s.to_bytes(), b"abc");

        let err = window
            .c_str(RelocPtr::new(BASE + 4, AddressSpace::Host))
            .unwrap_err();
        assert_eq!(err, CallError::Unterminated { addr: BASE + 4 });
    }

    #[test]
    fn pointers_are_checked_against_window() {
        let mut data = [0u8; 32];
        let window = SlotWindow::new(&mut data, BASE, AddressSpace::Host);

        assert_eq!(
            window.locate(RelocPtr::new(BASE + 24, AddressSpace::Host), 8),
            Ok(24)
        );
        assert!(matches!(
            window.locate(RelocPtr::new(BASE + 25, AddressSpace::Host), 8),
            Err(CallError::OutOfWindow { .. })
        ));
        assert!(matches!(
            window.locate(RelocPtr::new(BASE - 8, AddressSpace::Host), 8),
            Err(CallError::OutOfWindow { .. })
        ));
        assert_eq!(
            window.locate(RelocPtr::null(AddressSpace::Host), 1),
            Err(CallError::NullPointer)
        );
        assert!(matches!(
            window.locate(RelocPtr::new(BASE, AddressSpace::Device), 1),
            Err(CallError::WrongSpace(_))
        ));
    }

    #[test]
    fn record_length_is_enforced() {
        let mut data = [0u8; 32];
        let mut window = SlotWindow::new(&mut data, BASE, AddressSpace::Local);
        window.write_record(&0xfeed_u64);
        assert_eq!(window.read_record::<u64>(8), Ok(0xfeed));
        assert_eq!(
            window.read_record::<u64>(4),
            Err(CallError::RecordTooShort {
                needed: 8,
                length: 4
            })
        );
    }
}
