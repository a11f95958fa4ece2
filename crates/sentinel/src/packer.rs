//! Packing variable-length data behind a record.
//!
//! A slot's data area holds the fixed record at offset 0. Anything the
//! record points at (strings, buffers, reply structs) is copied behind it,
//! each item 8-byte aligned, and the record's pointer fields are rewritten
//! to the address of the copy as the *other* side of the channel sees it.
//!
//! ```text
//! 0            align8(record_len)                 record_len + extra_size
//! ├── record ──┼── item ──┼pad┼── item ──┼─ free ─┤
//! ```
//!
//! The same packer runs on both sides: producers pack arguments toward the
//! consumer, consumers pack replies back toward the producer.

use std::ffi::CStr;
use std::fmt;
use std::mem::size_of;
use std::ptr;

use sentinel_shm::{AddressSpace, RelocError, RelocPtr, Relocation};

use crate::message::Plain;

#[inline]
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackError {
    /// Packing would run past `record_len + extra_size` (or the slot).
    TooLong { needed: usize, available: usize },
    /// A source pointer is not in the packing side's address space.
    Reloc(RelocError),
    /// The record does not fit in the bytes it is packed over.
    RecordTooShort { needed: usize, length: usize },
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLong { needed, available } => write!(
                f,
                "message too long: needs {} bytes, {} available",
                needed, available
            ),
            Self::Reloc(e) => write!(f, "{}", e),
            Self::RecordTooShort { needed, length } => {
                write!(f, "record is {} bytes, need {}", length, needed)
            }
        }
    }
}

impl std::error::Error for PackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Reloc(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RelocError> for PackError {
    fn from(e: RelocError) -> Self {
        Self::Reloc(e)
    }
}

/// Appends data after a record in one slot.
pub struct Packer<'a> {
    data: &'a mut [u8],
    /// Address of `data[0]` in `relocation.from()`.
    base: u64,
    relocation: Relocation,
    record_len: usize,
    cursor: usize,
    end: usize,
}

impl<'a> Packer<'a> {
    /// A packer over `data` holding a `record_len`-byte record with `extra`
    /// bytes reserved behind it.
    ///
    /// `base` is the address of `data[0]` on the packing side; returned
    /// pointers are `relocation` applied to the local address of each copy.
    pub fn new(
        data: &'a mut [u8],
        base: u64,
        relocation: Relocation,
        record_len: usize,
        extra: usize,
    ) -> Result<Self, PackError> {
        let needed = record_len + extra;
        if needed > data.len() {
            return Err(PackError::TooLong {
                needed,
                available: data.len(),
            });
        }
        Ok(Self {
            data,
            base,
            relocation,
            record_len,
            cursor: align8(record_len),
            end: needed,
        })
    }

    #[inline]
    pub fn relocation(&self) -> Relocation {
        self.relocation
    }

    /// Bytes still available for packing.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.cursor)
    }

    /// Check that items of the given lengths fit, in order, without packing
    /// anything.
    pub fn plan(&self, lens: &[usize]) -> Result<(), PackError> {
        let mut cursor = self.cursor;
        for &len in lens {
            let stop = cursor + len;
            if stop > self.end {
                return Err(self.too_long(stop));
            }
            cursor = align8(stop);
        }
        Ok(())
    }

    fn too_long(&self, needed: usize) -> PackError {
        PackError::TooLong {
            needed,
            available: self.end,
        }
    }

    /// Claim `len` bytes; returns their offset.
    fn take(&mut self, len: usize) -> Result<usize, PackError> {
        let start = self.cursor;
        let stop = start + len;
        if stop > self.end {
            return Err(self.too_long(stop));
        }
        self.cursor = align8(stop);
        Ok(start)
    }

    fn relocate(&self, offset: usize) -> Result<RelocPtr, PackError> {
        let local = RelocPtr::new(self.base + offset as u64, self.relocation.from());
        Ok(self.relocation.apply(local)?)
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<RelocPtr, PackError> {
        let start = self.take(bytes.len())?;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
        self.relocate(start)
    }

    /// Copy a string including its NUL.
    pub fn push_cstr(&mut self, s: &CStr) -> Result<RelocPtr, PackError> {
        self.push_bytes(s.to_bytes_with_nul())
    }

    pub fn push<T: Plain>(&mut self, value: &T) -> Result<RelocPtr, PackError> {
        let start = self.take(size_of::<T>())?;
        // SAFETY: take() bounds-checked the range.
        unsafe { ptr::write_unaligned(self.data.as_mut_ptr().add(start) as *mut T, *value) };
        self.relocate(start)
    }

    /// Reserve a zero-filled output area of `len` bytes.
    pub fn reserve(&mut self, len: usize) -> Result<RelocPtr, PackError> {
        let start = self.take(len)?;
        self.data[start..start + len].fill(0);
        self.relocate(start)
    }

    /// Copy the caller's string at `src` into the slot. Null stays null.
    ///
    /// # Safety
    ///
    /// A non-null `src` must be a [`AddressSpace::Local`] pointer to a
    /// NUL-terminated string that is valid for reads.
    pub unsafe fn copy_cstr(&mut self, src: RelocPtr) -> Result<RelocPtr, PackError> {
        let [out] = unsafe { self.copy_cstrs([src]) }?;
        Ok(out)
    }

    /// Copy several caller strings. All lengths are measured and checked
    /// before the first copy.
    ///
    /// # Safety
    ///
    /// As for [`Packer::copy_cstr`], for every element.
    pub unsafe fn copy_cstrs<const N: usize>(
        &mut self,
        srcs: [RelocPtr; N],
    ) -> Result<[RelocPtr; N], PackError> {
        let mut strs: [Option<&CStr>; N] = [None; N];
        for (slot, src) in strs.iter_mut().zip(srcs.iter()) {
            if src.is_null() {
                continue;
            }
            if src.space() != Some(AddressSpace::Local) {
                return Err(PackError::Reloc(RelocError::WrongSpace {
                    expected: AddressSpace::Local,
                    found: src.space_raw(),
                }));
            }
            // SAFETY: caller guarantees a valid local C string.
            *slot = Some(unsafe { CStr::from_ptr(src.as_ptr()) });
        }

        let lens: [usize; N] = std::array::from_fn(|i| {
            strs[i].map_or(0, |s| s.to_bytes_with_nul().len())
        });
        self.plan(&lens)?;

        let mut out = [RelocPtr::null(self.relocation.to()); N];
        for (dst, s) in out.iter_mut().zip(strs) {
            if let Some(s) = s {
                *dst = self.push_cstr(s)?;
            }
        }
        Ok(out)
    }

    /// The record packed over.
    pub fn record<T: Plain>(&self) -> Result<T, PackError> {
        self.check_record::<T>()?;
        // SAFETY: record fits (checked); T: Plain accepts any bytes.
        Ok(unsafe { ptr::read_unaligned(self.data.as_ptr() as *const T) })
    }

    pub fn set_record<T: Plain>(&mut self, value: &T) -> Result<(), PackError> {
        self.check_record::<T>()?;
        // SAFETY: record fits (checked).
        unsafe { ptr::write_unaligned(self.data.as_mut_ptr() as *mut T, *value) };
        Ok(())
    }

    fn check_record<T>(&self) -> Result<(), PackError> {
        let needed = size_of::<T>();
        if needed > self.record_len {
            return Err(PackError::RecordTooShort {
                needed,
                length: self.record_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::SlotWindow;

    const LOCAL_BASE: u64 = 0x10_0000;
    const OFFSET: i64 = 0x7000;

    fn device_to_host() -> Relocation {
        Relocation::new(OFFSET, AddressSpace::Device, AddressSpace::Host)
    }

    #[test]
    fn string_survives_relocation() {
        let mut data = [0u8; 128];
        let path = c"/tmp/sentinel/file.txt";

        let packed = {
            let mut packer = Packer::new(&mut data, LOCAL_BASE, device_to_host(), 20, 64).unwrap();
            unsafe { packer.copy_cstr(RelocPtr::local(path.as_ptr())) }.unwrap()
        };

        // First item lands at align8(20) = 24, shifted into the host view.
        assert_eq!(packed.space(), Some(AddressSpace::Host));
        assert_eq!(packed.addr(), LOCAL_BASE + 24 + OFFSET as u64);

        let window = SlotWindow::new(&mut data, LOCAL_BASE + OFFSET as u64, AddressSpace::Host);
        let read = window.c_str(packed).unwrap();
        assert_eq!(read.to_bytes_with_nul(), path.to_bytes_with_nul());
    }

    #[test]
    fn exact_fit_packs_and_one_more_byte_fails() {
        let mut data = [0u8; 128];
        let reloc = Relocation::identity(AddressSpace::Local, AddressSpace::Host);

        // 16-byte record, 16 reserved bytes: a 16-byte item fits exactly.
        let mut packer = Packer::new(&mut data, LOCAL_BASE, reloc, 16, 16).unwrap();
        packer.push_bytes(&[7u8; 16]).unwrap();
        assert_eq!(packer.remaining(), 0);

        let mut packer = Packer::new(&mut data, LOCAL_BASE, reloc, 16, 16).unwrap();
        assert_eq!(
            packer.push_bytes(&[7u8; 17]),
            Err(PackError::TooLong {
                needed: 33,
                available: 32,
            })
        );
    }

    #[test]
    fn copy_cstrs_checks_all_lengths_first() {
        let mut data = [0u8; 128];
        let reloc = Relocation::identity(AddressSpace::Local, AddressSpace::Host);
        let short = c"ab";
        let long = c"0123456789abcdef0123456789";

        let mut packer = Packer::new(&mut data, LOCAL_BASE, reloc, 16, 24).unwrap();
        let err = unsafe {
            packer.copy_cstrs([RelocPtr::local(short.as_ptr()), RelocPtr::local(long.as_ptr())])
        }
        .unwrap_err();
        assert!(matches!(err, PackError::TooLong { .. }));
        // Nothing was copied.
        assert_eq!(packer.remaining(), 24);
        drop(packer);
        assert!(data[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn null_source_stays_null_in_target_space() {
        let mut data = [0u8; 64];
        let mut packer = Packer::new(&mut data, LOCAL_BASE, device_to_host(), 16, 16).unwrap();
        let out = unsafe { packer.copy_cstr(RelocPtr::null(AddressSpace::Local)) }.unwrap();
        assert!(out.is_null());
        assert_eq!(out.space(), Some(AddressSpace::Host));
    }

    #[test]
    fn foreign_source_pointer_is_rejected() {
        let mut data = [0u8; 64];
        let mut packer = Packer::new(&mut data, LOCAL_BASE, device_to_host(), 16, 16).unwrap();
        let err = unsafe { packer.copy_cstr(RelocPtr::new(0x40, AddressSpace::Host)) }.unwrap_err();
        assert!(matches!(err, PackError::Reloc(_)));
    }

    #[test]
    fn record_larger_than_slot_is_too_long() {
        let mut data = [0u8; 64];
        let reloc = Relocation::identity(AddressSpace::Local, AddressSpace::Host);
        let err = Packer::new(&mut data, LOCAL_BASE, reloc, 48, 17).err().unwrap();
        assert_eq!(
            err,
            PackError::TooLong {
                needed: 65,
                available: 64,
            }
        );
    }
}
