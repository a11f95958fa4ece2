//! Relocatable pointers.
//!
//! A pointer written into a slot is an address in the *producer's* view of
//! the shared segment. The consumer may map the same bytes at a different
//! base, so every pointer field carries the address space it is valid in and
//! is moved by a channel's [`Relocation`] before it is dereferenced.

use core::fmt;

/// The address spaces a pointer in shared memory can belong to.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSpace {
    /// The current process; no translation needed.
    Local = 0,
    /// The host view of a segment.
    Host = 1,
    /// The device view of a pinned segment.
    Device = 2,
    /// A client process attached to a named host segment.
    Client = 3,
}

impl AddressSpace {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Local,
            1 => Self::Host,
            2 => Self::Device,
            3 => Self::Client,
            _ => return None,
        })
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Host => "host",
            Self::Device => "device",
            Self::Client => "client",
        };
        f.write_str(name)
    }
}

/// A pointer field inside a message record (16 bytes).
///
/// Stored as an integer address plus an [`AddressSpace`] tag. The tag is a
/// raw `u32` so that a corrupt value read out of shared memory is reported
/// instead of being undefined behavior.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelocPtr {
    addr: u64,
    space: u32,
    _reserved: u32,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(core::mem::size_of::<RelocPtr>() == 16);

impl RelocPtr {
    pub const fn new(addr: u64, space: AddressSpace) -> Self {
        Self {
            addr,
            space: space as u32,
            _reserved: 0,
        }
    }

    pub const fn null(space: AddressSpace) -> Self {
        Self::new(0, space)
    }

    /// Tag a pointer from the current address space.
    pub fn local<T>(ptr: *const T) -> Self {
        Self::from_ptr(ptr, AddressSpace::Local)
    }

    pub fn from_ptr<T>(ptr: *const T, space: AddressSpace) -> Self {
        Self::new(ptr as usize as u64, space)
    }

    /// The raw address as a pointer. Only meaningful in the space it is
    /// tagged with.
    #[inline]
    pub fn as_ptr<T>(&self) -> *const T {
        self.addr as usize as *const T
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        self.addr
    }

    #[inline]
    pub fn space_raw(&self) -> u32 {
        self.space
    }

    #[inline]
    pub fn space(&self) -> Option<AddressSpace> {
        AddressSpace::from_u32(self.space)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
}

impl fmt::Debug for RelocPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.space() {
            Some(space) => write!(f, "{space}:{:#x}", self.addr),
            None => write!(f, "?{}:{:#x}", self.space, self.addr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocError {
    /// The pointer is not tagged with the space this relocation starts from.
    WrongSpace { expected: AddressSpace, found: u32 },
}

impl fmt::Display for RelocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongSpace { expected, found } => match AddressSpace::from_u32(*found) {
                Some(found) => write!(f, "pointer is in the {found} space, expected {expected}"),
                None => write!(f, "pointer has unknown space tag {found}, expected {expected}"),
            },
        }
    }
}

impl core::error::Error for RelocError {}

/// A fixed translation between two views of the same bytes.
///
/// `offset` is added to an address in `from` to get the address of the same
/// byte in `to`. Relocation never changes which byte a pointer refers to, so
/// applying a relocation and then its inverse gives back the original pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    offset: i64,
    from: AddressSpace,
    to: AddressSpace,
}

impl Relocation {
    pub const fn new(offset: i64, from: AddressSpace, to: AddressSpace) -> Self {
        Self { offset, from, to }
    }

    /// A relocation between two spaces that share addresses.
    pub const fn identity(from: AddressSpace, to: AddressSpace) -> Self {
        Self::new(0, from, to)
    }

    #[inline]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    #[inline]
    pub fn from(&self) -> AddressSpace {
        self.from
    }

    #[inline]
    pub fn to(&self) -> AddressSpace {
        self.to
    }

    /// Move `ptr` from `from` into `to`.
    ///
    /// Null stays null but is retagged.
    pub fn apply(&self, ptr: RelocPtr) -> Result<RelocPtr, RelocError> {
        if ptr.space_raw() != self.from as u32 {
            return Err(RelocError::WrongSpace {
                expected: self.from,
                found: ptr.space_raw(),
            });
        }
        if ptr.is_null() {
            return Ok(RelocPtr::null(self.to));
        }
        Ok(RelocPtr::new(
            ptr.addr().wrapping_add_signed(self.offset),
            self.to,
        ))
    }

    pub fn inverse(&self) -> Self {
        Self {
            offset: self.offset.wrapping_neg(),
            from: self.to,
            to: self.from,
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn apply_then_inverse_is_identity() {
        let reloc = Relocation::new(-0x1000, AddressSpace::Device, AddressSpace::Host);
        let ptr = RelocPtr::new(0x7000_2000, AddressSpace::Device);

        let host = reloc.apply(ptr).unwrap();
        assert_eq!(host.addr(), 0x7000_1000);
        assert_eq!(host.space(), Some(AddressSpace::Host));
        assert_eq!(reloc.inverse().apply(host).unwrap(), ptr);
    }

    #[test]
    fn null_is_retagged_not_moved() {
        let reloc = Relocation::new(0x40, AddressSpace::Client, AddressSpace::Host);
        let moved = reloc.apply(RelocPtr::null(AddressSpace::Client)).unwrap();
        assert!(moved.is_null());
        assert_eq!(moved.space(), Some(AddressSpace::Host));
    }

    #[test]
    fn wrong_space_is_rejected() {
        let reloc = Relocation::identity(AddressSpace::Host, AddressSpace::Local);
        let err = reloc
            .apply(RelocPtr::new(0x10, AddressSpace::Device))
            .unwrap_err();
        assert_eq!(
            err,
            RelocError::WrongSpace {
                expected: AddressSpace::Host,
                found: AddressSpace::Device as u32,
            }
        );
    }
}
