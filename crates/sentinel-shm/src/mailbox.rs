//! The mailbox ring.
//!
//! A mailbox is a [`MailboxHeader`] followed by `slot_count` fixed-stride
//! slots. Producers reserve slots by bumping `producer_cursor` by one stride;
//! the single consumer walks `consumer_cursor` behind them. Both cursors are
//! byte counters that only grow, and a cursor maps to a slot by
//! `(cursor % capacity) / slot_size`.

use core::fmt;
use core::mem::size_of;
use core::ptr;

use crate::region::Region;
use crate::slot::{SLOT_HEADER_SIZE, SlotHeader};
use crate::sync::{AtomicU32, AtomicU64, Ordering};

pub const MAILBOX_MAGIC: [u8; 8] = *b"SNTLMBX\0";
pub const MAILBOX_VERSION: u32 = 1;
/// Bytes taken by [`MailboxHeader`]; the first slot starts here.
pub const MAILBOX_HEADER_SIZE: usize = size_of::<MailboxHeader>();

/// Smallest slot stride accepted; leaves room for a slot header, an envelope
/// and a useful record.
pub const MIN_SLOT_SIZE: u32 = 256;

const STATE_OPEN: u32 = 0;
const STATE_CLOSED: u32 = 1;

/// Header at offset 0 of every mailbox (one cache line).
#[repr(C, align(64))]
pub struct MailboxHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub slot_size: u32,
    pub slot_count: u32,
    /// Open or closed. Producers stop posting once the consumer has gone.
    pub state: AtomicU32,
    /// Base address of the mailbox in the creator's address space. Lets an
    /// attaching process compute its relocation offset.
    pub origin: AtomicU64,
    pub consumer_cursor: AtomicU64,
    pub producer_cursor: AtomicU64,
    _pad: [u8; 16],
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(MAILBOX_HEADER_SIZE == 64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxStatus {
    Open,
    Closed,
}

impl fmt::Display for MailboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The region is smaller than the mailbox needs.
    RegionTooSmall { required: usize, available: usize },
    /// The region base is not aligned for the header.
    Misaligned { addr: u64 },
    /// Slot size is too small or not a multiple of 8.
    InvalidSlotSize(u32),
    InvalidSlotCount(u32),
    BadMagic([u8; 8]),
    UnsupportedVersion(u32),
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegionTooSmall {
                required,
                available,
            } => write!(
                f,
                "region too small: need {required} bytes, have {available}"
            ),
            Self::Misaligned { addr } => {
                write!(f, "mailbox base {addr:#x} is not 64-byte aligned")
            }
            Self::InvalidSlotSize(size) => write!(
                f,
                "invalid slot size {size}: must be a multiple of 8 and at least {MIN_SLOT_SIZE}"
            ),
            Self::InvalidSlotCount(count) => write!(f, "invalid slot count {count}"),
            Self::BadMagic(magic) => write!(f, "bad mailbox magic {magic:02x?}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported mailbox version {v}"),
        }
    }
}

impl core::error::Error for MailboxError {}

/// A mailbox laid out in a [`Region`].
///
/// `Mailbox` is a view: copying it copies the base pointer, not the ring.
#[derive(Debug, Clone, Copy)]
pub struct Mailbox {
    region: Region,
}

impl Mailbox {
    /// Bytes needed for a mailbox with the given geometry.
    pub const fn required_size(slot_size: u32, slot_count: u32) -> usize {
        MAILBOX_HEADER_SIZE + slot_size as usize * slot_count as usize
    }

    fn check_geometry(slot_size: u32, slot_count: u32) -> Result<(), MailboxError> {
        if slot_size < MIN_SLOT_SIZE || !slot_size.is_multiple_of(8) {
            return Err(MailboxError::InvalidSlotSize(slot_size));
        }
        if slot_count == 0 {
            return Err(MailboxError::InvalidSlotCount(slot_count));
        }
        Ok(())
    }

    fn check_region(region: &Region, required: usize) -> Result<(), MailboxError> {
        if !region.addr().is_multiple_of(64) {
            return Err(MailboxError::Misaligned {
                addr: region.addr(),
            });
        }
        if region.len() < required {
            return Err(MailboxError::RegionTooSmall {
                required,
                available: region.len(),
            });
        }
        Ok(())
    }

    /// Lay out a fresh mailbox: header, then every slot `FREE`.
    ///
    /// The current base address is recorded as the mailbox origin.
    ///
    /// # Safety
    ///
    /// `region` must be writable and nobody else may be using it yet.
    pub unsafe fn init(region: Region, slot_size: u32, slot_count: u32) -> Result<Self, MailboxError> {
        Self::check_geometry(slot_size, slot_count)?;
        Self::check_region(&region, Self::required_size(slot_size, slot_count))?;

        let header = MailboxHeader {
            magic: MAILBOX_MAGIC,
            version: MAILBOX_VERSION,
            slot_size,
            slot_count,
            state: AtomicU32::new(STATE_OPEN),
            origin: AtomicU64::new(region.addr()),
            consumer_cursor: AtomicU64::new(0),
            producer_cursor: AtomicU64::new(0),
            _pad: [0; 16],
        };
        // SAFETY: region is aligned and large enough (checked above).
        unsafe { ptr::write(region.as_ptr() as *mut MailboxHeader, header) };

        for i in 0..slot_count as usize {
            let off = MAILBOX_HEADER_SIZE + i * slot_size as usize;
            // SAFETY: off + slot_size <= required_size, slot_size % 8 == 0.
            unsafe {
                let slot = region.offset(off);
                ptr::write(slot as *mut SlotHeader, SlotHeader::new());
                ptr::write_bytes(slot.add(SLOT_HEADER_SIZE), 0, slot_size as usize - SLOT_HEADER_SIZE);
            }
        }

        Ok(Self { region })
    }

    /// Attach to a mailbox some other party initialized.
    ///
    /// # Safety
    ///
    /// `region` must map a mailbox created by [`Mailbox::init`] (possibly at
    /// another base address) that stays mapped while the view is used.
    pub unsafe fn attach(region: Region) -> Result<Self, MailboxError> {
        Self::check_region(&region, MAILBOX_HEADER_SIZE)?;
        // SAFETY: at least a header's worth of aligned bytes.
        let header = unsafe { region.get::<MailboxHeader>(0) };
        if header.magic != MAILBOX_MAGIC {
            return Err(MailboxError::BadMagic(header.magic));
        }
        if header.version != MAILBOX_VERSION {
            return Err(MailboxError::UnsupportedVersion(header.version));
        }
        Self::check_geometry(header.slot_size, header.slot_count)?;
        Self::check_region(
            &region,
            Self::required_size(header.slot_size, header.slot_count),
        )?;
        Ok(Self { region })
    }

    #[inline]
    pub fn header(&self) -> &MailboxHeader {
        // SAFETY: validated at init/attach.
        unsafe { self.region.get::<MailboxHeader>(0) }
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    pub fn slot_size(&self) -> u32 {
        self.header().slot_size
    }

    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.header().slot_count
    }

    /// Cursor range covered by one lap of the ring, in bytes.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.slot_size() as u64 * self.slot_count() as u64
    }

    /// Bytes of data each slot offers after its header.
    #[inline]
    pub fn data_capacity(&self) -> usize {
        self.slot_size() as usize - SLOT_HEADER_SIZE
    }

    /// Slot `index`. Panics if out of range.
    pub fn slot(&self, index: u32) -> Slot<'_> {
        assert!(index < self.slot_count(), "slot index out of range");
        let off = MAILBOX_HEADER_SIZE + index as usize * self.slot_size() as usize;
        // SAFETY: every slot was initialized with a SlotHeader and is in range.
        let header = unsafe { self.region.get::<SlotHeader>(off) };
        Slot {
            header,
            data: self.region.offset(off + SLOT_HEADER_SIZE),
            data_len: self.data_capacity(),
            index,
        }
    }

    /// Slot addressed by a cursor value.
    #[inline]
    pub fn slot_at(&self, cursor: u64) -> Slot<'_> {
        self.slot(self.index_of(cursor))
    }

    #[inline]
    pub fn index_of(&self, cursor: u64) -> u32 {
        ((cursor % self.capacity()) / self.slot_size() as u64) as u32
    }

    /// The base address recorded by the mailbox creator.
    #[inline]
    pub fn origin(&self) -> u64 {
        self.header().origin.load(Ordering::Relaxed)
    }

    /// Reserve the next stride of the ring. Returns the cursor that names the
    /// caller's slot.
    #[inline]
    pub fn reserve_cursor(&self) -> u64 {
        self.header()
            .producer_cursor
            .fetch_add(self.slot_size() as u64, Ordering::AcqRel)
    }

    #[inline]
    pub fn producer_cursor(&self) -> u64 {
        self.header().producer_cursor.load(Ordering::Acquire)
    }

    #[inline]
    pub fn consumer_cursor(&self) -> u64 {
        self.header().consumer_cursor.load(Ordering::Acquire)
    }

    /// Whether the ring has lapped far enough for `cursor` to use its slot:
    /// the consumer must have moved past the cursor one lap earlier.
    #[inline]
    pub fn is_in_lap(&self, cursor: u64) -> bool {
        cursor.saturating_sub(self.consumer_cursor()) < self.capacity()
    }

    /// Consumer: move past the slot just serviced. Returns the new cursor.
    #[inline]
    pub fn advance_consumer(&self) -> u64 {
        let stride = self.slot_size() as u64;
        self.header()
            .consumer_cursor
            .fetch_add(stride, Ordering::AcqRel)
            + stride
    }

    pub fn status(&self) -> MailboxStatus {
        match self.header().state.load(Ordering::Acquire) {
            STATE_OPEN => MailboxStatus::Open,
            _ => MailboxStatus::Closed,
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.status() == MailboxStatus::Closed
    }

    /// Mark the mailbox closed. Producers waiting on it give up.
    pub fn close(&self) {
        self.header().state.store(STATE_CLOSED, Ordering::Release);
    }
}

/// One slot of a mailbox: its header and its data area.
#[derive(Debug, Clone, Copy)]
pub struct Slot<'a> {
    pub header: &'a SlotHeader,
    data: *mut u8,
    data_len: usize,
    index: u32,
}

impl Slot<'_> {
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Address of the data area in the current address space.
    #[inline]
    pub fn data_addr(&self) -> u64 {
        self.data as usize as u64
    }

    #[inline]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// The data area, mutably.
    ///
    /// # Safety
    ///
    /// The caller must own the slot (`COMPOSING` for a producer, `CLAIMED`
    /// for the consumer, `COMPLETE` for the waiting producer) and must not
    /// create another reference to the data while this one lives.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.data, self.data_len) }
    }

    /// The data area.
    ///
    /// # Safety
    ///
    /// The caller must own the slot as for [`Slot::data_mut`].
    pub unsafe fn data(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data, self.data_len) }
    }
}
