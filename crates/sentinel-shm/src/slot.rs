//! Per-slot handshake.
//!
//! Every slot starts with a [`SlotHeader`]. The `status` word is the only
//! synchronization between the producer that composes a message and the
//! consumer that services it:
//!
//! ```text
//!            producer                consumer               producer
//! FREE ──CAS──▶ COMPOSING ──store──▶ POSTED ──CAS──▶ CLAIMED ─┬─▶ COMPLETE ──CAS──▶ FREE
//!                                                            └─▶ FREE   (fire-and-forget)
//! ```
//!
//! `POSTED` is published with `Release` after the record, payload, magic,
//! length and producer relocation are written; the consumer's `Acquire` claim makes all of them
//! visible. The same pairing carries the result back through `COMPLETE`.

use core::fmt;
use core::mem::size_of;

use crate::reloc::{AddressSpace, Relocation};
use crate::sync::{AtomicU32, AtomicU64, Ordering};

/// Stamped into every posted slot; anything else on a non-free slot means the
/// two sides disagree about the ring layout.
pub const SLOT_MAGIC: u32 = 0x5345_4E54;

/// Bytes taken by [`SlotHeader`] at the start of a slot, rounded up to 8;
/// slot data starts this many bytes in.
pub const SLOT_HEADER_SIZE: usize = size_of::<SlotHeader>().next_multiple_of(8);

/// Slot status values as stored in shared memory.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    /// Unowned; the next producer to reach this slot may take it.
    Free = 0,
    /// Owned by a producer that is still writing.
    Composing = 1,
    /// Fully written; waiting for the consumer.
    Posted = 2,
    /// Owned by the consumer while the call runs.
    Claimed = 3,
    /// Result written; owned by the blocked producer until it releases.
    Complete = 4,
}

impl SlotStatus {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Free,
            1 => Self::Composing,
            2 => Self::Posted,
            3 => Self::Claimed,
            4 => Self::Complete,
            _ => return None,
        })
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "FREE",
            Self::Composing => "COMPOSING",
            Self::Posted => "POSTED",
            Self::Claimed => "CLAIMED",
            Self::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

/// Errors from slot transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// The slot does not carry [`SLOT_MAGIC`].
    BadMagic { found: u32 },
    /// A transition was attempted from the wrong state.
    InvalidState { expected: SlotStatus, actual: u32 },
    /// The producer's address space tag is not a known space.
    UnknownSpace { found: u32 },
}

impl fmt::Display for SlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => {
                write!(f, "bad slot magic {found:#010x} (expected {SLOT_MAGIC:#010x})")
            }
            Self::InvalidState { expected, actual } => match SlotStatus::from_u32(*actual) {
                Some(actual) => write!(f, "slot is {actual}, expected {expected}"),
                None => write!(f, "slot has unknown status {actual}, expected {expected}"),
            },
            Self::UnknownSpace { found } => write!(f, "slot has unknown address space {found}"),
        }
    }
}

impl core::error::Error for SlotError {}

/// Header at the start of every slot (24 bytes).
///
/// Besides the handshake words it records where the posting producer's
/// pointers live, since producers with different views of the mailbox can
/// share one ring.
#[repr(C, align(8))]
pub struct SlotHeader {
    /// [`SLOT_MAGIC`] while the slot holds a message.
    pub magic: AtomicU32,
    /// A [`SlotStatus`] value.
    pub status: AtomicU32,
    /// Bytes of the data area used by the fixed record.
    pub length: AtomicU32,
    /// [`AddressSpace`] the producer packed pointers in.
    pub space: AtomicU32,
    /// Added to a producer-view address to get the host-view address.
    pub offset: AtomicU64,
}

#[cfg(not(feature = "loom"))]
const _: () = assert!(SLOT_HEADER_SIZE == 24);

impl SlotHeader {
    pub fn new() -> Self {
        Self {
            magic: AtomicU32::new(0),
            status: AtomicU32::new(SlotStatus::Free as u32),
            length: AtomicU32::new(0),
            space: AtomicU32::new(AddressSpace::Local as u32),
            offset: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn status_raw(&self) -> u32 {
        self.status.load(Ordering::Acquire)
    }

    #[inline]
    pub fn status(&self) -> Option<SlotStatus> {
        SlotStatus::from_u32(self.status_raw())
    }

    #[inline]
    pub fn magic(&self) -> u32 {
        self.magic.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn length(&self) -> u32 {
        self.length.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn space_raw(&self) -> u32 {
        self.space.load(Ordering::Relaxed)
    }

    #[inline]
    fn transition(&self, from: SlotStatus, to: SlotStatus) -> Result<(), SlotError> {
        self.status
            .compare_exchange(
                from as u32,
                to as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|actual| SlotError::InvalidState {
                expected: from,
                actual,
            })
    }

    /// Producer: take a free slot for writing (`FREE → COMPOSING`).
    #[inline]
    pub fn try_reserve(&self) -> Result<(), SlotError> {
        self.transition(SlotStatus::Free, SlotStatus::Composing)
    }

    /// Producer: publish a fully written slot (`COMPOSING → POSTED`).
    ///
    /// `relocation` takes the producer's view to the host view; the consumer
    /// reads it back with [`SlotHeader::relocation`].
    pub fn post(&self, length: u32, relocation: Relocation) {
        debug_assert_eq!(self.status_raw(), SlotStatus::Composing as u32);
        self.magic.store(SLOT_MAGIC, Ordering::Relaxed);
        self.length.store(length, Ordering::Relaxed);
        self.space.store(relocation.from() as u32, Ordering::Relaxed);
        self.offset.store(relocation.offset() as u64, Ordering::Relaxed);
        self.status.store(SlotStatus::Posted as u32, Ordering::Release);
    }

    /// The posting producer's view to the host view.
    ///
    /// Only meaningful once the slot has been claimed.
    pub fn relocation(&self) -> Result<Relocation, SlotError> {
        let raw = self.space_raw();
        let space = AddressSpace::from_u32(raw).ok_or(SlotError::UnknownSpace { found: raw })?;
        let offset = self.offset.load(Ordering::Relaxed) as i64;
        Ok(Relocation::new(offset, space, AddressSpace::Host))
    }

    /// Producer: take back a posted slot the consumer has not claimed yet
    /// (`POSTED → COMPOSING`), so it can be rewritten and posted again.
    /// Returns `false` if the consumer got there first.
    ///
    /// The slot is never handed straight back to `FREE`: the consumer is
    /// already parked on it by cursor and would wait forever.
    #[inline]
    pub fn recall(&self) -> bool {
        self.transition(SlotStatus::Posted, SlotStatus::Composing)
            .is_ok()
    }

    /// Consumer: claim a posted slot (`POSTED → CLAIMED`).
    #[inline]
    pub fn try_claim(&self) -> Result<(), SlotError> {
        self.transition(SlotStatus::Posted, SlotStatus::Claimed)
    }

    /// Check the magic of a non-free slot and return the record length.
    pub fn verify(&self) -> Result<u32, SlotError> {
        let found = self.magic();
        if found != SLOT_MAGIC {
            return Err(SlotError::BadMagic { found });
        }
        Ok(self.length())
    }

    /// Consumer: hand the slot back after service.
    ///
    /// Blocking messages go to `COMPLETE` for the producer to collect;
    /// fire-and-forget messages go straight to `FREE`.
    pub fn finish(&self, wait: bool) -> SlotStatus {
        debug_assert_eq!(self.status_raw(), SlotStatus::Claimed as u32);
        let next = if wait {
            SlotStatus::Complete
        } else {
            SlotStatus::Free
        };
        self.status.store(next as u32, Ordering::Release);
        next
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.status_raw() == SlotStatus::Complete as u32
    }

    /// Producer: release a completed slot back to the ring (`COMPLETE → FREE`).
    #[inline]
    pub fn release(&self) -> Result<(), SlotError> {
        self.transition(SlotStatus::Complete, SlotStatus::Free)
    }
}

impl Default for SlotHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SlotHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotHeader")
            .field("magic", &format_args!("{:#010x}", self.magic()))
            .field("status", &self.status())
            .field("length", &self.length())
            .field("space", &self.space_raw())
            .field("offset", &(self.offset.load(Ordering::Relaxed) as i64))
            .finish()
    }
}
