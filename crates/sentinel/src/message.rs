//! Message records and their envelope.
//!
//! Every call is a `repr(C)` record that starts with an [`Envelope`]. The
//! record type is the wire format: producer and consumer must be built from
//! the same definitions.

use std::marker::PhantomData;
use std::mem::size_of;

use bitflags::bitflags;
use sentinel_shm::RelocPtr;
use static_assertions::assert_eq_size;

use crate::packer::{PackError, Packer};

bitflags! {
    /// Envelope flags.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnvelopeFlags: u32 {
        /// The producer blocks until the slot is COMPLETE.
        const WAIT = 1 << 0;
        /// Variable-length data follows the record.
        const PACKED = 1 << 1;
        /// Recalled by the producer before it was claimed; retire without
        /// servicing.
        const CANCELLED = 1 << 2;
    }
}

/// Common prefix of every message record (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub opcode: u32,
    pub flags: EnvelopeFlags,
    /// Bytes reserved after the record for packed data.
    pub extra_size: u32,
    _reserved: u32,
}

assert_eq_size!(Envelope, [u8; 16]);

impl Envelope {
    pub const fn new(opcode: u32, flags: EnvelopeFlags, extra_size: u32) -> Self {
        Self {
            opcode,
            flags,
            extra_size,
            _reserved: 0,
        }
    }

    /// An envelope for `M`, blocking or not.
    pub fn for_message<M: Message>(wait: bool) -> Self {
        let mut flags = EnvelopeFlags::empty();
        flags.set(EnvelopeFlags::WAIT, wait);
        flags.set(EnvelopeFlags::PACKED, M::EXTRA_SIZE > 0);
        Self::new(M::OPCODE, flags, M::EXTRA_SIZE as u32)
    }

    #[inline]
    pub fn is_wait(&self) -> bool {
        self.flags.contains(EnvelopeFlags::WAIT)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flags.contains(EnvelopeFlags::CANCELLED)
    }
}

/// Types that can be copied in and out of a slot as raw bytes.
///
/// # Safety
///
/// Every bit pattern of `size_of::<Self>()` bytes must be a valid `Self`,
/// and the type must not contain references or other pointers whose
/// validity Rust relies on (addresses are carried as [`RelocPtr`]).
pub unsafe trait Plain: Copy + 'static {}

macro_rules! plain {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl Plain for $t {})*
    };
}

plain!(u8, u16, u32, u64, i8, i16, i32, i64, usize, isize, RelocPtr, Envelope);

unsafe impl<T: Plain, const N: usize> Plain for [T; N] {}

/// A call record.
///
/// # Safety
///
/// The type must be `repr(C)` with its [`Envelope`] as the first field, and
/// [`Message::envelope`] / [`Message::envelope_mut`] must return that field.
pub unsafe trait Message: Plain + Send {
    const OPCODE: u32;

    /// Bytes reserved after the record for data packed by [`Message::pack`].
    const EXTRA_SIZE: usize = 0;

    fn envelope(&self) -> &Envelope;

    fn envelope_mut(&mut self) -> &mut Envelope;

    /// Copy variable-length arguments into the slot and point the record's
    /// pointer fields at the copies. Runs on the producer, after the slot is
    /// reserved and before it is posted.
    fn pack(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        let _ = packer;
        Ok(())
    }
}

/// Fixed size of a record type, as stored in the slot header's length.
#[inline]
pub const fn record_len<M: Message>() -> usize {
    size_of::<M>()
}

/// A record on its way into a slot.
///
/// The lifetime covers any caller memory the record's [`RelocPtr`] fields
/// point at; it ends once the record has been packed.
pub struct Outgoing<'a, M: Message> {
    record: M,
    _borrow: PhantomData<&'a ()>,
}

impl<M: Message> Outgoing<'static, M> {
    /// A record with no pointers into caller memory.
    pub fn new(record: M) -> Self {
        Self {
            record,
            _borrow: PhantomData,
        }
    }
}

impl<'a, M: Message> Outgoing<'a, M> {
    /// A record whose pointer fields borrow caller memory.
    ///
    /// # Safety
    ///
    /// Every non-null [`AddressSpace::Local`](sentinel_shm::AddressSpace)
    /// pointer in `record` that [`Message::pack`] reads must stay valid for
    /// `'a`.
    pub unsafe fn borrowed(record: M) -> Self {
        Self {
            record,
            _borrow: PhantomData,
        }
    }

    #[inline]
    pub fn record(&self) -> &M {
        &self.record
    }

    pub(crate) fn into_record(self) -> M {
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct Ping {
        envelope: Envelope,
        value: u64,
    }

    unsafe impl Plain for Ping {}

    unsafe impl Message for Ping {
        const OPCODE: u32 = 7;
        const EXTRA_SIZE: usize = 64;

        fn envelope(&self) -> &Envelope {
            &self.envelope
        }

        fn envelope_mut(&mut self) -> &mut Envelope {
            &mut self.envelope
        }
    }

    #[test]
    fn envelope_reflects_message_type() {
        let env = Envelope::for_message::<Ping>(true);
        assert_eq!(env.opcode, 7);
        assert_eq!(env.extra_size, 64);
        assert!(env.is_wait());
        assert!(env.flags.contains(EnvelopeFlags::PACKED));
        assert!(!env.is_cancelled());

        let env = Envelope::for_message::<Ping>(false);
        assert!(!env.is_wait());
        assert_eq!(record_len::<Ping>(), 24);
    }
}
