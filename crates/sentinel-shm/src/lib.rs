//! Shared-memory mailbox primitives.
//!
//! This crate holds the pieces of the sentinel transport that live *inside*
//! the shared segment and must be usable from a restricted execution context:
//! it is `no_std` and performs no operating-system calls.
//!
//! # Primitives
//!
//! - [`SlotHeader`] / [`SlotStatus`]: the per-slot handshake word
//!   (`FREE → COMPOSING → POSTED → CLAIMED → COMPLETE | FREE`)
//! - [`Mailbox`]: a fixed-stride ring of slots addressed by monotonic byte
//!   cursors
//! - [`RelocPtr`] / [`Relocation`]: pointers tagged with the address space
//!   they are valid in, and the fixed offset that moves them across a channel
//!
//! # Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ MailboxHeader (64 bytes)                                 │
//! │   magic, version, slot_size, slot_count, state, origin,  │
//! │   consumer_cursor, producer_cursor                       │
//! ├──────────────────────────────────────────────────────────┤
//! │ Slot 0: SlotHeader (24 bytes) | data (slot_size - 24)    │
//! │ Slot 1: ...                                              │
//! │ Slot N-1                                                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model-check the slot handshake.
//!
//! ```text
//! cargo test -p sentinel-shm --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod mailbox;
pub mod region;
pub mod reloc;
pub mod slot;
pub mod sync;

pub use mailbox::{
    MAILBOX_HEADER_SIZE, MAILBOX_MAGIC, MIN_SLOT_SIZE, Mailbox, MailboxError, MailboxHeader,
    MailboxStatus, Slot,
};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
pub use reloc::{AddressSpace, RelocError, RelocPtr, Relocation};
pub use slot::{SLOT_HEADER_SIZE, SLOT_MAGIC, SlotError, SlotHeader, SlotStatus};
pub use sync::Backoff;

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
