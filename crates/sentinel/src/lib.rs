//! Sentinel: a shared-memory mailbox transport for proxying calls from a
//! device (or another process) to host code.
//!
//! A producer composes a fixed-layout record in a mailbox slot, packs any
//! strings or buffers behind it, rewrites its pointers into the host's
//! address space, and posts it. A host thread per channel claims slots in
//! order, runs them through a chain of [`Executor`]s, and either marks them
//! complete for a waiting producer or frees them.
//!
//! ```text
//!   producer                       mailbox                        consumer
//!   ────────                       ───────                        ────────
//!   reserve cursor ──► FREE ──► COMPOSING
//!   pack + relocate                 │
//!   post ──────────────────────► POSTED ──────────────────────► claim
//!                                   │                             dispatch
//!                        COMPLETE ◄─┴─► FREE  ◄──────────────── finish
//!   read result, release ──► FREE
//! ```
//!
//! The ring primitives live in the `sentinel-shm` crate; this crate adds the
//! OS mappings, channels, dispatch, and a small catalogue of file calls.

pub mod catalogue;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod fault;
pub mod manager;
pub mod mapping;
pub mod message;
pub mod metrics;
pub mod packer;
pub mod window;

pub use channel::{Channel, ChannelKind, PendingCall, Producer};
pub use config::{MAX_DEVICE_CHANNELS, SentinelConfig, WaitPolicy};
pub use error::{CallError, SentinelError};
pub use executor::{
    BASE_EXECUTOR, Call, Dispatched, Disposition, Executor, ExecutorChain, Handler, Placement,
};
pub use fault::{FAULT_EXIT_CODE, FatalPolicy, Fault};
pub use manager::{ChainSide, Sentinel, SentinelClient};
pub use mapping::{PinnedMapping, SharedMapping};
pub use message::{Envelope, EnvelopeFlags, Message, Outgoing, Plain, record_len};
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use packer::{PackError, Packer};
pub use window::SlotWindow;

pub use sentinel_shm::{
    AddressSpace, Mailbox, MailboxError, MailboxStatus, RelocError, RelocPtr, Relocation,
    SlotStatus,
};
