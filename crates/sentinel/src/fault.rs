//! Fatal transport faults.
//!
//! A mailbox that fails its own consistency checks cannot be recovered: the
//! two sides no longer agree on what is in shared memory, and any further
//! traffic would be misread. Faults are logged and then end the process
//! according to the configured [`FatalPolicy`].

use std::fmt;
use std::str::FromStr;

use crate::channel::ChannelKind;
use crate::error::CallError;
use crate::packer::PackError;

/// Exit status used by [`FatalPolicy::Exit`].
pub const FAULT_EXIT_CODE: i32 = 1;

/// Faults that end the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// A non-free slot does not carry the slot magic.
    BadMagic {
        channel: ChannelKind,
        slot: u32,
        found: u32,
    },
    /// A posted slot names an address space nobody produces from.
    UnknownSpace {
        channel: ChannelKind,
        slot: u32,
        found: u32,
    },
    /// A message or its payload does not fit in one slot.
    MessageTooLong {
        channel: ChannelKind,
        opcode: u32,
        needed: usize,
        available: usize,
    },
    /// A posted record does not hold up to validation.
    Malformed {
        channel: ChannelKind,
        opcode: u32,
        error: CallError,
    },
}

impl Fault {
    pub(crate) fn from_pack(channel: ChannelKind, opcode: u32, err: PackError) -> Self {
        match err {
            PackError::TooLong { needed, available } => Self::MessageTooLong {
                channel,
                opcode,
                needed,
                available,
            },
            PackError::Reloc(e) => Self::Malformed {
                channel,
                opcode,
                error: e.into(),
            },
            PackError::RecordTooShort { needed, length } => Self::Malformed {
                channel,
                opcode,
                error: CallError::RecordTooShort { needed, length },
            },
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic {
                channel,
                slot,
                found,
            } => write!(
                f,
                "bad sentinel magic {:#010x} in {} slot {}",
                found, channel, slot
            ),
            Self::UnknownSpace {
                channel,
                slot,
                found,
            } => write!(
                f,
                "unknown producer address space {} in {} slot {}",
                found, channel, slot
            ),
            Self::MessageTooLong {
                channel,
                opcode,
                needed,
                available,
            } => write!(
                f,
                "message too long: opcode {} on {} needs {} bytes, slot has {}",
                opcode, channel, needed, available
            ),
            Self::Malformed {
                channel,
                opcode,
                error,
            } => write!(
                f,
                "malformed message: opcode {} on {}: {}",
                opcode, channel, error
            ),
        }
    }
}

impl std::error::Error for Fault {}

/// What to do after logging a [`Fault`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FatalPolicy {
    /// `process::exit(1)`.
    #[default]
    Exit,
    /// `process::abort()`, for a core dump.
    Abort,
    /// Panic the faulting thread. Only useful when something above catches
    /// it; the mailbox is not usable afterwards.
    Panic,
}

impl FromStr for FatalPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exit" => Ok(Self::Exit),
            "abort" => Ok(Self::Abort),
            "panic" => Ok(Self::Panic),
            other => Err(format!(
                "unknown fatal policy {:?} (expected exit, abort or panic)",
                other
            )),
        }
    }
}

/// Log `fault` and end the process (or thread) per `policy`.
#[cold]
pub fn raise(fault: Fault, policy: FatalPolicy) -> ! {
    tracing::error!(%fault, ?policy, "sentinel fault");
    match policy {
        FatalPolicy::Exit => std::process::exit(FAULT_EXIT_CODE),
        FatalPolicy::Abort => std::process::abort(),
        FatalPolicy::Panic => panic!("sentinel fault: {}", fault),
    }
}
