//! Error types.

use std::fmt;
use std::io;
use std::time::Duration;

use sentinel_shm::{MailboxError, RelocError};

use crate::channel::ChannelKind;

/// Errors from setting up, attaching to, or calling through a sentinel.
#[derive(Debug)]
pub enum SentinelError {
    /// I/O error while creating or mapping shared memory.
    Io(io::Error),
    /// The mailbox could not be laid out or attached.
    Layout(MailboxError),
    /// Invalid configuration.
    Config(String),
    /// The channel was shut down; no consumer will service the call.
    ChannelClosed,
    /// The call was not claimed within the configured wait timeout.
    Timeout { waited: Duration },
    /// The consumer's reply failed validation.
    Reply(CallError),
    /// A channel could not be created; everything created before it has
    /// been torn down.
    Init {
        channel: ChannelKind,
        source: Box<SentinelError>,
    },
}

impl fmt::Display for SentinelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Layout(e) => write!(f, "layout error: {}", e),
            Self::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Self::ChannelClosed => write!(f, "channel closed"),
            Self::Timeout { waited } => {
                write!(f, "call not claimed after {:?}", waited)
            }
            Self::Reply(e) => write!(f, "bad reply: {}", e),
            Self::Init { channel, source } => {
                write!(f, "failed to start {} channel: {}", channel, source)
            }
        }
    }
}

impl std::error::Error for SentinelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Layout(e) => Some(e),
            Self::Reply(e) => Some(e),
            Self::Init { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for SentinelError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<MailboxError> for SentinelError {
    fn from(e: MailboxError) -> Self {
        Self::Layout(e)
    }
}

/// A record or pointer in a slot that does not hold up to validation.
///
/// On the consumer side these are fatal ([`crate::Fault::Malformed`]); on the
/// producer side they surface as [`SentinelError::Reply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The record was read as the wrong message type.
    OpcodeMismatch { expected: u32, found: u32 },
    /// The slot's recorded length is shorter than the record type.
    RecordTooShort { needed: usize, length: usize },
    /// A pointer field points outside the slot's data area.
    OutOfWindow { addr: u64, len: usize },
    NullPointer,
    WrongSpace(RelocError),
    /// A C string runs to the end of the data area without a NUL.
    Unterminated { addr: u64 },
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpcodeMismatch { expected, found } => {
                write!(f, "record has opcode {}, expected {}", found, expected)
            }
            Self::RecordTooShort { needed, length } => {
                write!(f, "record is {} bytes, need {}", length, needed)
            }
            Self::OutOfWindow { addr, len } => {
                write!(f, "pointer {:#x}+{} is outside the slot", addr, len)
            }
            Self::NullPointer => write!(f, "unexpected null pointer"),
            Self::WrongSpace(e) => write!(f, "{}", e),
            Self::Unterminated { addr } => {
                write!(f, "string at {:#x} is not NUL-terminated", addr)
            }
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::WrongSpace(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RelocError> for CallError {
    fn from(e: RelocError) -> Self {
        Self::WrongSpace(e)
    }
}
