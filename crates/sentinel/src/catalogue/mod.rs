//! A representative set of proxied calls.
//!
//! Each record carries its string arguments packed behind it, so the host
//! never reads caller memory directly. [`file_executor`] services all of
//! them against the host filesystem.

use std::ffi::OsStr;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use sentinel_shm::RelocPtr;

use crate::error::CallError;
use crate::executor::{Call, Executor};
use crate::message::Message;

/// First opcode of each subsystem.
pub mod opcode {
    pub const STDIO: u32 = 1;
    pub const FCNTL: u32 = 46;
}

/// Bytes reserved behind every catalogue record for its strings.
pub const EXTRA_SIZE: usize = 1024;

/// Name of the executor returned by [`file_executor`].
pub const FILE_EXECUTOR: &str = "file";

/// Plain + Message impls for a catalogue record. The type provides
/// `pack_args` and an `envelope` field.
macro_rules! catalogue_record {
    ($name:ident, $opcode:expr) => {
        unsafe impl $crate::message::Plain for $name {}

        unsafe impl $crate::message::Message for $name {
            const OPCODE: u32 = $opcode;
            const EXTRA_SIZE: usize = $crate::catalogue::EXTRA_SIZE;

            fn envelope(&self) -> &$crate::message::Envelope {
                &self.envelope
            }

            fn envelope_mut(&mut self) -> &mut $crate::message::Envelope {
                &mut self.envelope
            }

            fn pack(
                &mut self,
                packer: &mut $crate::packer::Packer<'_>,
            ) -> Result<(), $crate::packer::PackError> {
                self.pack_args(packer)
            }
        }
    };
}
pub(crate) use catalogue_record;

pub mod fcntl;
pub mod stdio;

/// Executor servicing every catalogue opcode with `std::fs`.
pub fn file_executor() -> Executor {
    Executor::new(FILE_EXECUTOR)
        .on(stdio::Remove::OPCODE, stdio::serve_remove)
        .on(stdio::Rename::OPCODE, stdio::serve_rename)
        .on(stdio::Unlink::OPCODE, stdio::serve_unlink)
        .on(stdio::Fputs::OPCODE, stdio::serve_fputs)
        .on(fcntl::Stat::OPCODE, fcntl::serve_stat)
        .on(fcntl::Chmod::OPCODE, fcntl::serve_chmod)
        .on(fcntl::Mkdir::OPCODE, fcntl::serve_mkdir)
}

/// `0`, or the negated OS error code.
pub(crate) fn rc_of<T>(result: io::Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
    }
}

pub(crate) fn path_arg<'c>(call: &'c Call<'_>, ptr: RelocPtr) -> Result<&'c Path, CallError> {
    let s = call.c_str(ptr)?;
    Ok(Path::new(OsStr::from_bytes(s.to_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_is_negated_errno() {
        assert_eq!(rc_of(Ok(())), 0);
        assert_eq!(rc_of::<()>(Err(io::Error::from_raw_os_error(libc::ENOENT))), -libc::ENOENT);
        assert_eq!(rc_of::<()>(Err(io::Error::other("no code"))), -libc::EIO);
    }

    #[test]
    fn file_executor_covers_catalogue() {
        let exec = file_executor();
        assert_eq!(exec.name(), FILE_EXECUTOR);
        assert_eq!(exec.opcodes(), vec![1, 2, 3, 11, 49, 53, 54]);
        assert!(!exec.handles(opcode::FCNTL));
    }
}
