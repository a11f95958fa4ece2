//! stdio calls.

use std::ffi::CStr;
use std::fs;
use std::io::{self, Write};

use sentinel_shm::RelocPtr;

use super::{catalogue_record, opcode, path_arg, rc_of};
use crate::error::CallError;
use crate::executor::{Call, Disposition};
use crate::message::{Envelope, Outgoing};
use crate::packer::{PackError, Packer};

pub const REMOVE: u32 = opcode::STDIO;
pub const RENAME: u32 = opcode::STDIO + 1;
pub const UNLINK: u32 = opcode::STDIO + 2;
pub const FPUTS: u32 = opcode::STDIO + 10;

/// `fputs` stream numbers.
pub const STDOUT: u32 = 1;
pub const STDERR: u32 = 2;

/// Remove a file or an empty directory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Remove {
    envelope: Envelope,
    path: RelocPtr,
    pub rc: i32,
    _reserved: u32,
}

impl Remove {
    pub fn new(path: &CStr) -> Outgoing<'_, Self> {
        // SAFETY: the record borrows `path` for the returned lifetime.
        unsafe {
            Outgoing::borrowed(Self {
                envelope: Envelope::for_message::<Self>(true),
                path: RelocPtr::local(path.as_ptr()),
                rc: 0,
                _reserved: 0,
            })
        }
    }

    fn pack_args(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        // SAFETY: constructed from a borrowed CStr.
        self.path = unsafe { packer.copy_cstr(self.path) }?;
        Ok(())
    }
}

catalogue_record!(Remove, REMOVE);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Rename {
    envelope: Envelope,
    from: RelocPtr,
    to: RelocPtr,
    pub rc: i32,
    _reserved: u32,
}

impl Rename {
    pub fn new<'a>(from: &'a CStr, to: &'a CStr) -> Outgoing<'a, Self> {
        // SAFETY: as for Remove::new.
        unsafe {
            Outgoing::borrowed(Self {
                envelope: Envelope::for_message::<Self>(true),
                from: RelocPtr::local(from.as_ptr()),
                to: RelocPtr::local(to.as_ptr()),
                rc: 0,
                _reserved: 0,
            })
        }
    }

    fn pack_args(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        // SAFETY: constructed from borrowed CStrs.
        [self.from, self.to] = unsafe { packer.copy_cstrs([self.from, self.to]) }?;
        Ok(())
    }
}

catalogue_record!(Rename, RENAME);

/// Remove a file.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Unlink {
    envelope: Envelope,
    path: RelocPtr,
    pub rc: i32,
    _reserved: u32,
}

impl Unlink {
    pub fn new(path: &CStr) -> Outgoing<'_, Self> {
        // SAFETY: as for Remove::new.
        unsafe {
            Outgoing::borrowed(Self {
                envelope: Envelope::for_message::<Self>(true),
                path: RelocPtr::local(path.as_ptr()),
                rc: 0,
                _reserved: 0,
            })
        }
    }

    fn pack_args(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        // SAFETY: constructed from a borrowed CStr.
        self.path = unsafe { packer.copy_cstr(self.path) }?;
        Ok(())
    }
}

catalogue_record!(Unlink, UNLINK);

/// Write a string to the host's stdout or stderr.
///
/// Post it with [`crate::Producer::post`] to not wait for the write.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Fputs {
    envelope: Envelope,
    text: RelocPtr,
    pub stream: u32,
    pub rc: i32,
}

impl Fputs {
    pub fn new(text: &CStr, stream: u32) -> Outgoing<'_, Self> {
        // SAFETY: as for Remove::new.
        unsafe {
            Outgoing::borrowed(Self {
                envelope: Envelope::for_message::<Self>(true),
                text: RelocPtr::local(text.as_ptr()),
                stream,
                rc: 0,
            })
        }
    }

    fn pack_args(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        // SAFETY: constructed from a borrowed CStr.
        self.text = unsafe { packer.copy_cstr(self.text) }?;
        Ok(())
    }
}

catalogue_record!(Fputs, FPUTS);

// =============================================================================
// Host side
// =============================================================================

fn remove_any(path: &std::path::Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}

pub(super) fn serve_remove(call: &mut Call<'_>) -> Result<Disposition, CallError> {
    let mut msg: Remove = call.read()?;
    msg.rc = rc_of(remove_any(path_arg(call, msg.path)?));
    call.write(&msg);
    Ok(Disposition::Done)
}

pub(super) fn serve_rename(call: &mut Call<'_>) -> Result<Disposition, CallError> {
    let mut msg: Rename = call.read()?;
    let from = path_arg(call, msg.from)?;
    let to = path_arg(call, msg.to)?;
    msg.rc = rc_of(fs::rename(from, to));
    call.write(&msg);
    Ok(Disposition::Done)
}

pub(super) fn serve_unlink(call: &mut Call<'_>) -> Result<Disposition, CallError> {
    let mut msg: Unlink = call.read()?;
    msg.rc = rc_of(fs::remove_file(path_arg(call, msg.path)?));
    call.write(&msg);
    Ok(Disposition::Done)
}

pub(super) fn serve_fputs(call: &mut Call<'_>) -> Result<Disposition, CallError> {
    let mut msg: Fputs = call.read()?;
    let text = call.c_str(msg.text)?.to_bytes();
    msg.rc = match msg.stream {
        STDOUT => rc_of(io::stdout().lock().write_all(text)),
        STDERR => rc_of(io::stderr().lock().write_all(text)),
        _ => -libc::EBADF,
    };
    call.write(&msg);
    Ok(Disposition::Done)
}
