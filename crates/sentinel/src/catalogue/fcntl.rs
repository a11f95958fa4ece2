//! fcntl / sys-stat calls.

use std::ffi::CStr;
use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};

use sentinel_shm::{AddressSpace, RelocPtr};

use super::{catalogue_record, opcode, path_arg, rc_of};
use crate::error::CallError;
use crate::executor::{Call, Disposition};
use crate::message::{Envelope, Outgoing, Plain};
use crate::packer::{PackError, Packer};
use crate::window::SlotWindow;

pub const STAT: u32 = opcode::FCNTL + 3;
pub const CHMOD: u32 = opcode::FCNTL + 7;
pub const MKDIR: u32 = opcode::FCNTL + 8;

/// What [`Stat`] reports about a path.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub is_dir: u32,
}

unsafe impl Plain for FileStat {}

/// Stat a path. The host packs a [`FileStat`] behind the record and points
/// `out` at it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    envelope: Envelope,
    path: RelocPtr,
    out: RelocPtr,
    /// Nonzero to follow a final symlink.
    pub follow: u32,
    pub rc: i32,
}

impl Stat {
    pub fn new(path: &CStr, follow: bool) -> Outgoing<'_, Self> {
        // SAFETY: the record borrows `path` for the returned lifetime.
        unsafe {
            Outgoing::borrowed(Self {
                envelope: Envelope::for_message::<Self>(true),
                path: RelocPtr::local(path.as_ptr()),
                out: RelocPtr::null(AddressSpace::Local),
                follow: follow as u32,
                rc: 0,
            })
        }
    }

    fn pack_args(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        // SAFETY: constructed from a borrowed CStr.
        self.path = unsafe { packer.copy_cstr(self.path) }?;
        self.out = RelocPtr::null(packer.relocation().to());
        Ok(())
    }

    /// The packed reply, if the call succeeded.
    pub fn read_stat(&self, window: &SlotWindow<'_>) -> Result<Option<FileStat>, CallError> {
        if self.rc != 0 || self.out.is_null() {
            return Ok(None);
        }
        window.read(self.out).map(Some)
    }
}

catalogue_record!(Stat, STAT);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Chmod {
    envelope: Envelope,
    path: RelocPtr,
    pub mode: u32,
    pub rc: i32,
}

impl Chmod {
    pub fn new(path: &CStr, mode: u32) -> Outgoing<'_, Self> {
        // SAFETY: as for Stat::new.
        unsafe {
            Outgoing::borrowed(Self {
                envelope: Envelope::for_message::<Self>(true),
                path: RelocPtr::local(path.as_ptr()),
                mode,
                rc: 0,
            })
        }
    }

    fn pack_args(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        // SAFETY: constructed from a borrowed CStr.
        self.path = unsafe { packer.copy_cstr(self.path) }?;
        Ok(())
    }
}

catalogue_record!(Chmod, CHMOD);

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Mkdir {
    envelope: Envelope,
    path: RelocPtr,
    pub mode: u32,
    pub rc: i32,
}

impl Mkdir {
    pub fn new(path: &CStr, mode: u32) -> Outgoing<'_, Self> {
        // SAFETY: as for Stat::new.
        unsafe {
            Outgoing::borrowed(Self {
                envelope: Envelope::for_message::<Self>(true),
                path: RelocPtr::local(path.as_ptr()),
                mode,
                rc: 0,
            })
        }
    }

    fn pack_args(&mut self, packer: &mut Packer<'_>) -> Result<(), PackError> {
        // SAFETY: constructed from a borrowed CStr.
        self.path = unsafe { packer.copy_cstr(self.path) }?;
        Ok(())
    }
}

catalogue_record!(Mkdir, MKDIR);

// =============================================================================
// Host side
// =============================================================================

pub(super) fn serve_stat(call: &mut Call<'_>) -> Result<Disposition, CallError> {
    let mut msg: Stat = call.read()?;
    let path = path_arg(call, msg.path)?;
    let meta = if msg.follow != 0 {
        fs::metadata(path)
    } else {
        fs::symlink_metadata(path)
    };
    match meta {
        Ok(meta) => {
            let stat = FileStat {
                size: meta.len(),
                mode: meta.mode(),
                is_dir: meta.is_dir() as u32,
            };
            Ok(Disposition::reply(move |packer| {
                let mut msg: Stat = packer.record()?;
                msg.out = packer.push(&stat)?;
                msg.rc = 0;
                packer.set_record(&msg)
            }))
        }
        Err(e) => {
            msg.rc = rc_of::<()>(Err(e));
            call.write(&msg);
            Ok(Disposition::Done)
        }
    }
}

pub(super) fn serve_chmod(call: &mut Call<'_>) -> Result<Disposition, CallError> {
    let mut msg: Chmod = call.read()?;
    let path = path_arg(call, msg.path)?;
    msg.rc = rc_of(fs::set_permissions(path, Permissions::from_mode(msg.mode)));
    call.write(&msg);
    Ok(Disposition::Done)
}

pub(super) fn serve_mkdir(call: &mut Call<'_>) -> Result<Disposition, CallError> {
    let mut msg: Mkdir = call.read()?;
    let path = path_arg(call, msg.path)?;
    msg.rc = rc_of(DirBuilder::new().mode(msg.mode).create(path));
    call.write(&msg);
    Ok(Disposition::Done)
}
