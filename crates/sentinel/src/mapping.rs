//! Shared memory backing for channels.
//!
//! - [`SharedMapping`]: a named file in the shm directory, mapped `MAP_SHARED`.
//!   The host channel lives here so client processes can attach by name.
//! - [`PinnedMapping`]: one anonymous (unlinked) file mapped twice, giving a
//!   host view and a device view of the same bytes at different addresses.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sentinel_shm::Region;

/// Alignment of the ring base inside a mapping, and the padding reserved
/// for reaching it.
pub const RING_ALIGN: usize = 4096;

fn map_shared(file: &File, size: usize) -> io::Result<*mut u8> {
    // SAFETY: mapping a file we hold open; the result is checked.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(addr as *mut u8)
}

fn unmap(base: *mut u8, size: usize) {
    // SAFETY: base/size came from a successful map_shared.
    unsafe {
        libc::munmap(base as *mut libc::c_void, size);
    }
}

/// The first `RING_ALIGN`-aligned `ring_size` bytes of a mapping.
fn ring_in(base: *mut u8, size: usize, ring_size: usize) -> io::Result<Region> {
    // SAFETY: base..base+size is mapped.
    let whole = unsafe { Region::from_raw(base, size) };
    whole
        .align_up(RING_ALIGN)
        .and_then(|r| r.slice(0, ring_size))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("mapping of {} bytes cannot hold a {} byte ring", size, ring_size),
            )
        })
}

/// A named shared file mapping.
pub struct SharedMapping {
    base: *mut u8,
    size: usize,
    path: PathBuf,
    /// The creator unlinks the file on drop.
    owner: bool,
    _file: File,
}

// SAFETY: the mapping is only accessed through atomics and slot ownership.
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    fn path_for(dir: &Path, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains('/') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid mapping name {:?}", name),
            ));
        }
        Ok(dir.join(name))
    }

    /// Create (or replace) `dir/name`, sized for a `ring_size` ring plus
    /// alignment padding.
    pub fn create(dir: &Path, name: &str, ring_size: usize) -> io::Result<Self> {
        let path = Self::path_for(dir, name)?;
        let size = ring_size + RING_ALIGN;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size as u64)?;

        let base = match map_shared(&file, size) {
            Ok(base) => base,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e);
            }
        };
        tracing::debug!(path = %path.display(), size, "created shared mapping");

        Ok(Self {
            base,
            size,
            path,
            owner: true,
            _file: file,
        })
    }

    /// Map an existing `dir/name`.
    pub fn open(dir: &Path, name: &str) -> io::Result<Self> {
        let path = Self::path_for(dir, name)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as usize;
        if size <= RING_ALIGN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is too small for a sentinel mapping", path.display()),
            ));
        }
        let base = map_shared(&file, size)?;
        tracing::debug!(path = %path.display(), size, "opened shared mapping");

        Ok(Self {
            base,
            size,
            path,
            owner: false,
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The aligned ring area: everything from the first aligned address.
    pub fn ring(&self) -> io::Result<Region> {
        ring_in(self.base, self.size, self.size - RING_ALIGN)
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        unmap(self.base, self.size);
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %e, "failed to unlink mapping");
            }
        }
    }
}

static PINNED_SEQ: AtomicU64 = AtomicU64::new(0);

/// Memory visible through two views at different addresses.
///
/// Stands in for page-locked host memory that a device reaches through its
/// own address translation: the host writes through [`host_region`], the
/// device through [`device_region`], and both see the same bytes.
///
/// [`host_region`]: PinnedMapping::host_region
/// [`device_region`]: PinnedMapping::device_region
pub struct PinnedMapping {
    host: *mut u8,
    device: *mut u8,
    size: usize,
    locked: bool,
}

// SAFETY: see SharedMapping.
unsafe impl Send for PinnedMapping {}
unsafe impl Sync for PinnedMapping {}

impl PinnedMapping {
    /// Allocate `size` bytes (rounded up to whole pages) backed by an
    /// unlinked file in `dir`.
    pub fn allocate(dir: &Path, size: usize) -> io::Result<Self> {
        let size = size.div_ceil(RING_ALIGN) * RING_ALIGN;
        let path = dir.join(format!(
            "sentinel-pinned-{}-{}",
            std::process::id(),
            PINNED_SEQ.fetch_add(1, Ordering::Relaxed)
        ));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        // Only the mappings keep the memory alive from here on.
        let unlinked = std::fs::remove_file(&path);
        file.set_len(size as u64)?;
        unlinked?;

        let host = map_shared(&file, size)?;
        let device = match map_shared(&file, size) {
            Ok(device) => device,
            Err(e) => {
                unmap(host, size);
                return Err(e);
            }
        };

        // SAFETY: host..host+size is mapped.
        let locked = unsafe { libc::mlock(host as *const libc::c_void, size) } == 0;
        if !locked {
            tracing::debug!(
                size,
                error = %io::Error::last_os_error(),
                "could not lock pinned mapping; continuing unlocked"
            );
        }

        Ok(Self {
            host,
            device,
            size,
            locked,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn host_region(&self) -> Region {
        // SAFETY: mapped for the lifetime of self.
        unsafe { Region::from_raw(self.host, self.size) }
    }

    pub fn device_region(&self) -> Region {
        // SAFETY: mapped for the lifetime of self.
        unsafe { Region::from_raw(self.device, self.size) }
    }

    /// Added to a device-view address to get the host-view address of the
    /// same byte.
    pub fn offset(&self) -> i64 {
        (self.host as usize as i64).wrapping_sub(self.device as usize as i64)
    }
}

impl Drop for PinnedMapping {
    fn drop(&mut self) {
        if self.locked {
            // SAFETY: locked in allocate with the same range.
            unsafe {
                libc::munlock(self.host as *const libc::c_void, self.size);
            }
        }
        unmap(self.device, self.size);
        unmap(self.host, self.size);
    }
}
