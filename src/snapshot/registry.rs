//! Process-global snapshot registry.

use std::collections::HashMap;
use std::ffi::c_void;
use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, mmap_anonymous, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::error::{Error, Result};

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
});

/// System page size.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// One registered snapshot: the original bytes plus the sealed in-memory
/// file that backs copy-on-write restores. The registry owns the fd; the
/// byte payload is shared with whoever took the snapshot.
#[derive(Debug)]
pub struct SnapshotData {
    pub data: Bytes,
    pub size: usize,
    fd: OwnedFd,
}

impl SnapshotData {
    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }
}

/// A mapping target whose base address is page-aligned by construction.
///
/// Backed by an anonymous private mapping, so a snapshot can be mapped over
/// it with MAP_FIXED and writes stay private to this process.
pub struct PageAlignedBuf {
    ptr: NonNull<c_void>,
    len: usize,
}

// The buffer is an exclusive mapping; moving it between threads is fine.
unsafe impl Send for PageAlignedBuf {}

impl PageAlignedBuf {
    /// Allocate a zeroed buffer of at least `len` bytes, rounded up to a
    /// whole number of pages.
    pub fn new(len: usize) -> Result<Self> {
        let rounded = len.max(1).div_ceil(page_size()) * page_size();
        let length = NonZeroUsize::new(rounded).expect("rounded length is non-zero");
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )?
        };
        Ok(Self { ptr, len: rounded })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr() as *mut u8, self.len) }
    }

    fn base(&self) -> NonNull<c_void> {
        self.ptr
    }
}

impl Drop for PageAlignedBuf {
    fn drop(&mut self) {
        // Unmapping the range also releases any snapshot pages mapped over
        // it with MAP_FIXED.
        unsafe {
            let _ = munmap(self.ptr, self.len);
        }
    }
}

/// Registry of named snapshots, serialized by a single mutex.
#[derive(Default)]
pub struct SnapshotRegistry {
    snapshots: Mutex<HashMap<String, Arc<SnapshotData>>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `data` into a fresh anonymous in-memory file and register it
    /// under `key`, replacing any previous snapshot with that key.
    pub fn take(&self, key: &str, data: Bytes) -> Result<()> {
        let name = CString::new(key.as_bytes())
            .map_err(|_| Error::InvalidArgument("snapshot key contains NUL".to_string()))?;
        let fd = memfd_create(&name, MemFdCreateFlag::empty())?;
        ftruncate(fd.as_fd(), data.len() as i64)?;

        let mut written = 0;
        while written < data.len() {
            written += nix::unistd::write(fd.as_fd(), &data[written..])?;
        }

        let size = data.len();
        let entry = Arc::new(SnapshotData { data, size, fd });
        self.snapshots
            .lock()
            .unwrap()
            .insert(key.to_string(), entry);
        debug!(key, size, "took snapshot");
        Ok(())
    }

    /// Look up a snapshot; fails with `SnapshotMissing` when absent.
    pub fn get(&self, key: &str) -> Result<Arc<SnapshotData>> {
        self.snapshots
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::SnapshotMissing(key.to_string()))
    }

    /// Map the snapshot's file over `target` as a private fixed mapping.
    ///
    /// The process then reads the snapshot bytes through `target`, and any
    /// writes stay private (copy-on-write). The target must be at least as
    /// large as the snapshot.
    pub fn map_onto(&self, key: &str, target: &mut PageAlignedBuf) -> Result<()> {
        let entry = self.get(key)?;
        if entry.size == 0 {
            return Ok(());
        }
        if entry.size > target.len() {
            return Err(Error::InvalidArgument(format!(
                "mapping target too small: {} < {}",
                target.len(),
                entry.size
            )));
        }

        let length = NonZeroUsize::new(entry.size).expect("checked non-zero");
        unsafe {
            mmap(
                Some(
                    NonZeroUsize::new(target.base().as_ptr() as usize)
                        .expect("mapping base is non-null"),
                ),
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
                entry.fd.as_fd(),
                0,
            )?;
        }
        Ok(())
    }

    /// Drop a snapshot and close its file. Removing a missing key is a
    /// no-op.
    pub fn delete(&self, key: &str) {
        if self.snapshots.lock().unwrap().remove(key).is_some() {
            debug!(key, "deleted snapshot");
        }
    }

    pub fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.snapshots.lock().unwrap().clear();
    }
}
