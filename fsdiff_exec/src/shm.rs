//! File-backed shared memory arenas.
//!
//! The backing file is inherited by the executor child at a fixed fd
//! slot, so the region must be file-backed rather than OS-id shared
//! memory. Access through the mapping is serialized by the control-pipe
//! handshake; no locking is needed.

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{self, File};
use std::io;
use std::num::NonZeroUsize;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::slice;

pub struct ShmArena {
    ptr: *mut c_void,
    len: usize,
    file: Option<File>,
    path: PathBuf,
}

// The raw mapping pointer is only dereferenced through &self/&mut self.
unsafe impl Send for ShmArena {}

impl ShmArena {
    /// Creates a backing file of exactly `size` bytes under `dir` and
    /// maps it read-write shared.
    pub fn new(dir: &Path, prefix: &str, size: usize) -> io::Result<ShmArena> {
        let (file, path) = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(dir)?
            .keep()
            .map_err(|e| e.error)?;
        file.set_len(size as u64)?;
        let len = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty arena"))?;
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| {
            let _ = fs::remove_file(&path);
            io::Error::from(e)
        })?;
        Ok(ShmArena {
            ptr: ptr.as_ptr(),
            len: size,
            file: Some(file),
            path,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file(&self) -> &File {
        self.file.as_ref().unwrap()
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }

    /// Unmaps, closes and removes the backing file, attempting all three
    /// and returning the first error encountered.
    pub fn close(mut self) -> io::Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> io::Result<()> {
        let mut first: Option<io::Error> = None;
        if let Some(ptr) = NonNull::new(self.ptr) {
            if let Err(e) = unsafe { munmap(ptr, self.len) } {
                first.get_or_insert(e.into());
            }
            self.ptr = std::ptr::null_mut();
        }
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ShmArena {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut arena = ShmArena::new(dir.path(), "fsdiff-test-shm-", 4096).unwrap();
        assert_eq!(arena.len(), 4096);
        arena.bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(&arena.bytes()[..4], &[1, 2, 3, 4]);
        arena.close().unwrap();
    }

    #[test]
    fn close_removes_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let arena = ShmArena::new(dir.path(), "fsdiff-test-shm-", 64).unwrap();
        let path = arena.path.clone();
        assert!(path.exists());
        arena.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn file_writes_are_visible_through_mapping() {
        use std::io::{Seek, SeekFrom, Write};
        let dir = tempfile::tempdir().unwrap();
        let arena = ShmArena::new(dir.path(), "fsdiff-test-shm-", 64).unwrap();
        let mut f = arena.file().try_clone().unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(b"xy").unwrap();
        assert_eq!(&arena.bytes()[..2], b"xy");
        arena.close().unwrap();
    }
}
