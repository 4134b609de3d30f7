//! File- and shared-memory-backed pixel storage.
//!
//! File kind buffers live under the configured image directory and are
//! synced by writing the whole buffer out on [`super::BufferProvider::sync`].
//! SharedMemory kind buffers are `memfd`-backed and mapped with `memmap2`;
//! the OS attach count is their only refcounting, per spec.md §3.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Result, WidgetError};

pub enum Backing {
    File { path: PathBuf, data: Vec<u8> },
    SharedMemory { memfd: memfd::Memfd, map: MmapMut },
}

impl Backing {
    pub fn new_file(path: PathBuf, len: usize) -> Self {
        Backing::File { path, data: vec![0u8; len] }
    }

    pub fn new_shm(name: &str, len: usize) -> Result<Self> {
        let opts = memfd::MemfdOptions::default();
        let memfd = opts
            .create(name)
            .map_err(|e| WidgetError::Fault(format!("memfd create failed: {e}")))?;
        memfd
            .as_file()
            .set_len(len as u64)
            .map_err(WidgetError::Io)?;
        let map = unsafe {
            MmapMut::map_mut(memfd.as_file()).map_err(WidgetError::Io)?
        };
        Ok(Backing::SharedMemory { memfd, map })
    }

    pub fn len(&self) -> usize {
        match self {
            Backing::File { data, .. } => data.len(),
            Backing::SharedMemory { map, .. } => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base address of the mapped pixel data, for `ref`/`unref` callers.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::File { data, .. } => data.as_mut_slice(),
            Backing::SharedMemory { map, .. } => &mut map[..],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Backing::File { data, .. } => data.as_slice(),
            Backing::SharedMemory { map, .. } => &map[..],
        }
    }

    /// Grabs the advisory write lock (file kind only) and writes the whole
    /// buffer to its path. SHM and pixmap kinds sync as a no-op (spec.md
    /// §4.2's `sync`).
    pub fn sync_to_disk(&self) -> Result<()> {
        if let Backing::File { path, data } = self {
            let lock_path = lock_path_for(path);
            let _lock = AdvisoryLock::acquire(&lock_path)?;
            let mut file = File::create(path).map_err(WidgetError::Io)?;
            file.write_all(data).map_err(WidgetError::Io)?;
        }
        Ok(())
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

/// A per-instance advisory lock shared between slave and viewer, taken
/// around `sync` for file-kind buffers and around the HW compensation
/// copy-out for GEM buffers (§9.1 of the design: no lock while a
/// compensation buffer is process-private).
pub struct AdvisoryLock {
    file: File,
}

impl AdvisoryLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        use std::fs::OpenOptions;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(WidgetError::Io)?;
        file_lock_exclusive(&file)?;
        Ok(Self { file })
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let _ = file_unlock(&self.file);
    }
}

#[cfg(unix)]
fn file_lock_exclusive(file: &File) -> Result<()> {
    use std::os::fd::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(WidgetError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(unix)]
fn file_unlock(file: &File) -> Result<()> {
    use std::os::fd::AsRawFd;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if ret != 0 {
        return Err(WidgetError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backing_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w1.png");
        let mut backing = Backing::new_file(path.clone(), 16);
        backing.as_mut_slice()[0] = 0xAB;
        backing.sync_to_disk().unwrap();
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk[0], 0xAB);
        assert_eq!(on_disk.len(), 16);
    }

    #[test]
    fn shm_backing_maps_requested_length() {
        let backing = Backing::new_shm("widgetd-test", 4096).unwrap();
        assert_eq!(backing.len(), 4096);
    }
}
