//! Positioned little-endian file access, whole-file mapping and residency
//! pinning for model weights.

use crate::error::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

/// Buffered reader over a model file with its total size known up front.
pub struct ModelFileReader {
    inner: BufReader<File>,
    size: u64,
}

impl ModelFileReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            inner: BufReader::new(file),
            size,
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.inner.seek(pos)?)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(self.inner.read_u32::<LittleEndian>()?)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(self.inner.read_f32::<LittleEndian>()?)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }

    /// Map the whole file read-only. The reader stays usable afterwards.
    pub fn map(&self) -> Result<Arc<Mmap>> {
        // SAFETY: the mapping is read-only; model files are not expected to be
        // modified while a session holds them.
        let map = unsafe { Mmap::map(self.inner.get_ref())? };
        Ok(Arc::new(map))
    }
}

/// Buffered little-endian writer used by the quantizer.
pub struct ModelFileWriter {
    inner: BufWriter<File>,
}

impl ModelFileWriter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            inner: BufWriter::new(file),
        })
    }

    pub fn tell(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        Ok(self.inner.write_u32::<LittleEndian>(value)?)
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        Ok(self.inner.write_f32::<LittleEndian>(value)?)
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        Ok(self.inner.write_all(bytes)?)
    }

    /// Zero-pad up to the next multiple of `align` relative to file start.
    pub fn pad_to(&mut self, align: u64) -> Result<()> {
        let pos = self.tell()?;
        let pad = pos.wrapping_neg() & (align - 1);
        const ZEROS: [u8; 64] = [0u8; 64];
        self.write_all(&ZEROS[..pad as usize])?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.inner.flush()?)
    }
}

/// Asks the OS to keep a growing prefix of a memory region resident.
///
/// The caller guarantees the region outlives this object; the session keeps
/// the mapping (or owned buffer) alive alongside it.
pub struct MemoryLock {
    addr: usize,
    locked: usize,
    failed: bool,
}

impl MemoryLock {
    pub fn new(addr: *const u8) -> Self {
        Self {
            addr: addr as usize,
            locked: 0,
            failed: false,
        }
    }

    /// Extend the locked prefix to cover at least `target` bytes.
    #[cfg(unix)]
    pub fn grow_to(&mut self, target: usize) {
        if self.failed {
            return;
        }
        let page = page_size();
        let base = self.addr & !(page - 1);
        let end = (self.addr + target + page - 1) & !(page - 1);
        let len = end - base;
        if len <= self.locked {
            return;
        }
        // SAFETY: mlock only touches page residency; the range stays within
        // the region the caller handed us plus page rounding.
        let ret = unsafe { libc::mlock(base as *const libc::c_void, len) };
        if ret != 0 {
            warn!(
                "failed to mlock {} bytes (try increasing RLIMIT_MEMLOCK): {}",
                len,
                std::io::Error::last_os_error()
            );
            self.failed = true;
        } else {
            self.locked = len;
        }
    }

    #[cfg(not(unix))]
    pub fn grow_to(&mut self, _target: usize) {
        if !self.failed {
            warn!("memory locking is not supported on this platform");
            self.failed = true;
        }
    }
}

#[cfg(unix)]
impl Drop for MemoryLock {
    fn drop(&mut self) {
        if self.locked > 0 {
            let page = page_size();
            let base = self.addr & !(page - 1);
            // SAFETY: unlocks exactly the prefix locked by grow_to.
            unsafe { libc::munlock(base as *const libc::c_void, self.locked) };
        }
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
