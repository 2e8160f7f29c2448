#![forbid(unsafe_code)]
//! Byte-addressed backing devices for delta files.
//!
//! Provides the `ByteDevice` trait with pread/pwrite semantics and the
//! file-backed implementation every on-disk delta uses.

use ploop_error::{PloopError, Result};
use ploop_types::ByteOffset;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// Unlike a fixed-geometry disk, a delta file grows at the tail and may be
/// truncated by control operations, so the trait carries `resize`.
pub trait ByteDevice: Send + Sync + std::fmt::Debug {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`. Writes may extend the device.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Grow or shrink the device to `len` bytes. Grown space reads as zero.
    fn resize(&self, len: u64) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

impl<T: ByteDevice + ?Sized> ByteDevice for Arc<T> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(offset, buf)
    }

    fn resize(&self, len: u64) -> Result<()> {
        (**self).resize(len)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not share a seek
/// position, so one handle serves all submitting threads.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Ok(Self { file, writable })
    }

    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        trace!(
            target: "ploop::block",
            event = "file_device_created",
            path = %path.as_ref().display(),
            len
        );
        Ok(Self {
            file,
            writable: true,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.file.metadata().map(|meta| meta.len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let len = u64::try_from(buf.len())
            .map_err(|_| PloopError::Format("read length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len)
            .ok_or_else(|| PloopError::Format("read range overflows u64".to_owned()))?;
        let device_len = self.len_bytes();
        if end.0 > device_len {
            return Err(PloopError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={device_len}",
                buf.len()
            )));
        }
        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(PloopError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        let len = u64::try_from(buf.len())
            .map_err(|_| PloopError::Format("write length overflows u64".to_owned()))?;
        offset
            .checked_add(len)
            .ok_or_else(|| PloopError::Format("write range overflows u64".to_owned()))?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn resize(&self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(PloopError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        self.file.set_len(len)?;
        trace!(target: "ploop::block", event = "device_resized", len);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
