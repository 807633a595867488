#![forbid(unsafe_code)]
//! Device access for the hypermetadata manager.
//!
//! Provides the `ByteDevice` trait (pread/pwrite semantics), a file-backed
//! implementation, and `DiskImage`: the mapped-view analog whose write path
//! is gated by a memory-protection state. Reads of possibly-bad media are
//! expressed as `Result`-returning primitives; the mount layer converts
//! failures into media faults.

use parking_lot::Mutex;
use rufs_error::{HyperError, Result};
use rufs_types::ByteOffset;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Granularity of the disk image mapping. Block sizes below this cannot be
/// mapped and are rejected at load time.
pub const PAGE_SIZE: u32 = 4096;

/// Round a byte length up to the mapping granularity.
#[must_use]
pub fn round_page(len: u64) -> Option<u64> {
    rufs_types::align_up(len, u64::from(PAGE_SIZE))
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using Linux `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
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
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| HyperError::Parse("read length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| HyperError::Parse("read range overflows u64".to_owned()))?;
        if end.0 > self.len {
            return Err(HyperError::Parse(format!(
                "read out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset.0)?;
        Ok(())
    }

    fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(HyperError::ProtectionViolation {
                offset: offset.0,
                len: buf.len(),
            });
        }
        let end = offset
            .checked_add(
                u64::try_from(buf.len())
                    .map_err(|_| HyperError::Parse("write length overflows u64".to_owned()))?,
            )
            .ok_or_else(|| HyperError::Parse("write range overflows u64".to_owned()))?;
        if end.0 > self.len {
            return Err(HyperError::Parse(format!(
                "write out of bounds: offset={offset} len={} device_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.write_all_at(buf, offset.0)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Memory protection applied to the mapped disk image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    Read,
    ReadWrite,
}

/// The mapped view of the device backing a mount.
///
/// Wraps a `ByteDevice` with a protection state covering the full device
/// extent. Writes through a `Read`-protected image fail with
/// `ProtectionViolation`; the mode-transition handler flips the protection
/// whenever the mount toggles between read-only and writable.
pub struct DiskImage {
    dev: Box<dyn ByteDevice>,
    protection: Mutex<Protection>,
}

impl std::fmt::Debug for DiskImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImage")
            .field("len_bytes", &self.dev.len_bytes())
            .field("protection", &self.protection())
            .finish()
    }
}

impl DiskImage {
    /// Wrap an already-opened device. The image starts read-protected; the
    /// mount flips protection once the effective mode is known.
    #[must_use]
    pub fn from_device(dev: Box<dyn ByteDevice>) -> Self {
        Self {
            dev,
            protection: Mutex::new(Protection::Read),
        }
    }

    /// Open a file-backed image at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dev = FileByteDevice::open(path)?;
        Ok(Self::from_device(Box::new(dev)))
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.dev.len_bytes()
    }

    /// Adjust the protection of the full mapped extent.
    pub fn protect(&self, protection: Protection) {
        *self.protection.lock() = protection;
    }

    #[must_use]
    pub fn protection(&self) -> Protection {
        *self.protection.lock()
    }

    /// Read exactly `buf.len()` bytes from `offset`.
    pub fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.dev.read_exact_at(offset, buf)
    }

    /// Guarded read for regions that may sit on bad media.
    ///
    /// The fault boundary of the mapped image: any failure of the underlying
    /// read surfaces as a recoverable `MediaFault` carrying the faulting
    /// range, and the caller treats it as an unreadable region.
    pub fn read_guarded(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        self.dev
            .read_exact_at(offset, buf)
            .map_err(|_| HyperError::MediaFault {
                offset: offset.0,
                len: buf.len(),
            })
    }

    /// Write all bytes in `buf` to `offset`, honoring the protection state.
    pub fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
        if self.protection() != Protection::ReadWrite {
            return Err(HyperError::ProtectionViolation {
                offset: offset.0,
                len: buf.len(),
            });
        }
        self.dev.write_all_at(offset, buf)
    }

    /// Flush pending writes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[derive(Debug)]
    struct MemoryByteDevice {
        bytes: Mutex<Vec<u8>>,
    }

    impl MemoryByteDevice {
        fn new(len: usize) -> Self {
            Self {
                bytes: Mutex::new(vec![0_u8; len]),
            }
        }
    }

    impl ByteDevice for MemoryByteDevice {
        fn len_bytes(&self) -> u64 {
            u64::try_from(self.bytes.lock().len()).unwrap_or(0)
        }

        fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
            let offset = usize::try_from(offset.0)
                .map_err(|_| HyperError::Parse("offset overflow".into()))?;
            let end = offset
                .checked_add(buf.len())
                .ok_or_else(|| HyperError::Parse("range overflow".into()))?;
            let bytes = self.bytes.lock();
            if end > bytes.len() {
                return Err(HyperError::Parse("oob".into()));
            }
            buf.copy_from_slice(&bytes[offset..end]);
            drop(bytes);
            Ok(())
        }

        fn write_all_at(&self, offset: ByteOffset, buf: &[u8]) -> Result<()> {
            let offset = usize::try_from(offset.0)
                .map_err(|_| HyperError::Parse("offset overflow".into()))?;
            let end = offset
                .checked_add(buf.len())
                .ok_or_else(|| HyperError::Parse("range overflow".into()))?;
            let mut bytes = self.bytes.lock();
            if end > bytes.len() {
                return Err(HyperError::Parse("oob".into()));
            }
            bytes[offset..end].copy_from_slice(buf);
            drop(bytes);
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn file_device_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0_u8; 8192]).expect("fill");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert!(dev.is_writable());
        assert_eq!(dev.len_bytes(), 8192);

        dev.write_all_at(ByteOffset(512), &[7_u8; 512]).expect("write");
        let mut buf = [0_u8; 512];
        dev.read_exact_at(ByteOffset(512), &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 512]);
    }

    #[test]
    fn file_device_rejects_out_of_bounds() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0_u8; 1024]).expect("fill");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        let mut buf = [0_u8; 512];
        assert!(dev.read_exact_at(ByteOffset(1024), &mut buf).is_err());
        assert!(dev.write_all_at(ByteOffset(768), &[0_u8; 512]).is_err());
    }

    #[test]
    fn image_protection_gates_writes() {
        let image = DiskImage::from_device(Box::new(MemoryByteDevice::new(4096)));
        assert_eq!(image.protection(), Protection::Read);

        let err = image
            .write_all_at(ByteOffset(0), &[1_u8; 16])
            .expect_err("protected");
        assert!(matches!(err, HyperError::ProtectionViolation { offset: 0, len: 16 }));

        image.protect(Protection::ReadWrite);
        image.write_all_at(ByteOffset(0), &[1_u8; 16]).expect("write");

        image.protect(Protection::Read);
        assert!(image.write_all_at(ByteOffset(0), &[2_u8; 16]).is_err());

        // The protected write never reached the device.
        let mut buf = [0_u8; 16];
        image.read_exact_at(ByteOffset(0), &mut buf).expect("read");
        assert_eq!(buf, [1_u8; 16]);
    }

    #[test]
    fn guarded_read_surfaces_media_fault() {
        let image = DiskImage::from_device(Box::new(MemoryByteDevice::new(1024)));
        let mut buf = [0_u8; 512];

        image.read_guarded(ByteOffset(0), &mut buf).expect("good read");

        // A read past the device end stands in for a faulting region.
        let err = image
            .read_guarded(ByteOffset(768), &mut buf)
            .expect_err("fault");
        assert!(matches!(
            err,
            HyperError::MediaFault {
                offset: 768,
                len: 512
            }
        ));
    }

    #[test]
    fn round_page_alignment() {
        assert_eq!(round_page(0), Some(0));
        assert_eq!(round_page(1), Some(u64::from(PAGE_SIZE)));
        assert_eq!(round_page(4096), Some(4096));
        assert_eq!(round_page(4097), Some(8192));
    }
}
