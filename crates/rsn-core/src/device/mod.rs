//! Offset-based raw access to block devices and image files
//!
//! Regular image files are memory-mapped. Block and character devices are
//! read with positioned reads aligned to the native sector size; callers
//! always see arbitrary byte offsets.

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{Mmap, MmapOptions};
use std::cell::Cell;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{RecoveryError, Result};

mod platform;

/// Sector size assumed when the platform cannot report one
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Anything the parsers can read raw bytes from
pub trait BlockSource {
    /// Read exactly `length` bytes at `offset`. Never returns a short buffer.
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>>;

    /// Total size in bytes
    fn size(&self) -> u64;

    fn sector_size(&self) -> u32 {
        DEFAULT_SECTOR_SIZE
    }

    fn read_u16_le(&self, offset: u64) -> Result<u16> {
        Ok(LittleEndian::read_u16(&self.read_at(offset, 2)?))
    }

    fn read_u32_le(&self, offset: u64) -> Result<u32> {
        Ok(LittleEndian::read_u32(&self.read_at(offset, 4)?))
    }
}

/// Bounds check shared by every source
fn check_bounds(offset: u64, length: usize, size: u64) -> Result<()> {
    match offset.checked_add(length as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(RecoveryError::OutOfBounds {
            offset,
            length,
            size,
        }),
    }
}

/// An in-memory image
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
    sector_size: u32,
}

impl MemoryDevice {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }

    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BlockSource for MemoryDevice {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        check_bounds(offset, length, self.data.len() as u64)?;
        let start = offset as usize;
        Ok(self.data[start..start + length].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }
}

enum Backend {
    /// Regular image file
    Mapped(Mmap),
    /// Block device, or an image that cannot be mapped
    Raw(File),
}

/// The single OS resource held while a device is open
struct DeviceHandle {
    path: PathBuf,
    backend: Backend,
    size: u64,
    sector_size: u32,
}

impl DeviceHandle {
    fn open(path: &Path) -> Result<Self> {
        let unavailable = |source| RecoveryError::DeviceUnavailable {
            path: path.display().to_string(),
            source,
        };

        let file = platform::open_read_only(path).map_err(unavailable)?;
        let metadata = file.metadata().map_err(unavailable)?;

        let (backend, size) = if metadata.is_file() && metadata.len() > 0 {
            let mmap = unsafe { MmapOptions::new().map(&file) }.map_err(unavailable)?;
            let size = mmap.len() as u64;
            (Backend::Mapped(mmap), size)
        } else if metadata.is_file() {
            (Backend::Raw(file), 0)
        } else {
            let size = platform::device_size(&file).map_err(unavailable)?;
            (Backend::Raw(file), size)
        };

        let sector_size = match &backend {
            Backend::Mapped(_) => DEFAULT_SECTOR_SIZE,
            Backend::Raw(file) => platform::sector_size(path, file).unwrap_or(DEFAULT_SECTOR_SIZE),
        };

        Ok(Self {
            path: path.to_path_buf(),
            backend,
            size,
            sector_size,
        })
    }

    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        check_bounds(offset, length, self.size)?;
        match &self.backend {
            Backend::Mapped(mmap) => {
                let start = offset as usize;
                Ok(mmap[start..start + length].to_vec())
            }
            Backend::Raw(file) => self.read_aligned(file, offset, length),
        }
    }

    /// Read the sector-aligned window around the request, then slice it
    fn read_aligned(&self, file: &File, offset: u64, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let sector = self.sector_size.max(1) as u64;
        let aligned_start = offset - offset % sector;
        let end = offset + length as u64;
        let aligned_end = end.div_ceil(sector).saturating_mul(sector).min(self.size);

        let mut window = vec![0u8; (aligned_end - aligned_start) as usize];
        platform::read_exact_at(file, &mut window, aligned_start).map_err(|source| {
            RecoveryError::IoFault {
                offset,
                length,
                source,
            }
        })?;

        let skip = (offset - aligned_start) as usize;
        window.truncate(skip + length);
        window.drain(..skip);
        Ok(window)
    }
}

/// Reader over a device path. At most one handle is held at a time.
#[derive(Default)]
pub struct DeviceReader {
    handle: Option<DeviceHandle>,
}

impl DeviceReader {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Open `path` read-only, releasing any previously open handle first
    pub fn open<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.close()?;
        let handle = DeviceHandle::open(path.as_ref())?;
        tracing::info!(
            "Opened {} ({} bytes, {}-byte sectors)",
            handle.path.display(),
            handle.size,
            handle.sector_size
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Release the handle. Safe to call when already closed.
    pub fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            tracing::debug!("Closed {}", handle.path.display());
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.handle.as_ref().map(|h| h.path.as_path())
    }
}

impl BlockSource for DeviceReader {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.handle
            .as_ref()
            .ok_or(RecoveryError::NotOpen)?
            .read_at(offset, length)
    }

    /// Zero while closed
    fn size(&self) -> u64 {
        self.handle.as_ref().map_or(0, |h| h.size)
    }

    fn sector_size(&self) -> u32 {
        self.handle
            .as_ref()
            .map_or(DEFAULT_SECTOR_SIZE, |h| h.sector_size)
    }
}

/// Wraps a source and tallies the bytes read through it
pub struct CountingSource<'a> {
    inner: &'a dyn BlockSource,
    bytes_read: Cell<u64>,
}

impl<'a> CountingSource<'a> {
    pub fn new(inner: &'a dyn BlockSource) -> Self {
        Self {
            inner,
            bytes_read: Cell::new(0),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }
}

impl BlockSource for CountingSource<'_> {
    fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let data = self.inner.read_at(offset, length)?;
        self.bytes_read.set(self.bytes_read.get() + data.len() as u64);
        Ok(data)
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_image(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_memory_device_bounds() {
        let device = MemoryDevice::new(vec![1, 2, 3, 4]);
        assert_eq!(device.read_at(1, 3).unwrap(), vec![2, 3, 4]);
        assert!(matches!(
            device.read_at(2, 3),
            Err(RecoveryError::OutOfBounds { .. })
        ));
        assert!(device.read_at(u64::MAX, 2).is_err());
        assert!(device.read_at(4, 0).unwrap().is_empty());
    }

    #[test]
    fn test_reader_reads_unaligned_offsets() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i % 251) as u8).collect();
        let image = temp_image(&data);

        let mut reader = DeviceReader::new();
        reader.open(image.path()).unwrap();
        assert!(reader.is_open());
        assert_eq!(reader.size(), 2048);
        assert_eq!(reader.sector_size(), DEFAULT_SECTOR_SIZE);
        assert_eq!(reader.read_at(513, 7).unwrap(), data[513..520].to_vec());
        assert_eq!(reader.read_u16_le(1080).unwrap(), u16::from_le_bytes([data[1080], data[1081]]));
    }

    #[test]
    fn test_reader_rejects_reads_past_end() {
        let image = temp_image(&[0u8; 1024]);
        let mut reader = DeviceReader::new();
        reader.open(image.path()).unwrap();
        assert!(reader.read_at(1000, 24).is_ok());
        assert!(matches!(
            reader.read_at(1000, 25),
            Err(RecoveryError::OutOfBounds { size: 1024, .. })
        ));
    }

    #[test]
    fn test_reader_not_open() {
        let reader = DeviceReader::new();
        assert!(!reader.is_open());
        assert_eq!(reader.size(), 0);
        assert!(matches!(reader.read_at(0, 1), Err(RecoveryError::NotOpen)));
    }

    #[test]
    fn test_reopen_and_idempotent_close() {
        let first = temp_image(&[0xAAu8; 512]);
        let second = temp_image(&[0x55u8; 1024]);

        let mut reader = DeviceReader::new();
        reader.open(first.path()).unwrap();
        reader.open(second.path()).unwrap();
        assert_eq!(reader.path(), Some(second.path()));
        assert_eq!(reader.size(), 1024);
        assert_eq!(reader.read_at(0, 1).unwrap(), vec![0x55]);

        reader.close().unwrap();
        reader.close().unwrap();
        assert!(!reader.is_open());
    }

    #[test]
    fn test_open_missing_path() {
        let mut reader = DeviceReader::new();
        assert!(matches!(
            reader.open(""),
            Err(RecoveryError::DeviceUnavailable { .. })
        ));
        assert!(!reader.is_open());
    }

    #[test]
    fn test_empty_image_opens_with_zero_size() {
        let image = temp_image(&[]);
        let mut reader = DeviceReader::new();
        reader.open(image.path()).unwrap();
        assert_eq!(reader.size(), 0);
        assert!(reader.read_at(0, 1).is_err());
    }

    #[test]
    fn test_aligned_window_on_raw_backend() {
        let data: Vec<u8> = (0..1536u32).map(|i| (i % 199) as u8).collect();
        let image = temp_image(&data);
        let handle = DeviceHandle {
            path: image.path().to_path_buf(),
            backend: Backend::Raw(File::open(image.path()).unwrap()),
            size: data.len() as u64,
            sector_size: 512,
        };
        assert_eq!(handle.read_at(510, 4).unwrap(), data[510..514].to_vec());
        assert_eq!(handle.read_at(1530, 6).unwrap(), data[1530..1536].to_vec());
        assert_eq!(handle.read_at(0, 1536).unwrap(), data);
    }

    #[test]
    fn test_counting_source() {
        let device = MemoryDevice::new(vec![0u8; 64]);
        let counting = CountingSource::new(&device);
        counting.read_at(0, 16).unwrap();
        counting.read_at(32, 8).unwrap();
        let _ = counting.read_at(60, 8);
        assert_eq!(counting.bytes_read(), 24);
    }
}
