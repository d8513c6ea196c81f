//! Filesystem metadata recovery engine.
//!
//! Reads a raw block device or disk image, identifies the filesystem from its
//! on-disk signatures and walks NTFS, APFS or ext4 metadata to list live and
//! deleted files together with a confidence score for each record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::str::FromStr;

pub mod device;
pub mod error;
pub mod export;
pub mod fs;
pub mod recovery;

pub use device::{BlockSource, DeviceReader, MemoryDevice};
pub use error::{RecoveryError, Result};
pub use fs::apfs::ApfsSnapshot;
pub use fs::ext4::JournalInfo;
pub use fs::{detect_filesystem, FilesystemParser, FsParser};
pub use recovery::{
    CancelFlag, ConfidenceTier, RecoveryEngine, ScanOptions, ScanProgress, ScanReport, ScanStage,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilesystemType {
    Ntfs,
    Apfs,
    Ext4,
    Fat32,
    HfsPlus,
    Unknown,
}

impl FilesystemType {
    pub const ALL: [FilesystemType; 6] = [
        FilesystemType::Ntfs,
        FilesystemType::Apfs,
        FilesystemType::Ext4,
        FilesystemType::Fat32,
        FilesystemType::HfsPlus,
        FilesystemType::Unknown,
    ];

    /// Display name used in reports and exports
    pub fn as_str(&self) -> &'static str {
        match self {
            FilesystemType::Ntfs => "NTFS",
            FilesystemType::Apfs => "APFS",
            FilesystemType::Ext4 => "ext4",
            FilesystemType::Fat32 => "FAT32",
            FilesystemType::HfsPlus => "HFS+",
            FilesystemType::Unknown => "Unknown",
        }
    }

    /// Inverse of [`as_str`](Self::as_str). Unrecognised names map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "ntfs" => FilesystemType::Ntfs,
            "apfs" => FilesystemType::Apfs,
            "ext4" => FilesystemType::Ext4,
            "fat32" => FilesystemType::Fat32,
            "hfs+" | "hfsplus" => FilesystemType::HfsPlus,
            _ => FilesystemType::Unknown,
        }
    }

    /// Whether a metadata parser exists for this type
    pub fn has_parser(&self) -> bool {
        matches!(
            self,
            FilesystemType::Ntfs | FilesystemType::Apfs | FilesystemType::Ext4
        )
    }
}

impl std::fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilesystemType {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(FilesystemType::from_name(s))
    }
}

/// A file or directory reconstructed from filesystem metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    /// MFT record number, inode number or APFS object id
    pub id: u64,
    /// Reconstructed absolute path, `/`-separated
    pub path: String,
    pub name: String,
    /// Size recorded in metadata, not verified against the extents
    pub size: u64,
    pub is_directory: bool,
    pub is_deleted: bool,
    pub creation_time: Option<DateTime<Utc>>,
    pub modification_time: Option<DateTime<Utc>>,
    /// 0.0-1.0, see [`recovery::confidence`]
    pub recovery_confidence: f32,
    /// Data locations for a downstream content recovery step
    pub extents: Vec<BlockRange>,
    pub fs_metadata: Option<FsSpecificMetadata>,
}

impl FileEntry {
    pub fn confidence_tier(&self) -> ConfidenceTier {
        ConfidenceTier::from_score(self.recovery_confidence)
    }

    /// Total bytes covered by the entry's extents
    pub fn allocated_bytes(&self) -> u64 {
        self.extents.iter().map(BlockRange::byte_len).sum()
    }
}

/// A contiguous run of filesystem blocks (or NTFS clusters)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start_block: u64,
    pub block_count: u64,
    /// Size of one block in bytes
    pub block_size: u32,
}

impl BlockRange {
    pub fn new(start_block: u64, block_count: u64, block_size: u32) -> Self {
        Self {
            start_block,
            block_count,
            block_size,
        }
    }

    pub fn end_block(&self) -> u64 {
        self.start_block.saturating_add(self.block_count)
    }

    pub fn byte_offset(&self) -> u64 {
        self.start_block.saturating_mul(self.block_size as u64)
    }

    pub fn byte_len(&self) -> u64 {
        self.block_count.saturating_mul(self.block_size as u64)
    }

    pub fn contains(&self, block: u64) -> bool {
        block >= self.start_block && block < self.end_block()
    }
}

/// Filesystem-specific details retained for each entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FsSpecificMetadata {
    Ntfs(NtfsFileMetadata),
    Apfs(ApfsFileMetadata),
    Ext4(Ext4FileMetadata),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NtfsFileMetadata {
    pub record_number: u64,
    /// Sequence number, bumped every time the record is reused
    pub sequence_number: u16,
    pub parent_record: u64,
    pub hard_link_count: u16,
    /// `$FILE_NAME` namespace the name was taken from
    pub name_namespace: u8,
    /// `$DATA` stored inside the record itself
    pub resident_data: bool,
    pub accessed_time: Option<DateTime<Utc>>,
    pub mft_modified_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApfsFileMetadata {
    pub volume_name: String,
    pub object_id: u64,
    pub parent_id: u64,
    pub link_count: u32,
    pub mode: u16,
    pub owner: u32,
    pub group: u32,
    /// Transaction id of the leaf node the inode was read from
    pub transaction_id: u64,
    /// No directory record references this inode
    pub orphaned: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ext4FileMetadata {
    pub inode: u32,
    pub block_group: u32,
    pub mode: u16,
    pub links_count: u16,
    pub deletion_time: Option<DateTime<Utc>>,
    pub uses_extents: bool,
    pub flags: u32,
    /// Name recovered from directory slack rather than a live entry
    pub name_from_slack: bool,
}

/// Metadata about the currently opened device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: String,
    pub total_bytes: u64,
    pub sector_size: u32,
    pub filesystem_type: FilesystemType,
    pub filesystem_name: String,
    pub is_open: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            path: String::new(),
            total_bytes: 0,
            sector_size: device::DEFAULT_SECTOR_SIZE,
            filesystem_type: FilesystemType::Unknown,
            filesystem_name: FilesystemType::Unknown.to_string(),
            is_open: false,
        }
    }
}

/// Totals derived from one parse result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub total_recoverable: usize,
    pub total_deleted: usize,
    /// Records skipped as corrupt or unreadable
    pub skipped: usize,
}

impl RecoveryStats {
    pub fn from_entries(entries: &[FileEntry], skipped: usize) -> Self {
        Self {
            total_recoverable: entries.len(),
            total_deleted: entries.iter().filter(|e| e.is_deleted).count(),
            skipped,
        }
    }

    /// `(recoverable, deleted)`
    pub fn as_pair(&self) -> (usize, usize) {
        (self.total_recoverable, self.total_deleted)
    }
}
