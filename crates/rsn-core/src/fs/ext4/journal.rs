/// jbd2 journal discovery. The journal contents are not replayed.
use serde::Serialize;
use uuid::Uuid;

use crate::fs::common::be_u32_at;

/// jbd2 stores its headers big-endian
pub const JBD2_MAGIC: u32 = 0xC03B_3998;
pub const JBD2_SUPERBLOCK_V1: u32 = 3;
pub const JBD2_SUPERBLOCK_V2: u32 = 4;

/// Where the journal lives and whether its superblock checks out
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalInfo {
    /// Journal inode, 0 for an external journal
    pub inode: u32,
    /// Device number of an external journal, 0 when internal
    pub device: u32,
    pub uuid: Option<Uuid>,
    /// Byte offset of the jbd2 superblock, when it could be located
    pub location: Option<u64>,
    pub jbd2_block_size: Option<u32>,
    pub jbd2_total_blocks: Option<u32>,
    pub jbd2_valid: bool,
}

impl JournalInfo {
    pub fn is_external(&self) -> bool {
        self.inode == 0 && self.device != 0
    }
}

impl std::fmt::Display for JournalInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_external() {
            write!(f, "external journal on device 0x{:X}", self.device)?;
        } else {
            write!(f, "journal inode {}", self.inode)?;
        }
        if let Some(uuid) = self.uuid {
            write!(f, ", uuid {}", uuid)?;
        }
        match (self.jbd2_valid, self.jbd2_block_size, self.jbd2_total_blocks) {
            (true, Some(bs), Some(total)) => {
                write!(f, ", jbd2 superblock valid ({} blocks of {} bytes)", total, bs)
            }
            _ => write!(f, ", jbd2 superblock not found"),
        }
    }
}

/// Fields of a jbd2 superblock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jbd2Superblock {
    pub block_size: u32,
    pub total_blocks: u32,
    pub first_log_block: u32,
}

impl Jbd2Superblock {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if be_u32_at(data, 0)? != JBD2_MAGIC {
            return None;
        }
        let block_type = be_u32_at(data, 4)?;
        if block_type != JBD2_SUPERBLOCK_V1 && block_type != JBD2_SUPERBLOCK_V2 {
            return None;
        }
        let block_size = be_u32_at(data, 12)?;
        if !block_size.is_power_of_two() || !(1024..=65536).contains(&block_size) {
            return None;
        }
        Some(Self {
            block_size,
            total_blocks: be_u32_at(data, 16)?,
            first_log_block: be_u32_at(data, 20)?,
        })
    }
}

/// Uuid from raw superblock bytes; all zero means unset
pub fn uuid_from_bytes(bytes: &[u8]) -> Option<Uuid> {
    let raw: [u8; 16] = bytes.try_into().ok()?;
    let uuid = Uuid::from_bytes(raw);
    (!uuid.is_nil()).then_some(uuid)
}
