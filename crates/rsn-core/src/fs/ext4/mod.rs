/// ext4 support: superblock, group descriptors, inode table walk and
/// directory reconstruction
use anyhow::{bail, Context};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::Utc;
use std::io::Cursor;
use uuid::Uuid;

pub mod directory;
pub mod inode;
pub mod journal;

pub use journal::JournalInfo;

use super::FilesystemParser;
use crate::device::BlockSource;
use crate::error::{RecoveryError, Result};
use crate::fs::common::{sanitize_name, u16_at, u32_at};
use crate::recovery::confidence::{
    calculate_confidence_score, extents_valid, size_consistency, timestamps_plausible,
    RecordIntegrity,
};
use crate::recovery::directory::{DirectoryTree, ORPHAN_DIR};
use crate::recovery::{ParserProgress, ScanContext};
use crate::{Ext4FileMetadata, FileEntry, FilesystemType, FsSpecificMetadata, RecoveryStats};
use inode::{BlockMapper, Ext4Inode};
use journal::{uuid_from_bytes, Jbd2Superblock};

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const SUPERBLOCK_SIZE: usize = 1024;
pub const EXT4_MAGIC: u16 = 0xEF53;
pub const ROOT_INODE: u32 = 2;

pub const COMPAT_HAS_JOURNAL: u32 = 0x0004;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_FLEX_BG: u32 = 0x0200;
pub const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;

const BG_INODE_UNINIT: u16 = 0x0001;
const GOOD_OLD_REV: u32 = 0;
const GOOD_OLD_INODE_SIZE: u16 = 128;
const GOOD_OLD_FIRST_INO: u32 = 11;
const MIN_DESC_SIZE: u16 = 32;
const MIN_DESC_SIZE_64BIT: u16 = 64;

/// Superblock fields the walk depends on
#[derive(Debug, Clone, PartialEq)]
pub struct Ext4Superblock {
    pub inodes_count: u32,
    pub blocks_count: u64,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: Option<Uuid>,
    pub volume_name: String,
    pub journal_uuid: Option<Uuid>,
    pub journal_inum: u32,
    pub journal_dev: u32,
    pub desc_size: u16,
}

impl Ext4Superblock {
    /// Parse the 1 KiB superblock
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < SUPERBLOCK_SIZE {
            bail!("Insufficient data for ext4 superblock");
        }

        let mut cursor = Cursor::new(data);
        let inodes_count = cursor.read_u32::<LittleEndian>()?;
        let blocks_lo = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0x14);
        let first_data_block = cursor.read_u32::<LittleEndian>()?;
        let log_block_size = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0x20);
        let blocks_per_group = cursor.read_u32::<LittleEndian>()?;
        cursor.set_position(0x28);
        let inodes_per_group = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0x38);
        let magic = cursor.read_u16::<LittleEndian>()?;
        if magic != EXT4_MAGIC {
            bail!("Invalid ext4 magic: 0x{:04X}", magic);
        }

        cursor.set_position(0x4C);
        let rev_level = cursor.read_u32::<LittleEndian>()?;
        cursor.set_position(0x54);
        let raw_first_ino = cursor.read_u32::<LittleEndian>()?;
        let raw_inode_size = cursor.read_u16::<LittleEndian>()?;

        cursor.set_position(0x5C);
        let feature_compat = cursor.read_u32::<LittleEndian>()?;
        let feature_incompat = cursor.read_u32::<LittleEndian>()?;
        let feature_ro_compat = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0xE0);
        let journal_inum = cursor.read_u32::<LittleEndian>()?;
        let journal_dev = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(0xFE);
        let desc_size = cursor.read_u16::<LittleEndian>()?;

        cursor.set_position(0x150);
        let blocks_hi = cursor.read_u32::<LittleEndian>()?;

        if log_block_size > 6 {
            bail!("Block size exponent {} out of range", log_block_size);
        }
        let block_size = 1024u32 << log_block_size;

        let (first_ino, inode_size) = if rev_level == GOOD_OLD_REV {
            (GOOD_OLD_FIRST_INO, GOOD_OLD_INODE_SIZE)
        } else {
            (raw_first_ino, raw_inode_size)
        };
        if inode_size < GOOD_OLD_INODE_SIZE
            || !inode_size.is_power_of_two()
            || inode_size as u32 > block_size
        {
            bail!("Invalid inode size: {}", inode_size);
        }

        // Each group's bitmaps occupy exactly one block
        let bits_per_block = block_size * 8;
        if blocks_per_group > bits_per_block || inodes_per_group > bits_per_block {
            bail!(
                "Group geometry exceeds one bitmap block: {} blocks, {} inodes",
                blocks_per_group,
                inodes_per_group
            );
        }

        let is_64bit = feature_incompat & INCOMPAT_64BIT != 0;
        let blocks_count = if is_64bit {
            ((blocks_hi as u64) << 32) | blocks_lo as u64
        } else {
            blocks_lo as u64
        };

        Ok(Self {
            inodes_count,
            blocks_count,
            first_data_block,
            log_block_size,
            blocks_per_group,
            inodes_per_group,
            rev_level,
            first_ino,
            inode_size,
            feature_compat,
            feature_incompat,
            feature_ro_compat,
            uuid: uuid_from_bytes(&data[0x68..0x78]),
            volume_name: label_from_bytes(&data[0x78..0x88]),
            journal_uuid: uuid_from_bytes(&data[0xD0..0xE0]),
            journal_inum,
            journal_dev,
            desc_size,
        })
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size
    }

    pub fn is_64bit(&self) -> bool {
        self.feature_incompat & INCOMPAT_64BIT != 0
    }

    pub fn has_journal(&self) -> bool {
        self.feature_compat & COMPAT_HAS_JOURNAL != 0
    }

    pub fn has_metadata_csum(&self) -> bool {
        self.feature_ro_compat & RO_COMPAT_METADATA_CSUM != 0
    }

    pub fn descriptor_size(&self) -> usize {
        if self.is_64bit() {
            self.desc_size.max(MIN_DESC_SIZE_64BIT) as usize
        } else {
            MIN_DESC_SIZE as usize
        }
    }

    /// Zero when the group geometry is blank
    pub fn group_count(&self) -> u64 {
        if self.blocks_per_group == 0 || self.inodes_per_group == 0 {
            return 0;
        }
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block as u64);
        data_blocks.div_ceil(self.blocks_per_group as u64)
    }

    /// Largest size an extent-mapped file can declare
    pub fn max_file_size(&self) -> u64 {
        (self.block_size() as u64).saturating_mul(1 << 32)
    }

    /// Byte offset of the group descriptor table
    fn gdt_offset(&self) -> u64 {
        (self.first_data_block as u64 + 1) * self.block_size() as u64
    }
}

fn label_from_bytes(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GroupDescriptor {
    inode_bitmap: u64,
    inode_table: u64,
    flags: u16,
}

impl GroupDescriptor {
    fn parse(raw: &[u8], is_64bit: bool) -> Self {
        let lo = |offset| u32_at(raw, offset).unwrap_or(0) as u64;
        let hi = |offset| {
            if is_64bit {
                (u32_at(raw, offset).unwrap_or(0) as u64) << 32
            } else {
                0
            }
        };
        Self {
            inode_bitmap: lo(0x04) | hi(0x24),
            inode_table: lo(0x08) | hi(0x28),
            flags: u16_at(raw, 0x12).unwrap_or(0),
        }
    }

    /// `None` when a damaged hi word puts the table past any addressable byte
    fn inode_table_offset(&self, block_size: u64) -> Option<u64> {
        self.inode_table.checked_mul(block_size)
    }

    fn inode_bitmap_offset(&self, block_size: u64) -> Option<u64> {
        self.inode_bitmap.checked_mul(block_size)
    }
}

/// An inode that made it through the table walk
struct FoundInode {
    inode: Ext4Inode,
    group: u32,
    allocated: bool,
}

impl FoundInode {
    fn is_deleted(&self) -> bool {
        !self.allocated || self.inode.dtime != 0 || self.inode.links_count == 0
    }
}

/// Inode-table-based parser
pub struct Ext4Parser {
    stats: RecoveryStats,
    superblock: Option<Ext4Superblock>,
    journal: Option<JournalInfo>,
}

impl Default for Ext4Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Ext4Parser {
    pub fn new() -> Self {
        Self {
            stats: RecoveryStats::default(),
            superblock: None,
            journal: None,
        }
    }

    pub fn superblock(&self) -> Option<&Ext4Superblock> {
        self.superblock.as_ref()
    }

    /// Journal location from the last parse; `None` without a journal
    pub fn journal_info(&self) -> Option<&JournalInfo> {
        self.journal.as_ref()
    }

    fn read_superblock(source: &dyn BlockSource) -> anyhow::Result<Ext4Superblock> {
        let data = source.read_at(SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE)?;
        Ext4Superblock::parse(&data)
    }

    fn read_group_descriptors(
        source: &dyn BlockSource,
        sb: &Ext4Superblock,
        groups: u64,
    ) -> anyhow::Result<Vec<GroupDescriptor>> {
        let desc_size = sb.descriptor_size();
        let table_len = (groups as usize)
            .checked_mul(desc_size)
            .context("group descriptor table size overflows")?;
        let table = source
            .read_at(sb.gdt_offset(), table_len)
            .context("group descriptor table")?;
        Ok(table
            .chunks_exact(desc_size)
            .map(|raw| GroupDescriptor::parse(raw, sb.is_64bit()))
            .collect())
    }

    fn read_journal_info(
        source: &dyn BlockSource,
        sb: &Ext4Superblock,
        descriptors: &[GroupDescriptor],
        mapper: &BlockMapper<'_>,
    ) -> Option<JournalInfo> {
        if !sb.has_journal() {
            return None;
        }

        let mut info = JournalInfo {
            inode: sb.journal_inum,
            device: sb.journal_dev,
            uuid: sb.journal_uuid,
            location: None,
            jbd2_block_size: None,
            jbd2_total_blocks: None,
            jbd2_valid: false,
        };
        if info.inode == 0 || sb.inodes_per_group == 0 {
            return Some(info);
        }

        let index = info.inode - 1;
        let group = (index / sb.inodes_per_group) as usize;
        let slot = (index % sb.inodes_per_group) as u64;
        let desc = descriptors.get(group)?;
        let Some(offset) = desc
            .inode_table_offset(sb.block_size() as u64)
            .and_then(|table| table.checked_add(slot * sb.inode_size as u64))
        else {
            tracing::warn!(
                "Journal inode {} lies in group {} whose inode table is out of range",
                info.inode,
                group
            );
            return Some(info);
        };

        let journal_inode = source
            .read_at(offset, sb.inode_size as usize)
            .ok()
            .and_then(|raw| {
                Ext4Inode::parse(&raw, info.inode, sb.inode_size as usize, sb.max_file_size())
                    .ok()
                    .flatten()
            });
        let first = journal_inode
            .and_then(|inode| mapper.extents(&inode).ok())
            .and_then(|extents| extents.first().copied());

        if let Some(range) = first {
            let location = range.byte_offset();
            info.location = Some(location);
            let jsb = source
                .read_at(location, 1024)
                .ok()
                .and_then(|data| Jbd2Superblock::parse(&data));
            if let Some(jsb) = jsb {
                info.jbd2_block_size = Some(jsb.block_size);
                info.jbd2_total_blocks = Some(jsb.total_blocks);
                info.jbd2_valid = true;
            }
        }
        Some(info)
    }

    /// Walk every group's inode table
    fn scan_inodes(
        source: &dyn BlockSource,
        sb: &Ext4Superblock,
        descriptors: &[GroupDescriptor],
        ctx: &mut ScanContext<'_>,
    ) -> Vec<FoundInode> {
        let block_size = sb.block_size() as u64;
        let inode_size = sb.inode_size as usize;
        let per_group = sb.inodes_per_group;
        let limit = ctx.options().max_inodes;
        let total = descriptors.len() as u64 * per_group as u64;
        let total = limit.map_or(total, |l| total.min(l));

        let mut found = Vec::new();
        let mut deleted = 0usize;
        let mut visited = 0u64;

        'groups: for (group, desc) in descriptors.iter().enumerate() {
            if desc.flags & BG_INODE_UNINIT != 0 {
                visited += per_group as u64;
                continue;
            }

            let Some(table_offset) = desc.inode_table_offset(block_size) else {
                tracing::warn!(
                    "Inode table of group {} at block {} is out of range",
                    group,
                    desc.inode_table
                );
                for _ in 0..per_group {
                    ctx.record_skip();
                }
                visited += per_group as u64;
                continue;
            };
            let table = match source.read_at(table_offset, per_group as usize * inode_size) {
                Ok(table) => table,
                Err(e) => {
                    tracing::warn!("Inode table of group {} unreadable: {}", group, e);
                    for _ in 0..per_group {
                        ctx.record_skip();
                    }
                    visited += per_group as u64;
                    continue;
                }
            };
            let bitmap = match desc
                .inode_bitmap_offset(block_size)
                .map(|offset| source.read_at(offset, block_size as usize))
            {
                Some(Ok(bitmap)) => Some(bitmap),
                Some(Err(e)) => {
                    tracing::warn!("Inode bitmap of group {} unreadable: {}", group, e);
                    None
                }
                None => {
                    tracing::warn!(
                        "Inode bitmap of group {} at block {} is out of range",
                        group,
                        desc.inode_bitmap
                    );
                    None
                }
            };

            for slot in 0..per_group {
                if ctx.is_cancelled() {
                    tracing::info!("ext4 walk cancelled after {} inodes", visited);
                    break 'groups;
                }
                if limit.is_some_and(|l| visited >= l) {
                    break 'groups;
                }
                visited += 1;
                ctx.report(ParserProgress {
                    operation: "Scanning inode tables",
                    units_done: visited,
                    units_total: total,
                    files_found: found.len(),
                    deleted_found: deleted,
                });

                let number = group as u32 * per_group + slot + 1;
                if number < sb.first_ino && number != ROOT_INODE {
                    continue;
                }

                let start = slot as usize * inode_size;
                let raw = &table[start..start + inode_size];
                let inode = match Ext4Inode::parse(raw, number, inode_size, sb.max_file_size()) {
                    Ok(Some(inode)) => inode,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::debug!("Skipping inode {}: {}", number, e);
                        ctx.record_skip();
                        continue;
                    }
                };

                let allocated = match &bitmap {
                    Some(bits) => {
                        let byte = bits.get(slot as usize / 8).copied().unwrap_or(0);
                        byte & (1 << (slot % 8)) != 0
                    }
                    None => inode.dtime == 0 && inode.links_count > 0,
                };
                if !allocated && inode.mode == 0 && inode.dtime == 0 {
                    continue;
                }

                let entry = FoundInode {
                    inode,
                    group: group as u32,
                    allocated,
                };
                if entry.is_deleted() {
                    deleted += 1;
                }
                found.push(entry);
            }
        }

        ctx.report(ParserProgress {
            operation: "Scanning inode tables",
            units_done: total,
            units_total: total,
            files_found: found.len(),
            deleted_found: deleted,
        });
        found
    }

    /// Names from live directories, including residual entries in slack
    fn build_tree(
        source: &dyn BlockSource,
        sb: &Ext4Superblock,
        found: &[FoundInode],
        mapper: &BlockMapper<'_>,
        ctx: &mut ScanContext<'_>,
    ) -> DirectoryTree {
        let mut tree = DirectoryTree::new(ROOT_INODE as u64, ctx.options().max_tree_depth);
        let block_size = sb.block_size() as u64;
        let dirs: Vec<&FoundInode> = found
            .iter()
            .filter(|f| f.inode.is_directory() && !f.is_deleted())
            .collect();

        for (done, dir) in dirs.iter().enumerate() {
            if ctx.is_cancelled() {
                break;
            }
            ctx.report(ParserProgress {
                operation: "Reading directories",
                units_done: done as u64,
                units_total: dirs.len() as u64,
                files_found: found.len(),
                deleted_found: 0,
            });

            let extents = match mapper.extents(&dir.inode) {
                Ok(extents) => extents,
                Err(e) => {
                    tracing::warn!("Directory inode {} has unreadable blocks: {}", dir.inode.number, e);
                    continue;
                }
            };
            for range in extents {
                for block in range.start_block..range.end_block() {
                    let Some(Ok(data)) = block
                        .checked_mul(block_size)
                        .map(|offset| source.read_at(offset, block_size as usize))
                    else {
                        tracing::warn!("Directory block {} unreadable", block);
                        continue;
                    };
                    for entry in directory::parse_dir_block(&data, sb.inodes_count) {
                        let name = sanitize_name(&entry.name);
                        let parent = dir.inode.number as u64;
                        if entry.from_slack {
                            tree.insert_residual(entry.inode as u64, name, parent);
                        } else {
                            tree.insert(entry.inode as u64, name, parent);
                        }
                    }
                }
            }
        }
        tree
    }

    fn build_entry(
        found: &FoundInode,
        tree: &mut DirectoryTree,
        mapper: &BlockMapper<'_>,
        device_size: u64,
        resolve_paths: bool,
    ) -> FileEntry {
        let inode = &found.inode;
        let id = inode.number as u64;
        let named = tree.contains(id) || inode.number == ROOT_INODE;

        let name = if inode.number == ROOT_INODE {
            "/".to_string()
        } else {
            tree.name_of(id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("<inode_{}>", inode.number))
        };
        let path = if !resolve_paths {
            name.clone()
        } else {
            tree.resolve(id)
                .unwrap_or_else(|| format!("/{}/{}", ORPHAN_DIR, name))
        };

        let (extents, mapped) = match mapper.extents(inode) {
            Ok(extents) => (extents, true),
            Err(e) => {
                tracing::debug!("Inode {} block map unreadable: {}", inode.number, e);
                (Vec::new(), false)
            }
        };

        let integrity = RecordIntegrity {
            signature_valid: true,
            name_decoded: named,
            type_known: inode.file_type() != 0,
            size_consistency: if inode.is_directory() {
                1.0
            } else {
                size_consistency(inode.size, &extents, inode.is_inline())
            },
            timestamps_plausible: timestamps_plausible(
                &[inode.created, inode.modified, inode.changed],
                Utc::now(),
            ),
            extents_valid: mapped && extents_valid(&extents, device_size),
            checksum_verified: None,
        };

        FileEntry {
            id,
            path,
            name,
            size: inode.size,
            is_directory: inode.is_directory(),
            is_deleted: found.is_deleted(),
            creation_time: inode.created,
            modification_time: inode.modified,
            recovery_confidence: calculate_confidence_score(&integrity),
            extents,
            fs_metadata: Some(FsSpecificMetadata::Ext4(Ext4FileMetadata {
                inode: inode.number,
                block_group: found.group,
                mode: inode.mode,
                links_count: inode.links_count,
                deletion_time: inode.deletion_time(),
                uses_extents: inode.uses_extents(),
                flags: inode.flags,
                name_from_slack: tree.is_residual(id),
            })),
        }
    }
}

impl FilesystemParser for Ext4Parser {
    fn filesystem_type(&self) -> FilesystemType {
        FilesystemType::Ext4
    }

    fn can_handle(&self, source: &dyn BlockSource) -> bool {
        Self::read_superblock(source).is_ok()
    }

    fn parse(
        &mut self,
        source: &dyn BlockSource,
        ctx: &mut ScanContext<'_>,
    ) -> Result<Vec<FileEntry>> {
        let sb = Self::read_superblock(source)
            .context("ext4 superblock")
            .map_err(RecoveryError::corruption)?;
        let groups = sb.group_count();
        tracing::info!(
            "ext4: {}-byte blocks, {} groups, {} inodes per group, volume '{}'",
            sb.block_size(),
            groups,
            sb.inodes_per_group,
            sb.volume_name
        );

        if groups == 0 {
            tracing::warn!("ext4 superblock has no block groups, nothing to walk");
            self.stats = RecoveryStats::default();
            self.journal = None;
            self.superblock = Some(sb);
            return Ok(Vec::new());
        }
        if sb.blocks_count.saturating_mul(sb.block_size() as u64) > source.size() {
            tracing::warn!(
                "ext4 declares {} blocks but the device holds {} bytes",
                sb.blocks_count,
                source.size()
            );
        }

        let descriptors = Self::read_group_descriptors(source, &sb, groups)
            .map_err(RecoveryError::corruption)?;
        let mapper = BlockMapper::new(
            source,
            sb.block_size(),
            sb.blocks_count,
            ctx.options().max_tree_depth,
        );
        let skipped_before = ctx.skipped();

        let found = Self::scan_inodes(source, &sb, &descriptors, ctx);
        let mut tree = Self::build_tree(source, &sb, &found, &mapper, ctx);

        let resolve_paths = ctx.options().resolve_paths;
        let entries: Vec<FileEntry> = found
            .iter()
            .map(|f| Self::build_entry(f, &mut tree, &mapper, source.size(), resolve_paths))
            .collect();

        self.journal = Self::read_journal_info(source, &sb, &descriptors, &mapper);
        self.stats = RecoveryStats::from_entries(&entries, ctx.skipped() - skipped_before);
        self.superblock = Some(sb);
        tracing::info!(
            "ext4: {} entries ({} deleted), {} inodes skipped",
            self.stats.total_recoverable,
            self.stats.total_deleted,
            self.stats.skipped
        );
        Ok(entries)
    }

    fn recovery_stats(&self) -> RecoveryStats {
        self.stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::directory::tests::put_dirent;
    use super::inode::tests::{raw_inode, set_extent};
    use super::inode::{S_IFDIR, S_IFREG};
    use super::journal::tests::jbd2_block;
    use super::*;
    use crate::device::MemoryDevice;
    use crate::recovery::{CancelFlag, ScanOptions};
    use crate::BlockRange;

    const BLOCK: usize = 1024;
    const INODE_SIZE: usize = 256;
    const INODE_BITMAP_BLOCK: usize = 4;
    const INODE_TABLE_BLOCK: usize = 5;

    fn superblock() -> Vec<u8> {
        let mut sb = vec![0u8; SUPERBLOCK_SIZE];
        sb[0x00..0x04].copy_from_slice(&32u32.to_le_bytes());
        sb[0x04..0x08].copy_from_slice(&256u32.to_le_bytes());
        sb[0x14..0x18].copy_from_slice(&1u32.to_le_bytes());
        sb[0x20..0x24].copy_from_slice(&8192u32.to_le_bytes());
        sb[0x28..0x2C].copy_from_slice(&32u32.to_le_bytes());
        sb[0x38..0x3A].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
        sb[0x4C..0x50].copy_from_slice(&1u32.to_le_bytes());
        sb[0x54..0x58].copy_from_slice(&11u32.to_le_bytes());
        sb[0x58..0x5A].copy_from_slice(&(INODE_SIZE as u16).to_le_bytes());
        sb[0x60..0x64].copy_from_slice(&INCOMPAT_EXTENTS.to_le_bytes());
        sb[0x68..0x78].copy_from_slice(&[0xAB; 16]);
        sb[0x78..0x7F].copy_from_slice(b"testvol");
        sb
    }

    fn put_inode(image: &mut [u8], number: usize, raw: &[u8]) {
        let offset = INODE_TABLE_BLOCK * BLOCK + (number - 1) * INODE_SIZE;
        image[offset..offset + INODE_SIZE].copy_from_slice(raw);
    }

    /// 256 KiB image with 1 KiB blocks and one group:
    /// `/docs/a.txt` live, `gone.bin` deleted with its name left in the
    /// slack of `docs`, inode 15 corrupt, inode 16 deleted and unnamed
    pub(crate) fn sample_image() -> Vec<u8> {
        let mut image = vec![0u8; 256 * BLOCK];
        image[1024..2048].copy_from_slice(&superblock());

        let gdt = 2 * BLOCK;
        image[gdt + 0x04..gdt + 0x08].copy_from_slice(&(INODE_BITMAP_BLOCK as u32).to_le_bytes());
        image[gdt + 0x08..gdt + 0x0C].copy_from_slice(&(INODE_TABLE_BLOCK as u32).to_le_bytes());

        // Inodes 1-13 and 15 allocated
        image[INODE_BITMAP_BLOCK * BLOCK] = 0xFF;
        image[INODE_BITMAP_BLOCK * BLOCK + 1] = 0x5F;

        let mut root = raw_inode(S_IFDIR | 0o755, BLOCK as u64, 3, 0);
        set_extent(&mut root, 20, 1);
        put_inode(&mut image, 2, &root);

        let mut docs = raw_inode(S_IFDIR | 0o755, BLOCK as u64, 2, 0);
        set_extent(&mut docs, 21, 1);
        put_inode(&mut image, 12, &docs);

        let mut file = raw_inode(S_IFREG | 0o644, 100, 1, 0);
        set_extent(&mut file, 30, 1);
        put_inode(&mut image, 13, &file);

        let mut gone = raw_inode(S_IFREG | 0o644, 2048, 0, 1_650_000_000);
        set_extent(&mut gone, 31, 2);
        put_inode(&mut image, 14, &gone);

        put_inode(&mut image, 15, &raw_inode(S_IFREG | 0o644, u64::MAX, 1, 0));
        put_inode(&mut image, 16, &raw_inode(S_IFREG | 0o600, 0, 0, 1_650_000_000));

        let root_dir = 20 * BLOCK;
        put_dirent(&mut image[root_dir..root_dir + BLOCK], 0, 2, 12, ".", 2);
        put_dirent(&mut image[root_dir..root_dir + BLOCK], 12, 2, 12, "..", 2);
        put_dirent(&mut image[root_dir..root_dir + BLOCK], 24, 12, 1000, "docs", 2);

        let docs_dir = 21 * BLOCK;
        put_dirent(&mut image[docs_dir..docs_dir + BLOCK], 0, 12, 12, ".", 2);
        put_dirent(&mut image[docs_dir..docs_dir + BLOCK], 12, 2, 12, "..", 2);
        put_dirent(&mut image[docs_dir..docs_dir + BLOCK], 24, 13, 1000, "a.txt", 1);
        put_dirent(&mut image[docs_dir..docs_dir + BLOCK], 40, 14, 984, "gone.bin", 1);

        image
    }

    fn parse(image: Vec<u8>) -> (Vec<FileEntry>, Ext4Parser) {
        let device = MemoryDevice::new(image);
        let mut parser = Ext4Parser::new();
        let entries = parser
            .parse(&device, &mut ScanContext::new(ScanOptions::default()))
            .unwrap();
        (entries, parser)
    }

    #[test]
    fn test_superblock_fields() {
        let sb = Ext4Superblock::parse(&superblock()).unwrap();
        assert_eq!(sb.block_size(), 1024);
        assert_eq!(sb.group_count(), 1);
        assert_eq!(sb.descriptor_size(), 32);
        assert_eq!(sb.volume_name, "testvol");
        assert!(sb.uuid.is_some());
        assert!(!sb.has_journal());

        let mut bad = superblock();
        bad[0x18..0x1C].copy_from_slice(&9u32.to_le_bytes());
        assert!(Ext4Superblock::parse(&bad).is_err());

        let mut bad_magic = superblock();
        bad_magic[0x38] = 0;
        assert!(Ext4Superblock::parse(&bad_magic).is_err());
    }

    #[test]
    fn test_parse_inode_tables() {
        let (entries, parser) = parse(sample_image());
        let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 12, 13, 14, 16]);

        let stats = parser.recovery_stats();
        assert_eq!(stats.as_pair(), (5, 2));
        assert_eq!(stats.skipped, 1);

        let root = &entries[0];
        assert_eq!(root.path, "/");
        assert!(root.is_directory);

        let file = entries.iter().find(|e| e.id == 13).unwrap();
        assert_eq!(file.path, "/docs/a.txt");
        assert!(!file.is_deleted);
        assert_eq!(file.extents, vec![BlockRange::new(30, 1, 1024)]);
        assert!(file.recovery_confidence >= 0.8);
        assert!(file.creation_time.is_some());
    }

    #[test]
    fn test_deleted_names_from_slack() {
        let (entries, _) = parse(sample_image());

        let gone = entries.iter().find(|e| e.id == 14).unwrap();
        assert!(gone.is_deleted);
        assert_eq!(gone.path, "/docs/gone.bin");
        match &gone.fs_metadata {
            Some(FsSpecificMetadata::Ext4(meta)) => {
                assert!(meta.name_from_slack);
                assert_eq!(meta.deletion_time.unwrap().timestamp(), 1_650_000_000);
            }
            other => panic!("unexpected metadata {:?}", other),
        }

        let unnamed = entries.iter().find(|e| e.id == 16).unwrap();
        assert!(unnamed.is_deleted);
        assert_eq!(unnamed.path, "/$Orphan/<inode_16>");
    }

    #[test]
    fn test_header_only_image() {
        let mut image = vec![0u8; 1024 * 1024];
        image[1080..1082].copy_from_slice(&EXT4_MAGIC.to_le_bytes());
        let (entries, parser) = parse(image);
        assert!(entries.is_empty());
        assert_eq!(parser.recovery_stats().as_pair(), (0, 0));
        assert!(parser.superblock().is_some());
    }

    #[test]
    fn test_journal_info() {
        let mut image = sample_image();
        let sb = 1024;
        image[sb + 0x5C..sb + 0x60].copy_from_slice(&COMPAT_HAS_JOURNAL.to_le_bytes());
        image[sb + 0xE0..sb + 0xE4].copy_from_slice(&8u32.to_le_bytes());
        let mut journal = raw_inode(S_IFREG | 0o600, 64 * 1024, 1, 0);
        set_extent(&mut journal, 100, 64);
        put_inode(&mut image, 8, &journal);
        image[100 * BLOCK..101 * BLOCK].copy_from_slice(&jbd2_block(1024, 64));

        let (_, parser) = parse(image);
        let info = parser.journal_info().unwrap();
        assert_eq!(info.inode, 8);
        assert!(info.jbd2_valid);
        assert_eq!(info.jbd2_block_size, Some(1024));
        assert_eq!(info.location, Some(100 * 1024));

        let (_, no_journal) = parse(sample_image());
        assert!(no_journal.journal_info().is_none());
    }

    #[test]
    fn test_max_inodes_and_cancel() {
        let device = MemoryDevice::new(sample_image());
        let mut parser = Ext4Parser::new();
        let options = ScanOptions {
            max_inodes: Some(13),
            ..ScanOptions::default()
        };
        let entries = parser.parse(&device, &mut ScanContext::new(options)).unwrap();
        assert_eq!(entries.len(), 3);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut ctx = ScanContext::new(ScanOptions::default()).with_cancel(cancel);
        assert!(parser.parse(&device, &mut ctx).unwrap().is_empty());
    }

    /// `sample_image` relaid with 64-byte descriptors and INCOMPAT_64BIT
    fn sample_image_64bit() -> Vec<u8> {
        let mut image = sample_image();
        let sb = 1024;
        let incompat = INCOMPAT_EXTENTS | INCOMPAT_64BIT;
        image[sb + 0x60..sb + 0x64].copy_from_slice(&incompat.to_le_bytes());
        image[sb + 0xFE..sb + 0x100].copy_from_slice(&64u16.to_le_bytes());
        image
    }

    #[test]
    fn test_64bit_descriptors() {
        let (expected, _) = parse(sample_image());
        let (entries, parser) = parse(sample_image_64bit());
        assert_eq!(parser.superblock().unwrap().descriptor_size(), 64);
        assert_eq!(entries, expected);
        assert_eq!(parser.recovery_stats().as_pair(), (5, 2));
    }

    #[test]
    fn test_garbage_descriptor_hi_word_skips_group() {
        let mut image = sample_image_64bit();
        let gdt = 2 * BLOCK;
        image[gdt + 0x24..gdt + 0x28].copy_from_slice(&u32::MAX.to_le_bytes());
        image[gdt + 0x28..gdt + 0x2C].copy_from_slice(&u32::MAX.to_le_bytes());
        // A journal inode in the same group must not be located either
        let sb = 1024;
        image[sb + 0x5C..sb + 0x60].copy_from_slice(&COMPAT_HAS_JOURNAL.to_le_bytes());
        image[sb + 0xE0..sb + 0xE4].copy_from_slice(&8u32.to_le_bytes());

        let device = MemoryDevice::new(image);
        let mut parser = Ext4Parser::new();
        let mut ctx = ScanContext::new(ScanOptions::default());
        let entries = parser.parse(&device, &mut ctx).unwrap();

        assert!(entries.is_empty());
        assert_eq!(ctx.skipped(), 32);
        assert_eq!(parser.recovery_stats().skipped, 32);
        let journal = parser.journal_info().unwrap();
        assert_eq!(journal.location, None);
        assert!(!journal.jbd2_valid);
    }

    #[test]
    fn test_missing_group_descriptors_is_fatal() {
        let mut image = sample_image();
        image[1024 + 0x04..1024 + 0x08].copy_from_slice(&u32::MAX.to_le_bytes());
        image[1024 + 0x20..1024 + 0x24].copy_from_slice(&8u32.to_le_bytes());
        let device = MemoryDevice::new(image);
        let mut parser = Ext4Parser::new();
        let result = parser.parse(&device, &mut ScanContext::new(ScanOptions::default()));
        assert!(matches!(result, Err(RecoveryError::StructuralCorruption(_))));
    }
}
