/// ext4 inode records and block mapping (extent trees, direct pointers)
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::device::BlockSource;
use crate::fs::common::{u16_at, u32_at, unix_to_datetime};
use crate::BlockRange;

pub const S_IFMT: u16 = 0xF000;
pub const S_IFSOCK: u16 = 0xC000;
pub const S_IFLNK: u16 = 0xA000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFBLK: u16 = 0x6000;
pub const S_IFDIR: u16 = 0x4000;
pub const S_IFCHR: u16 = 0x2000;
pub const S_IFIFO: u16 = 0x1000;

pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

pub const EXTENT_MAGIC: u16 = 0xF30A;
/// Extent lengths above this mark uninitialized (preallocated) extents
const EXT_INIT_MAX_LEN: u16 = 32768;
/// Deepest extent tree the kernel builds
const EXT4_MAX_EXTENT_DEPTH: u16 = 5;

const GOOD_OLD_INODE_SIZE: usize = 128;
const I_BLOCK_OFFSET: usize = 0x28;
const I_BLOCK_LEN: usize = 60;
const DIRECT_BLOCKS: usize = 12;

/// Decoded fields of one inode slot
#[derive(Debug, Clone, PartialEq)]
pub struct Ext4Inode {
    pub number: u32,
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub links_count: u16,
    pub flags: u32,
    pub accessed: Option<DateTime<Utc>>,
    pub changed: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    /// Raw `i_dtime`; non-zero means the inode was deleted
    pub dtime: u32,
    pub block: [u8; I_BLOCK_LEN],
}

impl Ext4Inode {
    /// Decode an inode slot.
    ///
    /// `Ok(None)` is a slot that was never used. Values no real inode can
    /// hold are errors.
    pub fn parse(
        raw: &[u8],
        number: u32,
        inode_size: usize,
        max_file_size: u64,
    ) -> Result<Option<Self>> {
        if raw.len() < GOOD_OLD_INODE_SIZE || raw.len() < inode_size {
            bail!("inode {} truncated to {} bytes", number, raw.len());
        }
        if raw[..GOOD_OLD_INODE_SIZE].iter().all(|&b| b == 0) {
            return Ok(None);
        }

        let field16 = |offset| u16_at(raw, offset).unwrap_or(0);
        let field32 = |offset| u32_at(raw, offset).unwrap_or(0);

        let mode = field16(0x00);
        let file_type = mode & S_IFMT;
        if !matches!(
            file_type,
            0 | S_IFSOCK | S_IFLNK | S_IFREG | S_IFBLK | S_IFDIR | S_IFCHR | S_IFIFO
        ) {
            bail!("inode {} has invalid mode 0x{:04X}", number, mode);
        }

        let size = field32(0x04) as u64 | ((field32(0x6C) as u64) << 32);
        if size > max_file_size {
            bail!("inode {} size {} exceeds the format maximum", number, size);
        }

        let extra_isize = if inode_size > GOOD_OLD_INODE_SIZE {
            let extra = field16(0x80) as usize;
            if extra > inode_size - GOOD_OLD_INODE_SIZE || extra % 4 != 0 {
                bail!("inode {} has bad extra size {}", number, extra);
            }
            extra
        } else {
            0
        };
        let extra = |offset: usize, needed: usize| {
            (extra_isize >= needed).then(|| field32(GOOD_OLD_INODE_SIZE + offset))
        };

        let mut block = [0u8; I_BLOCK_LEN];
        block.copy_from_slice(&raw[I_BLOCK_OFFSET..I_BLOCK_OFFSET + I_BLOCK_LEN]);

        let created = match extra(0x10, 0x18) {
            Some(crtime) => unix_to_datetime(crtime, extra(0x14, 0x18)),
            None => None,
        };

        Ok(Some(Self {
            number,
            mode,
            uid: field16(0x02) as u32 | ((field16(0x78) as u32) << 16),
            gid: field16(0x18) as u32 | ((field16(0x7A) as u32) << 16),
            size,
            links_count: field16(0x1A),
            flags: field32(0x20),
            accessed: unix_to_datetime(field32(0x08), extra(0x0C, 0x10)),
            changed: unix_to_datetime(field32(0x0C), extra(0x04, 0x08)),
            modified: unix_to_datetime(field32(0x10), extra(0x08, 0x0C)),
            created,
            dtime: field32(0x14),
            block,
        }))
    }

    pub fn file_type(&self) -> u16 {
        self.mode & S_IFMT
    }

    pub fn is_directory(&self) -> bool {
        self.file_type() == S_IFDIR
    }

    pub fn uses_extents(&self) -> bool {
        self.flags & EXT4_EXTENTS_FL != 0
    }

    /// Content lives inside the inode (inline data or a fast symlink)
    pub fn is_inline(&self) -> bool {
        self.flags & EXT4_INLINE_DATA_FL != 0
            || (self.file_type() == S_IFLNK && !self.uses_extents() && self.size < I_BLOCK_LEN as u64)
    }

    pub fn deletion_time(&self) -> Option<DateTime<Utc>> {
        unix_to_datetime(self.dtime, None)
    }
}

/// Resolves an inode's data blocks
pub struct BlockMapper<'a> {
    source: &'a dyn BlockSource,
    block_size: u32,
    total_blocks: u64,
    max_depth: u32,
}

impl<'a> BlockMapper<'a> {
    pub fn new(source: &'a dyn BlockSource, block_size: u32, total_blocks: u64, max_depth: u32) -> Self {
        Self {
            source,
            block_size,
            total_blocks,
            max_depth,
        }
    }

    /// Data extents of `inode`, merged where contiguous
    pub fn extents(&self, inode: &Ext4Inode) -> Result<Vec<BlockRange>> {
        if inode.is_inline() {
            return Ok(Vec::new());
        }
        let mut ranges = if inode.uses_extents() {
            let mut ranges = Vec::new();
            let mut visited = HashSet::new();
            self.walk_extent_node(&inode.block, 0, &mut visited, &mut ranges)?;
            ranges
        } else {
            self.direct_blocks(&inode.block)
        };
        ranges.retain(|r| r.block_count > 0);
        Ok(merge_ranges(ranges))
    }

    fn walk_extent_node(
        &self,
        node: &[u8],
        level: u32,
        visited: &mut HashSet<u64>,
        out: &mut Vec<BlockRange>,
    ) -> Result<()> {
        let header = ExtentHeader::parse(node)?;
        if level > self.max_depth || header.depth > EXT4_MAX_EXTENT_DEPTH {
            bail!("extent tree deeper than {}", self.max_depth.min(EXT4_MAX_EXTENT_DEPTH as u32));
        }

        for i in 0..header.entries as usize {
            let entry = 12 + i * 12;
            if entry + 12 > node.len() {
                bail!("extent entry {} past end of node", i);
            }
            if header.depth == 0 {
                let raw_len = u16_at(node, entry + 4).unwrap_or(0);
                let len = if raw_len > EXT_INIT_MAX_LEN {
                    raw_len - EXT_INIT_MAX_LEN
                } else {
                    raw_len
                };
                let start_hi = u16_at(node, entry + 6).unwrap_or(0) as u64;
                let start_lo = u32_at(node, entry + 8).unwrap_or(0) as u64;
                out.push(BlockRange::new((start_hi << 32) | start_lo, len as u64, self.block_size));
            } else {
                let leaf_lo = u32_at(node, entry + 4).unwrap_or(0) as u64;
                let leaf_hi = u16_at(node, entry + 8).unwrap_or(0) as u64;
                let child = (leaf_hi << 32) | leaf_lo;
                if child == 0 || child >= self.total_blocks {
                    bail!("extent index points outside the filesystem: {}", child);
                }
                if !visited.insert(child) {
                    bail!("extent tree revisits block {}", child);
                }
                let data = self
                    .source
                    .read_at(child * self.block_size as u64, self.block_size as usize)?;
                let child_header = ExtentHeader::parse(&data)?;
                if child_header.depth + 1 != header.depth {
                    bail!("extent node {} has inconsistent depth", child);
                }
                self.walk_extent_node(&data, level + 1, visited, out)?;
            }
        }
        Ok(())
    }

    fn direct_blocks(&self, block: &[u8]) -> Vec<BlockRange> {
        (0..DIRECT_BLOCKS)
            .filter_map(|i| u32_at(block, i * 4))
            .filter(|&b| b != 0 && (b as u64) < self.total_blocks)
            .map(|b| BlockRange::new(b as u64, 1, self.block_size))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct ExtentHeader {
    entries: u16,
    depth: u16,
}

impl ExtentHeader {
    fn parse(data: &[u8]) -> Result<Self> {
        let magic = u16_at(data, 0).unwrap_or(0);
        if magic != EXTENT_MAGIC {
            bail!("bad extent header magic 0x{:04X}", magic);
        }
        let entries = u16_at(data, 2).unwrap_or(0);
        let max = u16_at(data, 4).unwrap_or(0);
        if entries > max {
            bail!("extent header has {} entries but room for {}", entries, max);
        }
        Ok(Self {
            entries,
            depth: u16_at(data, 6).unwrap_or(0),
        })
    }
}

fn merge_ranges(ranges: Vec<BlockRange>) -> Vec<BlockRange> {
    let mut merged: Vec<BlockRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if last.end_block() == range.start_block => {
                last.block_count += range.block_count;
            }
            _ => merged.push(range),
        }
    }
    merged
}
