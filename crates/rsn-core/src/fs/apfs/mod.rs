/// APFS support: container and volume superblocks, object maps and the
/// file-system tree
use anyhow::{bail, Context};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use uuid::Uuid;

pub mod btree;

use super::FilesystemParser;
use crate::device::BlockSource;
use crate::error::{RecoveryError, Result};
use crate::fs::common::{nanos_to_datetime, sanitize_name, u16_at, u32_at, u64_at};
use crate::recovery::confidence::{
    calculate_confidence_score, extents_valid, size_consistency, timestamps_plausible,
    RecordIntegrity,
};
use crate::recovery::directory::{DirectoryTree, ORPHAN_DIR};
use crate::recovery::{ParserProgress, ScanContext};
use crate::{ApfsFileMetadata, BlockRange, FileEntry, FilesystemType, FsSpecificMetadata, RecoveryStats};
use btree::{ApfsNode, FixedKv, TreeWalker, WalkStats};

// ============================================================================
// Constants
// ============================================================================

pub const NX_MAGIC: u32 = 0x4253_584E;
pub const APFS_MAGIC: u32 = 0x4253_5041;
const MAGIC_OFFSET: usize = 32;
pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 65536;
const NX_MAX_FILE_SYSTEMS: u32 = 100;

const OMAP_KV: FixedKv = FixedKv { key: 16, value: 16 };

const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const OBJ_TYPE_SHIFT: u32 = 60;
pub const APFS_TYPE_SNAP_METADATA: u8 = 1;
pub const APFS_TYPE_INODE: u8 = 3;
pub const APFS_TYPE_FILE_EXTENT: u8 = 8;
pub const APFS_TYPE_DIR_REC: u8 = 9;

pub const ROOT_DIR_PARENT: u64 = 1;
pub const ROOT_DIR_INO_NUM: u64 = 2;
pub const PRIV_DIR_INO_NUM: u64 = 3;

const INO_EXT_TYPE_NAME: u8 = 4;
const INO_EXT_TYPE_DSTREAM: u8 = 8;
const INODE_VAL_MIN_LEN: usize = 92;
const FILE_EXTENT_LEN_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;
const DREC_LEN_MASK: u32 = 0x0000_03FF;

const S_IFMT: u16 = 0xF000;
const S_IFDIR: u16 = 0x4000;

// ============================================================================
// Superblocks
// ============================================================================

/// `nx_superblock_t` fields the walk depends on
#[derive(Debug, Clone, PartialEq)]
pub struct NxSuperblock {
    pub block_size: u32,
    pub block_count: u64,
    pub uuid: Option<Uuid>,
    pub next_xid: u64,
    pub omap_oid: u64,
    pub fs_oids: Vec<u64>,
}

impl NxSuperblock {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 184 + 8 {
            bail!("Insufficient data for APFS container superblock");
        }
        let mut cursor = Cursor::new(data);
        cursor.set_position(MAGIC_OFFSET as u64);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != NX_MAGIC {
            bail!("Invalid container magic: 0x{:08X}", magic);
        }
        let block_size = cursor.read_u32::<LittleEndian>()?;
        let block_count = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(96);
        let next_xid = cursor.read_u64::<LittleEndian>()?;
        cursor.set_position(160);
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        cursor.set_position(180);
        let max_file_systems = cursor.read_u32::<LittleEndian>()?;

        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            bail!("Invalid container block size: {}", block_size);
        }
        if max_file_systems == 0 || max_file_systems > NX_MAX_FILE_SYSTEMS {
            bail!("Invalid volume count: {}", max_file_systems);
        }

        let fs_oids: Vec<u64> = (0..max_file_systems as usize)
            .filter_map(|i| u64_at(data, 184 + i * 8))
            .filter(|&oid| oid != 0)
            .collect();
        if fs_oids.is_empty() {
            bail!("Container lists no volumes");
        }

        Ok(Self {
            block_size,
            block_count,
            uuid: uuid_at(data, 72),
            next_xid,
            omap_oid,
            fs_oids,
        })
    }
}

/// `apfs_superblock_t` fields the walk depends on
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSuperblock {
    pub fs_index: u32,
    pub omap_oid: u64,
    pub root_tree_oid: u64,
    pub snap_meta_tree_oid: u64,
    pub num_files: u64,
    pub num_directories: u64,
    pub num_snapshots: u64,
    pub uuid: Option<Uuid>,
    pub name: String,
}

impl VolumeSuperblock {
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 704 + 256 {
            bail!("Insufficient data for APFS volume superblock");
        }
        let mut cursor = Cursor::new(data);
        cursor.set_position(MAGIC_OFFSET as u64);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != APFS_MAGIC {
            bail!("Invalid volume magic: 0x{:08X}", magic);
        }
        let fs_index = cursor.read_u32::<LittleEndian>()?;

        cursor.set_position(128);
        let omap_oid = cursor.read_u64::<LittleEndian>()?;
        let root_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let _extentref_tree_oid = cursor.read_u64::<LittleEndian>()?;
        let snap_meta_tree_oid = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(184);
        let num_files = cursor.read_u64::<LittleEndian>()?;
        let num_directories = cursor.read_u64::<LittleEndian>()?;
        cursor.set_position(216);
        let num_snapshots = cursor.read_u64::<LittleEndian>()?;

        if omap_oid == 0 || root_tree_oid == 0 {
            bail!("Volume has no object map or root tree");
        }

        Ok(Self {
            fs_index,
            omap_oid,
            root_tree_oid,
            snap_meta_tree_oid,
            num_files,
            num_directories,
            num_snapshots,
            uuid: uuid_at(data, 240),
            name: c_string(&data[704..704 + 256]),
        })
    }
}

fn uuid_at(data: &[u8], offset: usize) -> Option<Uuid> {
    let raw: [u8; 16] = data.get(offset..offset + 16)?.try_into().ok()?;
    let uuid = Uuid::from_bytes(raw);
    (!uuid.is_nil()).then_some(uuid)
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// ============================================================================
// File-system records
// ============================================================================

/// APFS point-in-time snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApfsSnapshot {
    pub xid: u64,
    pub name: String,
    pub create_time: Option<DateTime<Utc>>,
    pub volume: String,
}

#[derive(Debug, Clone, PartialEq)]
struct InodeRecord {
    id: u64,
    parent_id: u64,
    private_id: u64,
    created: Option<DateTime<Utc>>,
    modified: Option<DateTime<Utc>>,
    nlink: i32,
    owner: u32,
    group: u32,
    mode: u16,
    size: u64,
    name: Option<String>,
    xid: u64,
    checksum_valid: bool,
}

impl InodeRecord {
    fn parse(id: u64, value: &[u8]) -> anyhow::Result<Self> {
        if value.len() < INODE_VAL_MIN_LEN {
            bail!("inode {} value is {} bytes", id, value.len());
        }
        let mut cursor = Cursor::new(value);
        let parent_id = cursor.read_u64::<LittleEndian>()?;
        let private_id = cursor.read_u64::<LittleEndian>()?;
        let create_time = cursor.read_u64::<LittleEndian>()?;
        let mod_time = cursor.read_u64::<LittleEndian>()?;

        cursor.set_position(56);
        let nlink = cursor.read_i32::<LittleEndian>()?;
        cursor.set_position(72);
        let owner = cursor.read_u32::<LittleEndian>()?;
        let group = cursor.read_u32::<LittleEndian>()?;
        let mode = cursor.read_u16::<LittleEndian>()?;

        let (name, size) = parse_xfields(&value[INODE_VAL_MIN_LEN..]);

        Ok(Self {
            id,
            parent_id,
            private_id,
            created: nanos_to_datetime(create_time),
            modified: nanos_to_datetime(mod_time),
            nlink,
            owner,
            group,
            mode,
            size: size.unwrap_or(0),
            name,
            xid: 0,
            checksum_valid: false,
        })
    }

    fn is_directory(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Extended fields: the original name and the data stream size
fn parse_xfields(blob: &[u8]) -> (Option<String>, Option<u64>) {
    let count = u16_at(blob, 0).unwrap_or(0) as usize;
    let mut data_offset = 4 + count * 4;
    let mut name = None;
    let mut size = None;

    for i in 0..count {
        let header = 4 + i * 4;
        let (Some(&x_type), Some(x_size)) = (blob.get(header), u16_at(blob, header + 2)) else {
            break;
        };
        let x_size = x_size as usize;
        let Some(field) = blob.get(data_offset..data_offset + x_size) else {
            break;
        };
        match x_type {
            INO_EXT_TYPE_NAME => name = Some(c_string(field)).filter(|n| !n.is_empty()),
            INO_EXT_TYPE_DSTREAM => size = u64_at(field, 0),
            _ => {}
        }
        data_offset += (x_size + 7) & !7;
    }
    (name, size)
}

/// A `DIR_REC` entry: `name` in directory `parent` is `file_id`
#[derive(Debug, Clone, PartialEq)]
struct DirRecord {
    parent: u64,
    name: String,
    file_id: u64,
}

impl DirRecord {
    /// Hashed keys carry a 10-bit length next to the hash; older volumes
    /// use a plain u16 length. The key length tells them apart.
    fn parse(parent: u64, key: &[u8], value: &[u8]) -> Option<Self> {
        let hashed_len = (u32_at(key, 8)? & DREC_LEN_MASK) as usize;
        let raw_name = if 12 + hashed_len == key.len() {
            &key[12..]
        } else {
            let plain_len = u16_at(key, 8)? as usize;
            key.get(10..10 + plain_len)?
        };
        let name = c_string(raw_name);
        if name.is_empty() {
            return None;
        }
        Some(Self {
            parent,
            name,
            file_id: u64_at(value, 0)?,
        })
    }
}

fn decode_key_header(key: &[u8]) -> Option<(u64, u8)> {
    let raw = u64_at(key, 0)?;
    Some((raw & OBJ_ID_MASK, (raw >> OBJ_TYPE_SHIFT) as u8))
}

/// Everything collected from one volume's file-system tree
#[derive(Default)]
struct VolumeRecords {
    inodes: Vec<InodeRecord>,
    dir_records: Vec<DirRecord>,
    /// Keyed by data stream id, sorted by logical offset afterwards
    extents: HashMap<u64, Vec<(u64, BlockRange)>>,
    malformed: u64,
}

// ============================================================================
// Parser
// ============================================================================

/// Object-map and B-tree based parser
pub struct ApfsParser {
    stats: RecoveryStats,
    container: Option<NxSuperblock>,
    volumes: Vec<VolumeSuperblock>,
    snapshots: Vec<ApfsSnapshot>,
}

impl Default for ApfsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ApfsParser {
    pub fn new() -> Self {
        Self {
            stats: RecoveryStats::default(),
            container: None,
            volumes: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn container(&self) -> Option<&NxSuperblock> {
        self.container.as_ref()
    }

    /// Volumes walked by the last parse
    pub fn volumes(&self) -> &[VolumeSuperblock] {
        &self.volumes
    }

    /// Snapshots found by the last parse, empty if none
    pub fn snapshots(&self) -> &[ApfsSnapshot] {
        &self.snapshots
    }

    fn read_container(source: &dyn BlockSource) -> anyhow::Result<NxSuperblock> {
        let head = source.read_at(0, MIN_BLOCK_SIZE as usize)?;
        let nx = NxSuperblock::parse(&head)?;
        if nx.block_size as u64 > source.size() {
            bail!("Block size {} exceeds device size", nx.block_size);
        }
        Ok(nx)
    }

    /// Load an object map into oid -> physical block, keeping the newest
    /// mapping of each oid
    fn load_omap(
        walker: &TreeWalker<'_>,
        omap_oid: u64,
        ctx: &ScanContext<'_>,
    ) -> anyhow::Result<(HashMap<u64, u64>, WalkStats)> {
        let source_block = walker
            .read_object(omap_oid)
            .with_context(|| format!("object map at block {}", omap_oid))?;
        let tree_oid = u64_at(&source_block, 48).context("object map header")?;

        let omap_walker = walker.with_fixed(OMAP_KV);
        let mut newest: HashMap<u64, (u64, u64)> = HashMap::new();
        let stats = omap_walker.walk(tree_oid, &|oid| Some(oid), ctx, |node, i| {
            let key = node.key(i);
            let value = node.value(i);
            let (Some(oid), Some(xid), Some(paddr)) =
                (u64_at(key, 0), u64_at(key, 8), u64_at(value, 8))
            else {
                return;
            };
            let slot = newest.entry(oid).or_insert((xid, paddr));
            if xid >= slot.0 {
                *slot = (xid, paddr);
            }
        });

        Ok((
            newest.into_iter().map(|(oid, (_, paddr))| (oid, paddr)).collect(),
            stats,
        ))
    }

    fn collect_records(
        walker: &TreeWalker<'_>,
        root: u64,
        omap: &HashMap<u64, u64>,
        block_size: u32,
        ctx: &ScanContext<'_>,
    ) -> (VolumeRecords, WalkStats) {
        let mut records = VolumeRecords::default();
        let resolve = |oid: u64| omap.get(&oid).copied();

        let stats = walker.walk(root, &resolve, ctx, |node: &ApfsNode, i| {
            let key = node.key(i);
            let value = node.value(i);
            let Some((obj_id, kind)) = decode_key_header(key) else {
                records.malformed += 1;
                return;
            };
            match kind {
                APFS_TYPE_INODE => match InodeRecord::parse(obj_id, value) {
                    Ok(mut inode) => {
                        inode.xid = node.xid;
                        inode.checksum_valid = node.checksum_valid;
                        records.inodes.push(inode);
                    }
                    Err(e) => {
                        tracing::debug!("Skipping inode record: {}", e);
                        records.malformed += 1;
                    }
                },
                APFS_TYPE_DIR_REC => match DirRecord::parse(obj_id, key, value) {
                    Some(record) => records.dir_records.push(record),
                    None => records.malformed += 1,
                },
                APFS_TYPE_FILE_EXTENT => {
                    let (Some(logical), Some(len_flags), Some(phys)) =
                        (u64_at(key, 8), u64_at(value, 0), u64_at(value, 8))
                    else {
                        records.malformed += 1;
                        return;
                    };
                    let length = len_flags & FILE_EXTENT_LEN_MASK;
                    if phys != 0 && length > 0 {
                        let blocks = length.div_ceil(block_size as u64);
                        records
                            .extents
                            .entry(obj_id)
                            .or_default()
                            .push((logical, BlockRange::new(phys, blocks, block_size)));
                    }
                }
                _ => {}
            }
        });

        for extents in records.extents.values_mut() {
            extents.sort_by_key(|(logical, _)| *logical);
        }
        (records, stats)
    }

    fn collect_snapshots(
        walker: &TreeWalker<'_>,
        volume: &VolumeSuperblock,
        ctx: &ScanContext<'_>,
    ) -> Vec<ApfsSnapshot> {
        if volume.snap_meta_tree_oid == 0 {
            return Vec::new();
        }
        let mut snapshots = Vec::new();
        walker.walk(volume.snap_meta_tree_oid, &|oid| Some(oid), ctx, |node, i| {
            let Some((xid, APFS_TYPE_SNAP_METADATA)) = decode_key_header(node.key(i)) else {
                return;
            };
            let value = node.value(i);
            let name_len = u16_at(value, 48).unwrap_or(0) as usize;
            let name = value.get(50..50 + name_len).map(c_string).unwrap_or_default();
            snapshots.push(ApfsSnapshot {
                xid,
                name,
                create_time: u64_at(value, 16).and_then(nanos_to_datetime),
                volume: volume.name.clone(),
            });
        });
        snapshots
    }

    fn build_entries(
        records: &VolumeRecords,
        volume: &VolumeSuperblock,
        prefix: Option<&str>,
        device_size: u64,
        ctx: &ScanContext<'_>,
    ) -> Vec<FileEntry> {
        let mut tree = DirectoryTree::new(ROOT_DIR_INO_NUM, ctx.options().max_tree_depth);
        let mut linked = HashSet::new();
        for record in &records.dir_records {
            tree.insert(record.file_id, sanitize_name(&record.name), record.parent);
            linked.insert(record.file_id);
        }
        for inode in &records.inodes {
            if let Some(name) = &inode.name {
                tree.insert_residual(inode.id, sanitize_name(name), inode.parent_id);
            }
        }

        let resolve_paths = ctx.options().resolve_paths;
        records
            .inodes
            .iter()
            .map(|inode| {
                let special = inode.id == ROOT_DIR_INO_NUM || inode.id == PRIV_DIR_INO_NUM;
                let orphaned = !special && !linked.contains(&inode.id);
                let unlinked = !inode.is_directory() && inode.nlink <= 0;

                let name = if inode.id == ROOT_DIR_INO_NUM {
                    "/".to_string()
                } else {
                    tree.name_of(inode.id)
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("<inode_{}>", inode.id))
                };
                let path = if !resolve_paths {
                    name.clone()
                } else {
                    let path = tree
                        .resolve(inode.id)
                        .unwrap_or_else(|| format!("/{}/{}", ORPHAN_DIR, name));
                    match prefix {
                        Some(volume) if path == "/" => format!("/{}", volume),
                        Some(volume) => format!("/{}{}", volume, path),
                        None => path,
                    }
                };

                let extents: Vec<BlockRange> = records
                    .extents
                    .get(&inode.private_id)
                    .map(|list| list.iter().map(|(_, range)| *range).collect())
                    .unwrap_or_default();

                let integrity = RecordIntegrity {
                    signature_valid: true,
                    name_decoded: tree.contains(inode.id) || inode.id == ROOT_DIR_INO_NUM,
                    type_known: inode.mode & S_IFMT != 0,
                    size_consistency: if inode.is_directory() {
                        1.0
                    } else {
                        size_consistency(inode.size, &extents, false)
                    },
                    timestamps_plausible: timestamps_plausible(
                        &[inode.created, inode.modified],
                        Utc::now(),
                    ),
                    extents_valid: extents_valid(&extents, device_size),
                    checksum_verified: Some(inode.checksum_valid),
                };

                FileEntry {
                    id: inode.id,
                    path,
                    name,
                    size: inode.size,
                    is_directory: inode.is_directory(),
                    is_deleted: unlinked || orphaned,
                    creation_time: inode.created,
                    modification_time: inode.modified,
                    recovery_confidence: calculate_confidence_score(&integrity),
                    extents,
                    fs_metadata: Some(FsSpecificMetadata::Apfs(ApfsFileMetadata {
                        volume_name: volume.name.clone(),
                        object_id: inode.id,
                        parent_id: inode.parent_id,
                        link_count: inode.nlink.max(0) as u32,
                        mode: inode.mode,
                        owner: inode.owner,
                        group: inode.group,
                        transaction_id: inode.xid,
                        orphaned,
                    })),
                }
            })
            .collect()
    }
}

impl FilesystemParser for ApfsParser {
    fn filesystem_type(&self) -> FilesystemType {
        FilesystemType::Apfs
    }

    fn can_handle(&self, source: &dyn BlockSource) -> bool {
        Self::read_container(source).is_ok()
    }

    fn parse(
        &mut self,
        source: &dyn BlockSource,
        ctx: &mut ScanContext<'_>,
    ) -> Result<Vec<FileEntry>> {
        let nx = Self::read_container(source)
            .context("APFS container superblock")
            .map_err(RecoveryError::corruption)?;
        tracing::info!(
            "APFS: {}-byte blocks, {} blocks, {} volume slot(s)",
            nx.block_size,
            nx.block_count,
            nx.fs_oids.len()
        );

        let options = ctx.options().clone();
        let walker = TreeWalker::new(
            source,
            nx.block_size,
            options.max_btree_nodes,
            options.max_tree_depth,
        );
        let skipped_before = ctx.skipped();

        let (container_omap, omap_stats) = Self::load_omap(&walker, nx.omap_oid, ctx)
            .context("container object map")
            .map_err(RecoveryError::corruption)?;
        record_walk_skips(ctx, &omap_stats);

        let mut volumes = Vec::new();
        for &oid in &nx.fs_oids {
            let volume = container_omap
                .get(&oid)
                .context("volume oid not in the container object map")
                .and_then(|&paddr| walker.read_object(paddr))
                .and_then(|block| VolumeSuperblock::parse(&block));
            match volume {
                Ok(volume) => volumes.push(volume),
                Err(e) => {
                    tracing::warn!("Skipping APFS volume {}: {:#}", oid, e);
                    ctx.record_skip();
                }
            }
        }
        if volumes.is_empty() {
            return Err(RecoveryError::StructuralCorruption(
                "APFS container has no valid volume superblock".to_string(),
            ));
        }

        let multi_volume = volumes.len() > 1;
        let mut entries = Vec::new();
        let mut snapshots = Vec::new();
        let total = volumes.len() as u64;

        for (done, volume) in volumes.iter().enumerate() {
            if ctx.is_cancelled() {
                tracing::info!("APFS walk cancelled after {} volume(s)", done);
                break;
            }
            ctx.report(ParserProgress {
                operation: "Walking volume trees",
                units_done: done as u64,
                units_total: total,
                files_found: entries.len(),
                deleted_found: entries.iter().filter(|e: &&FileEntry| e.is_deleted).count(),
            });
            tracing::info!(
                "APFS volume '{}': {} files, {} directories, {} snapshots",
                volume.name,
                volume.num_files,
                volume.num_directories,
                volume.num_snapshots
            );

            let omap = match Self::load_omap(&walker, volume.omap_oid, ctx) {
                Ok((omap, stats)) => {
                    record_walk_skips(ctx, &stats);
                    omap
                }
                Err(e) => {
                    tracing::warn!("Volume '{}' object map unreadable: {:#}", volume.name, e);
                    ctx.record_skip();
                    continue;
                }
            };

            let (records, stats) =
                Self::collect_records(&walker, volume.root_tree_oid, &omap, nx.block_size, ctx);
            record_walk_skips(ctx, &stats);
            for _ in 0..records.malformed {
                ctx.record_skip();
            }

            let prefix = multi_volume.then_some(volume.name.as_str());
            entries.extend(Self::build_entries(&records, volume, prefix, source.size(), ctx));
            snapshots.extend(Self::collect_snapshots(&walker, volume, ctx));
        }

        ctx.report(ParserProgress {
            operation: "Walking volume trees",
            units_done: total,
            units_total: total,
            files_found: entries.len(),
            deleted_found: entries.iter().filter(|e| e.is_deleted).count(),
        });

        self.stats = RecoveryStats::from_entries(&entries, ctx.skipped() - skipped_before);
        self.container = Some(nx);
        self.volumes = volumes;
        self.snapshots = snapshots;
        tracing::info!(
            "APFS: {} entries ({} deleted), {} snapshots, {} items skipped",
            self.stats.total_recoverable,
            self.stats.total_deleted,
            self.snapshots.len(),
            self.stats.skipped
        );
        Ok(entries)
    }

    fn recovery_stats(&self) -> RecoveryStats {
        self.stats
    }
}

fn record_walk_skips(ctx: &mut ScanContext<'_>, stats: &WalkStats) {
    for _ in 0..stats.unreadable + stats.cycles {
        ctx.record_skip();
    }
}
