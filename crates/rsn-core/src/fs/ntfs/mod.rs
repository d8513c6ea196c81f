/// NTFS support: boot sector validation and MFT walk
use anyhow::{bail, Context};
use byteorder::{LittleEndian, ReadBytesExt};
use chrono::Utc;
use std::io::Cursor;

pub mod mft;

use super::FilesystemParser;
use crate::device::BlockSource;
use crate::error::{RecoveryError, Result};
use crate::fs::common::sanitize_name;
use crate::recovery::confidence::{
    calculate_confidence_score, extents_valid, size_consistency, timestamps_plausible,
    RecordIntegrity,
};
use crate::recovery::directory::DirectoryTree;
use crate::recovery::{ParserProgress, ScanContext};
use crate::{BlockRange, FileEntry, FilesystemType, FsSpecificMetadata, NtfsFileMetadata, RecoveryStats};
use mft::{DataStream, MftRecord};

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const DEFAULT_RECORD_SIZE: u32 = 1024;
/// Record number of the root directory
pub const ROOT_RECORD: u64 = 5;

/// Fields of the NTFS boot sector the walk depends on
#[derive(Debug, Clone, PartialEq)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u32,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub record_size: u32,
    pub serial_number: u64,
}

impl NtfsBootSector {
    /// Parse and sanity-check the boot sector
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < BOOT_SECTOR_SIZE {
            bail!("Insufficient data for NTFS boot sector");
        }
        if &data[3..11] != super::detect::NTFS_OEM_ID {
            bail!("Missing NTFS OEM id");
        }

        let mut cursor = Cursor::new(data);
        cursor.set_position(0x0B);
        let bytes_per_sector = cursor.read_u16::<LittleEndian>()?;
        let raw_spc = cursor.read_u8()?;

        cursor.set_position(0x28);
        let total_sectors = cursor.read_u64::<LittleEndian>()?;
        let mft_lcn = cursor.read_u64::<LittleEndian>()?;
        let mft_mirror_lcn = cursor.read_u64::<LittleEndian>()?;
        let raw_record_size = cursor.read_i8()?;

        cursor.set_position(0x48);
        let serial_number = cursor.read_u64::<LittleEndian>()?;

        if !bytes_per_sector.is_power_of_two() || !(256..=4096).contains(&bytes_per_sector) {
            bail!("Invalid bytes per sector: {}", bytes_per_sector);
        }

        // Values above 0x80 encode 2^(256 - n) on volumes with huge clusters
        let sectors_per_cluster = match raw_spc {
            0 => bail!("Zero sectors per cluster"),
            1..=0x80 => raw_spc as u32,
            n => 1u32 << (256 - n as u32).min(31),
        };
        if !sectors_per_cluster.is_power_of_two() {
            bail!("Invalid sectors per cluster: {}", sectors_per_cluster);
        }
        let cluster_size = bytes_per_sector as u64 * sectors_per_cluster as u64;
        if cluster_size > 2 * 1024 * 1024 {
            bail!("Cluster size {} out of range", cluster_size);
        }

        let record_size = match raw_record_size {
            0 => DEFAULT_RECORD_SIZE as u64,
            n if n > 0 => n as u64 * cluster_size,
            n => 1u64 << (-(n as i32)).min(31),
        };
        if !record_size.is_power_of_two() || !(256..=65536).contains(&record_size) {
            bail!("Invalid MFT record size: {}", record_size);
        }
        if mft_lcn == 0 {
            bail!("MFT start cluster is zero");
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            total_sectors,
            mft_lcn,
            mft_mirror_lcn,
            record_size: record_size as u32,
            serial_number,
        })
    }

    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn mft_offset(&self) -> u64 {
        self.mft_lcn.saturating_mul(self.cluster_size())
    }
}

/// Byte spans of the MFT on disk
#[derive(Debug, Clone, PartialEq)]
struct MftLayout {
    spans: Vec<(u64, u64)>,
    record_size: u64,
}

impl MftLayout {
    fn record_count(&self) -> u64 {
        self.spans.iter().map(|(_, len)| len / self.record_size).sum()
    }

    fn record_offset(&self, index: u64) -> Option<u64> {
        let mut remaining = index;
        for &(start, len) in &self.spans {
            let in_span = len / self.record_size;
            if remaining < in_span {
                return Some(start + remaining * self.record_size);
            }
            remaining -= in_span;
        }
        None
    }
}

/// MFT-based parser
pub struct NtfsParser {
    stats: RecoveryStats,
    boot_sector: Option<NtfsBootSector>,
}

impl Default for NtfsParser {
    fn default() -> Self {
        Self::new()
    }
}

impl NtfsParser {
    pub fn new() -> Self {
        Self {
            stats: RecoveryStats::default(),
            boot_sector: None,
        }
    }

    /// Boot sector of the last parsed volume
    pub fn boot_sector(&self) -> Option<&NtfsBootSector> {
        self.boot_sector.as_ref()
    }

    fn read_boot_sector(source: &dyn BlockSource) -> anyhow::Result<NtfsBootSector> {
        let data = source.read_at(0, BOOT_SECTOR_SIZE)?;
        let boot = NtfsBootSector::parse(&data)?;
        if boot.mft_offset() >= source.size() {
            bail!(
                "MFT offset {} beyond device size {}",
                boot.mft_offset(),
                source.size()
            );
        }
        Ok(boot)
    }

    /// Use record 0's own `$DATA` runs; fall back to a contiguous span
    fn mft_layout(
        source: &dyn BlockSource,
        boot: &NtfsBootSector,
        max_records: u64,
    ) -> MftLayout {
        let record_size = boot.record_size as u64;
        let cluster = boot.cluster_size();
        let device_size = source.size();

        let from_runs = source
            .read_at(boot.mft_offset(), record_size as usize)
            .ok()
            .and_then(|raw| mft::parse_record(&raw, 0).ok().flatten())
            .and_then(|record| match record.data {
                Some(DataStream::NonResident { runs, .. }) => Some(runs),
                _ => None,
            })
            .map(|runs| {
                runs.iter()
                    .filter_map(|run| {
                        let start = run.lcn?.checked_mul(cluster)?;
                        let len = run.length.checked_mul(cluster)?;
                        let end = start.checked_add(len)?.min(device_size);
                        (end > start).then_some((start, end - start))
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|spans| !spans.is_empty());

        if let Some(spans) = from_runs {
            tracing::debug!("MFT spans from $MFT data runs: {:?}", spans);
            return MftLayout { spans, record_size };
        }

        let available = device_size.saturating_sub(boot.mft_offset()) / record_size;
        let count = available.min(max_records);
        tracing::warn!(
            "$MFT data runs unreadable, assuming {} contiguous records",
            count
        );
        MftLayout {
            spans: vec![(boot.mft_offset(), count * record_size)],
            record_size,
        }
    }

    fn build_entry(
        record: &MftRecord,
        tree: &mut DirectoryTree,
        boot: &NtfsBootSector,
        device_size: u64,
        resolve_paths: bool,
    ) -> FileEntry {
        let cluster = boot.cluster_size() as u32;
        let file_name = record.file_name.as_ref();

        let name = match file_name {
            Some(fname) if !fname.name.is_empty() => sanitize_name(&fname.name),
            _ => format!("record_{}", record.record_number),
        };
        let path = if !resolve_paths {
            name.clone()
        } else if file_name.is_some() {
            tree.resolve(record.record_number)
                .unwrap_or_else(|| format!("/{}", name))
        } else {
            format!("/{}/{}", crate::recovery::directory::ORPHAN_DIR, name)
        };

        let (size, extents, resident) = match &record.data {
            Some(DataStream::Resident { size }) => (*size, Vec::new(), true),
            Some(DataStream::NonResident { real_size, runs }) => {
                let extents = runs
                    .iter()
                    .filter_map(|run| Some(BlockRange::new(run.lcn?, run.length, cluster)))
                    .collect();
                (*real_size, extents, false)
            }
            None => (file_name.map_or(0, |f| f.real_size), Vec::new(), false),
        };

        let si = record.standard_info.as_ref();
        let creation_time = si
            .and_then(|s| s.created)
            .or_else(|| file_name.and_then(|f| f.created));
        let modification_time = si
            .and_then(|s| s.modified)
            .or_else(|| file_name.and_then(|f| f.modified));

        let integrity = RecordIntegrity {
            signature_valid: true,
            name_decoded: file_name.is_some_and(|f| !f.lossy),
            type_known: true,
            size_consistency: if record.is_directory() {
                1.0
            } else {
                size_consistency(size, &extents, resident)
            },
            timestamps_plausible: timestamps_plausible(
                &[creation_time, modification_time],
                Utc::now(),
            ),
            extents_valid: extents_valid(&extents, device_size),
            checksum_verified: Some(true),
        };

        FileEntry {
            id: record.record_number,
            path,
            name,
            size,
            is_directory: record.is_directory(),
            is_deleted: !record.in_use(),
            creation_time,
            modification_time,
            recovery_confidence: calculate_confidence_score(&integrity),
            extents,
            fs_metadata: Some(FsSpecificMetadata::Ntfs(NtfsFileMetadata {
                record_number: record.record_number,
                sequence_number: record.sequence_number,
                parent_record: file_name.map_or(0, |f| f.parent_record),
                hard_link_count: record.hard_link_count,
                name_namespace: file_name.map_or(0, |f| f.namespace),
                resident_data: resident,
                accessed_time: si.and_then(|s| s.accessed),
                mft_modified_time: si.and_then(|s| s.mft_modified),
            })),
        }
    }
}

impl FilesystemParser for NtfsParser {
    fn filesystem_type(&self) -> FilesystemType {
        FilesystemType::Ntfs
    }

    fn can_handle(&self, source: &dyn BlockSource) -> bool {
        Self::read_boot_sector(source).is_ok()
    }

    fn parse(
        &mut self,
        source: &dyn BlockSource,
        ctx: &mut ScanContext<'_>,
    ) -> Result<Vec<FileEntry>> {
        let boot = Self::read_boot_sector(source)
            .context("NTFS boot sector")
            .map_err(RecoveryError::corruption)?;
        tracing::info!(
            "NTFS: {}-byte clusters, MFT at cluster {}, {}-byte records",
            boot.cluster_size(),
            boot.mft_lcn,
            boot.record_size
        );

        let layout = Self::mft_layout(source, &boot, ctx.options().max_mft_records);
        let total = layout.record_count();
        let skipped_before = ctx.skipped();

        let mut records = Vec::new();
        let mut deleted = 0usize;
        for index in 0..total {
            if ctx.is_cancelled() {
                tracing::info!("NTFS walk cancelled after {} records", index);
                break;
            }
            ctx.report(ParserProgress {
                operation: "Reading MFT records",
                units_done: index,
                units_total: total,
                files_found: records.len(),
                deleted_found: deleted,
            });

            let Some(offset) = layout.record_offset(index) else {
                break;
            };
            let raw = match source.read_at(offset, layout.record_size as usize) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("MFT record {} unreadable: {}", index, e);
                    ctx.record_skip();
                    continue;
                }
            };
            match mft::parse_record(&raw, index) {
                Ok(Some(record)) if record.is_extension() => {}
                Ok(Some(record)) => {
                    if !record.in_use() {
                        deleted += 1;
                    }
                    records.push(record);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping MFT record {}: {}", index, e);
                    ctx.record_skip();
                }
            }
        }
        ctx.report(ParserProgress {
            operation: "Reading MFT records",
            units_done: total,
            units_total: total,
            files_found: records.len(),
            deleted_found: deleted,
        });

        let mut tree = DirectoryTree::new(ROOT_RECORD, ctx.options().max_tree_depth);
        for record in &records {
            if let Some(fname) = &record.file_name {
                if record.record_number == ROOT_RECORD {
                    continue;
                }
                let name = sanitize_name(&fname.name);
                if record.in_use() {
                    tree.insert(record.record_number, name, fname.parent_record);
                } else {
                    tree.insert_residual(record.record_number, name, fname.parent_record);
                }
            }
        }

        let resolve_paths = ctx.options().resolve_paths;
        let entries: Vec<FileEntry> = records
            .iter()
            .map(|record| Self::build_entry(record, &mut tree, &boot, source.size(), resolve_paths))
            .collect();

        self.stats = RecoveryStats::from_entries(&entries, ctx.skipped() - skipped_before);
        self.boot_sector = Some(boot);
        tracing::info!(
            "NTFS: {} entries ({} deleted), {} records skipped",
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
mod tests {
    use super::mft::tests::RecordBuilder;
    use super::mft::{NAMESPACE_WIN32, RECORD_FLAG_DIRECTORY, RECORD_FLAG_IN_USE};
    use super::*;
    use crate::device::MemoryDevice;
    use crate::recovery::ScanOptions;

    const CLUSTER: usize = 4096;
    const MFT_LCN: u64 = 4;

    fn boot_sector() -> Vec<u8> {
        let mut data = vec![0u8; 512];
        data[0] = 0xEB;
        data[3..11].copy_from_slice(b"NTFS    ");
        data[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        data[0x0D] = 8;
        data[0x28..0x30].copy_from_slice(&2048u64.to_le_bytes());
        data[0x30..0x38].copy_from_slice(&MFT_LCN.to_le_bytes());
        data[0x38..0x40].copy_from_slice(&2u64.to_le_bytes());
        data[0x40] = 0xF6; // -10 => 1024-byte records
        data[510..512].copy_from_slice(&0xAA55u16.to_le_bytes());
        data
    }

    /// Image with an MFT of 16 records: $MFT, root, a live file in a live
    /// directory, a deleted file and one corrupt record
    fn sample_image() -> Vec<u8> {
        let mut image = vec![0u8; 64 * CLUSTER];
        image[..512].copy_from_slice(&boot_sector());

        let mft = MFT_LCN as usize * CLUSTER;
        let mut put = |index: usize, record: Vec<u8>| {
            image[mft + index * 1024..mft + (index + 1) * 1024].copy_from_slice(&record);
        };

        // $MFT: 4 clusters at LCN 4 => 16 records
        put(
            0,
            RecordBuilder::new(RECORD_FLAG_IN_USE)
                .file_name("$MFT", 5, 16384, NAMESPACE_WIN32)
                .nonresident_data(16384, &[0x11, 0x04, 0x04])
                .build(),
        );
        put(
            5,
            RecordBuilder::new(RECORD_FLAG_IN_USE | RECORD_FLAG_DIRECTORY)
                .file_name(".", 5, 0, NAMESPACE_WIN32)
                .build(),
        );
        put(
            12,
            RecordBuilder::new(RECORD_FLAG_IN_USE | RECORD_FLAG_DIRECTORY)
                .standard_info(132_223_104_000_000_000, 132_223_104_000_000_000)
                .file_name("Documents", 5, 0, NAMESPACE_WIN32)
                .build(),
        );
        put(
            13,
            RecordBuilder::new(RECORD_FLAG_IN_USE)
                .standard_info(132_223_104_000_000_000, 132_223_104_000_000_000)
                .file_name("notes.txt", 12, 5, NAMESPACE_WIN32)
                .resident_data(b"hello")
                .build(),
        );
        put(
            14,
            RecordBuilder::new(0)
                .standard_info(132_223_104_000_000_000, 132_223_104_000_000_000)
                .file_name("photo.jpg", 12, 8000, NAMESPACE_WIN32)
                .nonresident_data(8000, &[0x11, 0x02, 0x20])
                .build(),
        );
        let mut corrupt = RecordBuilder::new(RECORD_FLAG_IN_USE)
            .file_name("broken.bin", 12, 0, NAMESPACE_WIN32)
            .build();
        corrupt[510] ^= 0xFF;
        put(15, corrupt);

        image
    }

    fn parse(image: Vec<u8>) -> (Vec<FileEntry>, RecoveryStats) {
        let device = MemoryDevice::new(image);
        let mut parser = NtfsParser::new();
        let mut ctx = ScanContext::new(ScanOptions::default());
        let entries = parser.parse(&device, &mut ctx).unwrap();
        (entries, parser.recovery_stats())
    }

    #[test]
    fn test_boot_sector_validation() {
        let boot = NtfsBootSector::parse(&boot_sector()).unwrap();
        assert_eq!(boot.cluster_size(), 4096);
        assert_eq!(boot.record_size, 1024);
        assert_eq!(boot.mft_offset(), 4 * 4096);

        let mut bad_sector = boot_sector();
        bad_sector[0x0B..0x0D].copy_from_slice(&500u16.to_le_bytes());
        assert!(NtfsBootSector::parse(&bad_sector).is_err());

        let mut bad_cluster = boot_sector();
        bad_cluster[0x0D] = 3;
        assert!(NtfsBootSector::parse(&bad_cluster).is_err());

        assert!(NtfsBootSector::parse(&boot_sector()[..100]).is_err());
    }

    #[test]
    fn test_parse_walks_mft() {
        let (entries, stats) = parse(sample_image());

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["$MFT", ".", "Documents", "notes.txt", "photo.jpg"]);
        assert_eq!(stats.as_pair(), (5, 1));
        assert_eq!(stats.skipped, 1);

        let notes = entries.iter().find(|e| e.name == "notes.txt").unwrap();
        assert_eq!(notes.path, "/Documents/notes.txt");
        assert_eq!(notes.size, 5);
        assert!(!notes.is_deleted);
        assert!(notes.recovery_confidence >= 0.8);

        let photo = entries.iter().find(|e| e.name == "photo.jpg").unwrap();
        assert!(photo.is_deleted);
        assert_eq!(photo.path, "/Documents/photo.jpg");
        assert_eq!(photo.extents, vec![BlockRange::new(0x20, 2, 4096)]);
        assert!(photo.creation_time.is_some());

        let root = entries.iter().find(|e| e.id == ROOT_RECORD).unwrap();
        assert_eq!(root.path, "/");
        assert!(root.is_directory);
    }

    #[test]
    fn test_parse_is_idempotent() {
        let device = MemoryDevice::new(sample_image());
        let mut parser = NtfsParser::new();
        let first = parser
            .parse(&device, &mut ScanContext::new(ScanOptions::default()))
            .unwrap();
        let first_stats = parser.recovery_stats();
        let second = parser
            .parse(&device, &mut ScanContext::new(ScanOptions::default()))
            .unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first_stats, parser.recovery_stats());
    }

    #[test]
    fn test_fallback_layout_when_mft_record_is_damaged() {
        let mut image = sample_image();
        let mft = MFT_LCN as usize * CLUSTER;
        image[mft..mft + 4].copy_from_slice(b"XXXX");

        let device = MemoryDevice::new(image);
        let mut parser = NtfsParser::new();
        let options = ScanOptions {
            max_mft_records: 16,
            ..ScanOptions::default()
        };
        let entries = parser.parse(&device, &mut ScanContext::new(options)).unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(parser.recovery_stats().skipped, 2);
    }

    #[test]
    fn test_invalid_boot_sector_is_fatal() {
        let mut image = sample_image();
        image[0x0D] = 0;
        let device = MemoryDevice::new(image);
        let mut parser = NtfsParser::new();
        assert!(!parser.can_handle(&device));
        let result = parser.parse(&device, &mut ScanContext::new(ScanOptions::default()));
        assert!(matches!(result, Err(RecoveryError::StructuralCorruption(_))));
        assert_eq!(parser.recovery_stats().as_pair(), (0, 0));
    }

    #[test]
    fn test_cancelled_walk_keeps_partial_results() {
        let device = MemoryDevice::new(sample_image());
        let mut parser = NtfsParser::new();
        let cancel = crate::recovery::CancelFlag::new();
        cancel.cancel();
        let mut ctx = ScanContext::new(ScanOptions::default()).with_cancel(cancel);
        let entries = parser.parse(&device, &mut ctx).unwrap();
        assert!(entries.is_empty());
    }
}
