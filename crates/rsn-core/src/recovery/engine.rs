/// Scan lifecycle: open, detect, parse with the cached parser, close
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::device::{BlockSource, CountingSource, DeviceReader};
use crate::error::{RecoveryError, Result};
use crate::fs::apfs::ApfsSnapshot;
use crate::fs::ext4::JournalInfo;
use crate::fs::{detect_filesystem, FilesystemParser, FsParser};
use crate::recovery::context::{CancelFlag, ParserProgress, ScanContext, ScanOptions};
use crate::{DeviceInfo, FileEntry, FilesystemType, RecoveryStats};

type ProgressCallback = dyn Fn(&ScanProgress) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScanStage {
    Detection,
    MetadataWalk,
    Filtering,
    Complete,
}

impl std::fmt::Display for ScanStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanStage::Detection => "detection",
            ScanStage::MetadataWalk => "metadata walk",
            ScanStage::Filtering => "filtering",
            ScanStage::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// One progress update. Percent and counters never decrease within a scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanProgress {
    pub stage: ScanStage,
    /// 0.0-100.0
    pub percent: f32,
    pub operation: String,
    /// Structural units (records, inodes, nodes) visited so far
    pub files_processed: u64,
    pub files_found: usize,
    pub deleted_found: usize,
    pub bytes_per_sec: f64,
    pub elapsed: Duration,
}

/// Outcome of one parse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub device: String,
    pub filesystem: FilesystemType,
    pub entries: Vec<FileEntry>,
    pub stats: RecoveryStats,
    pub skipped: usize,
    /// Stopped through the cancel flag; `entries` holds what was found before
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub bytes_read: u64,
}

/// Emits progress and keeps it monotonic
struct ProgressTracker<'a> {
    callback: Option<&'a ProgressCallback>,
    started: Instant,
    last: Option<ScanProgress>,
}

impl<'a> ProgressTracker<'a> {
    fn new(callback: Option<&'a ProgressCallback>, started: Instant) -> Self {
        Self {
            callback,
            started,
            last: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &mut self,
        stage: ScanStage,
        percent: f32,
        operation: &str,
        files_processed: u64,
        files_found: usize,
        deleted_found: usize,
        bytes_read: u64,
    ) {
        let Some(callback) = self.callback else {
            return;
        };

        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let mut progress = ScanProgress {
            stage,
            percent: percent.clamp(0.0, 100.0),
            operation: operation.to_string(),
            files_processed,
            files_found,
            deleted_found,
            bytes_per_sec: if secs > 0.0 { bytes_read as f64 / secs } else { 0.0 },
            elapsed,
        };
        if let Some(last) = &self.last {
            progress.stage = progress.stage.max(last.stage);
            progress.percent = progress.percent.max(last.percent);
            progress.files_processed = progress.files_processed.max(last.files_processed);
            progress.files_found = progress.files_found.max(last.files_found);
            progress.deleted_found = progress.deleted_found.max(last.deleted_found);
            progress.elapsed = progress.elapsed.max(last.elapsed);
        }

        callback(&progress);
        self.last = Some(progress);
    }
}

/// Owns the device handle and one parser per filesystem type for the
/// lifetime of that handle
pub struct RecoveryEngine {
    reader: DeviceReader,
    options: ScanOptions,
    detected: FilesystemType,
    parsers: HashMap<FilesystemType, FsParser>,
    entries: Vec<FileEntry>,
    stats: RecoveryStats,
    cancel: CancelFlag,
    progress_callback: Option<Box<ProgressCallback>>,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self::with_options(ScanOptions::default())
    }

    pub fn with_options(options: ScanOptions) -> Self {
        Self {
            reader: DeviceReader::new(),
            options,
            detected: FilesystemType::Unknown,
            parsers: HashMap::new(),
            entries: Vec::new(),
            stats: RecoveryStats::default(),
            cancel: CancelFlag::new(),
            progress_callback: None,
        }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: ScanOptions) {
        self.options = options;
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(&ScanProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Flag polled by parsers between structural units. Reset when a parse starts.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    // ========================================================================
    // Device lifecycle
    // ========================================================================

    /// `false` when the device cannot be opened; the reason is logged
    pub fn open_device<P: AsRef<Path>>(&mut self, path: P) -> bool {
        match self.try_open_device(path.as_ref()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Cannot open {}: {}", path.as_ref().display(), e);
                false
            }
        }
    }

    pub fn try_open_device<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.reset_session();
        self.reader.open(path)
    }

    /// Release the handle and the parsers built for it
    pub fn close_device(&mut self) -> bool {
        self.reset_session();
        match self.reader.close() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Closing device failed: {}", e);
                false
            }
        }
    }

    fn reset_session(&mut self) {
        self.parsers.clear();
        self.detected = FilesystemType::Unknown;
    }

    pub fn is_device_open(&self) -> bool {
        self.reader.is_open()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            path: self
                .reader
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            total_bytes: self.reader.size(),
            sector_size: self.reader.sector_size(),
            filesystem_type: self.detected,
            filesystem_name: self.detected.to_string(),
            is_open: self.reader.is_open(),
        }
    }

    /// `Unknown` when no device is open
    pub fn detect_filesystem(&mut self) -> FilesystemType {
        if !self.reader.is_open() {
            return FilesystemType::Unknown;
        }
        self.detected = detect_filesystem(&self.reader);
        tracing::info!("Detected filesystem: {}", self.detected);
        self.detected
    }

    // ========================================================================
    // Parsing
    // ========================================================================

    /// Entries of a fresh parse, empty on any failure
    pub fn parse_device(&mut self) -> Vec<FileEntry> {
        match self.try_parse_device() {
            Ok(report) => report.entries,
            Err(e) => {
                tracing::warn!("Parse failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Detect, then parse with the cached parser for the detected type.
    /// Each call replaces the results of the previous one.
    pub fn try_parse_device(&mut self) -> Result<ScanReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        self.cancel.reset();
        self.entries.clear();
        self.stats = RecoveryStats::default();

        if !self.reader.is_open() {
            return Err(RecoveryError::NotOpen);
        }

        let mut tracker = ProgressTracker::new(self.progress_callback.as_deref(), started);
        tracker.emit(ScanStage::Detection, 0.0, "Detecting filesystem", 0, 0, 0, 0);

        let fs_type = detect_filesystem(&self.reader);
        self.detected = fs_type;
        tracing::info!("Detected filesystem: {}", fs_type);

        let parser = match self.parsers.entry(fs_type) {
            Entry::Occupied(cached) => cached.into_mut(),
            Entry::Vacant(slot) => {
                let parser = FsParser::for_type(fs_type)
                    .ok_or(RecoveryError::UnsupportedFilesystem(fs_type))?;
                slot.insert(parser)
            }
        };

        let counting = CountingSource::new(&self.reader);
        let mut last_units = 0u64;
        let result = {
            let mut observer = |p: &ParserProgress| {
                last_units = p.units_done;
                tracker.emit(
                    ScanStage::MetadataWalk,
                    5.0 + p.fraction() * 85.0,
                    p.operation,
                    p.units_done,
                    p.files_found,
                    p.deleted_found,
                    counting.bytes_read(),
                );
            };
            let mut ctx = ScanContext::new(self.options.clone())
                .with_cancel(self.cancel.clone())
                .with_observer(&mut observer);
            tracing::info!("Parsing {} metadata", fs_type);
            let parsed = parser.parse(&counting, &mut ctx);
            let skipped = ctx.skipped();
            parsed.map(|entries| (entries, skipped))
        };
        let (mut entries, skipped) = result?;
        let bytes_read = counting.bytes_read();

        tracker.emit(
            ScanStage::Filtering,
            95.0,
            "Filtering entries",
            last_units,
            entries.len(),
            entries.iter().filter(|e| e.is_deleted).count(),
            bytes_read,
        );
        if !self.options.include_live {
            entries.retain(|e| e.is_deleted);
        }

        let stats = RecoveryStats::from_entries(&entries, skipped);
        let cancelled = self.cancel.is_cancelled();
        tracker.emit(
            ScanStage::Complete,
            100.0,
            if cancelled { "Cancelled" } else { "Complete" },
            last_units,
            stats.total_recoverable,
            stats.total_deleted,
            bytes_read,
        );
        tracing::info!(
            "{} parse finished: {} entries, {} deleted, {} skipped{}",
            fs_type,
            stats.total_recoverable,
            stats.total_deleted,
            stats.skipped,
            if cancelled { " (cancelled)" } else { "" }
        );

        self.entries = entries.clone();
        self.stats = stats;

        Ok(ScanReport {
            scan_id: Uuid::new_v4(),
            device: self.device_info().path,
            filesystem: fs_type,
            entries,
            stats,
            skipped,
            cancelled,
            started_at,
            elapsed: started.elapsed(),
            bytes_read,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Totals of the most recent parse, zero before any
    pub fn recovery_stats(&self) -> RecoveryStats {
        self.stats
    }

    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    pub fn detected_filesystem(&self) -> FilesystemType {
        self.detected
    }

    /// Snapshots seen by the last APFS parse on this handle
    pub fn apfs_snapshots(&self) -> Vec<ApfsSnapshot> {
        self.parsers
            .get(&FilesystemType::Apfs)
            .and_then(FsParser::as_apfs)
            .map(|parser| parser.snapshots().to_vec())
            .unwrap_or_default()
    }

    /// Journal of the last ext4 parse on this handle
    pub fn ext4_journal_info(&self) -> Option<JournalInfo> {
        self.parsers
            .get(&FilesystemType::Ext4)
            .and_then(FsParser::as_ext4)
            .and_then(|parser| parser.journal_info().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ext4::tests::sample_image;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tempfile::NamedTempFile;

    fn image_file(data: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_parse_without_device() {
        let mut engine = RecoveryEngine::new();
        assert!(!engine.open_device(""));
        assert!(!engine.is_device_open());
        assert_eq!(engine.detect_filesystem(), FilesystemType::Unknown);
        assert!(engine.parse_device().is_empty());
        assert!(matches!(engine.try_parse_device(), Err(RecoveryError::NotOpen)));
        assert_eq!(engine.recovery_stats().as_pair(), (0, 0));
        assert!(!engine.device_info().is_open);
    }

    #[test]
    fn test_ext4_scan_report() {
        let file = image_file(&sample_image());
        let mut engine = RecoveryEngine::new();
        assert!(engine.open_device(file.path()));
        assert_eq!(engine.detect_filesystem(), FilesystemType::Ext4);

        let report = engine.try_parse_device().unwrap();
        assert_eq!(report.filesystem, FilesystemType::Ext4);
        assert_eq!(report.stats.as_pair(), (5, 2));
        assert_eq!(report.skipped, 1);
        assert!(!report.cancelled);
        assert!(report.bytes_read > 0);
        assert_eq!(engine.recovery_stats(), report.stats);

        let info = engine.device_info();
        assert_eq!(info.total_bytes, 256 * 1024);
        assert_eq!(info.filesystem_name, "ext4");
        assert!(engine.ext4_journal_info().is_none());
        assert!(engine.apfs_snapshots().is_empty());
    }

    #[test]
    fn test_reparse_replaces_results() {
        let file = image_file(&sample_image());
        let mut engine = RecoveryEngine::new();
        assert!(engine.open_device(file.path()));

        let first = engine.try_parse_device().unwrap();
        let second = engine.try_parse_device().unwrap();
        assert_ne!(first.scan_id, second.scan_id);
        assert_eq!(first.stats, second.stats);
        assert_eq!(first.entries, second.entries);
        assert_eq!(engine.entries().len(), 5);
    }

    #[test]
    fn test_deleted_only_filter() {
        let file = image_file(&sample_image());
        let options = ScanOptions {
            include_live: false,
            ..ScanOptions::default()
        };
        let mut engine = RecoveryEngine::with_options(options);
        assert!(engine.open_device(file.path()));

        let entries = engine.parse_device();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.is_deleted));
        assert_eq!(engine.recovery_stats().as_pair(), (2, 2));
    }

    #[test]
    fn test_unsupported_filesystem() {
        let file = image_file(&vec![0u8; 64 * 1024]);
        let mut engine = RecoveryEngine::new();
        assert!(engine.open_device(file.path()));
        assert!(matches!(
            engine.try_parse_device(),
            Err(RecoveryError::UnsupportedFilesystem(FilesystemType::Unknown))
        ));
        assert!(engine.parse_device().is_empty());
    }

    #[test]
    fn test_progress_is_monotonic() {
        let file = image_file(&sample_image());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut engine = RecoveryEngine::new();
        engine.set_progress_callback(move |p| sink.lock().unwrap().push(p.clone()));
        assert!(engine.open_device(file.path()));
        engine.try_parse_device().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 3);
        assert_eq!(seen.first().unwrap().stage, ScanStage::Detection);
        let last = seen.last().unwrap();
        assert_eq!(last.stage, ScanStage::Complete);
        assert_eq!(last.percent, 100.0);
        assert_eq!(last.files_found, 5);
        for pair in seen.windows(2) {
            assert!(pair[1].percent >= pair[0].percent);
            assert!(pair[1].stage >= pair[0].stage);
            assert!(pair[1].files_processed >= pair[0].files_processed);
            assert!(pair[1].deleted_found >= pair[0].deleted_found);
        }
    }

    #[test]
    fn test_cancel_keeps_partial_results() {
        let file = image_file(&sample_image());
        let mut engine = RecoveryEngine::new();
        let cancel = engine.cancel_handle();
        engine.set_progress_callback(move |_| cancel.cancel());
        assert!(engine.open_device(file.path()));

        let report = engine.try_parse_device().unwrap();
        assert!(report.cancelled);
        assert!(report.entries.len() < 5);
        assert!(report.stats.total_deleted <= report.stats.total_recoverable);
    }

    #[test]
    fn test_close_drops_parsers() {
        let file = image_file(&sample_image());
        let mut engine = RecoveryEngine::new();
        assert!(engine.open_device(file.path()));
        engine.try_parse_device().unwrap();
        assert_eq!(engine.parsers.len(), 1);

        assert!(engine.close_device());
        assert!(engine.parsers.is_empty());
        assert!(!engine.is_device_open());
        assert_eq!(engine.detected_filesystem(), FilesystemType::Unknown);
        assert!(engine.close_device());
    }
}
