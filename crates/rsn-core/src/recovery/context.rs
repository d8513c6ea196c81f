/// Per-scan options, cancellation and the progress channel parsers report into
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Traversal bounds and output filters for one scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    /// NTFS records walked when the MFT's own extent list is unreadable
    pub max_mft_records: u64,
    /// Depth bound for B-trees, extent trees and parent chains
    pub max_tree_depth: u32,
    /// Hard step counter for APFS B-tree walks
    pub max_btree_nodes: u64,
    /// Cap on ext4 inode slots visited
    pub max_inodes: Option<u64>,
    /// Emit live (not deleted) entries as well
    pub include_live: bool,
    /// Rebuild full paths from parent links
    pub resolve_paths: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_mft_records: 1 << 20,
            max_tree_depth: 64,
            max_btree_nodes: 1_000_000,
            max_inodes: None,
            include_live: true,
            resolve_paths: true,
        }
    }
}

/// Shared stop signal, settable from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Raw progress from inside a parser walk
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParserProgress {
    pub operation: &'static str,
    pub units_done: u64,
    pub units_total: u64,
    pub files_found: usize,
    pub deleted_found: usize,
}

impl ParserProgress {
    /// Completed fraction, 0.0-1.0
    pub fn fraction(&self) -> f32 {
        if self.units_total == 0 {
            return 0.0;
        }
        (self.units_done as f64 / self.units_total as f64).min(1.0) as f32
    }
}

/// State a parser carries through one walk
pub struct ScanContext<'a> {
    options: ScanOptions,
    cancel: CancelFlag,
    observer: Option<&'a mut dyn FnMut(&ParserProgress)>,
    skipped: usize,
    last_report: Option<(&'static str, u32)>,
}

impl<'a> ScanContext<'a> {
    pub fn new(options: ScanOptions) -> Self {
        Self {
            options,
            cancel: CancelFlag::new(),
            observer: None,
            skipped: 0,
            last_report: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: &'a mut dyn FnMut(&ParserProgress)) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Count one record/inode/node that was skipped as unusable
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Forward progress to the observer, at most once per 0.1% step or
    /// operation change
    pub fn report(&mut self, progress: ParserProgress) {
        let Some(observer) = self.observer.as_mut() else {
            return;
        };

        let permille = (progress.fraction() * 1000.0) as u32;
        let key = (progress.operation, permille);
        let finished = progress.units_done >= progress.units_total;
        if self.last_report == Some(key) && !finished {
            return;
        }
        self.last_report = Some(key);
        observer(&progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let handle = flag.clone();
        assert!(!flag.is_cancelled());
        handle.cancel();
        assert!(flag.is_cancelled());
        flag.reset();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_report_is_throttled() {
        let mut seen = Vec::new();
        let mut observer = |p: &ParserProgress| seen.push(p.units_done);
        {
            let mut ctx = ScanContext::new(ScanOptions::default()).with_observer(&mut observer);
            for done in 0..=10_000u64 {
                ctx.report(ParserProgress {
                    operation: "walk",
                    units_done: done,
                    units_total: 10_000,
                    files_found: 0,
                    deleted_found: 0,
                });
            }
        }
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&10_000));
        assert!(seen.len() <= 1002);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: ScanOptions = serde_json::from_str(r#"{"include_live": false}"#).unwrap();
        assert!(!options.include_live);
        assert_eq!(options.max_tree_depth, 64);
    }
}
