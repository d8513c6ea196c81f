/// Filesystem detection and per-format metadata parsers
use std::path::Path;

pub mod apfs;
pub mod common;
pub mod detect;
pub mod ext4;
pub mod ntfs;

pub use detect::detect_filesystem;

use crate::device::{BlockSource, DeviceReader};
use crate::error::Result;
use crate::recovery::{ScanContext, ScanOptions};
use crate::{FileEntry, FilesystemType, RecoveryStats};

use apfs::ApfsParser;
use ext4::Ext4Parser;
use ntfs::NtfsParser;

/// Capabilities every metadata parser provides
pub trait FilesystemParser {
    fn filesystem_type(&self) -> FilesystemType;

    /// Validate the primary header only. Does not touch parser state.
    fn can_handle(&self, source: &dyn BlockSource) -> bool;

    /// Walk the metadata and return every entry found. Replaces the
    /// statistics of any previous parse.
    fn parse(&mut self, source: &dyn BlockSource, ctx: &mut ScanContext<'_>)
        -> Result<Vec<FileEntry>>;

    /// Totals of the most recent successful parse, zero before any
    fn recovery_stats(&self) -> RecoveryStats;

    fn can_handle_path(&self, path: &Path) -> bool {
        let mut reader = DeviceReader::new();
        reader.open(path).is_ok() && self.can_handle(&reader)
    }

    fn parse_path(&mut self, path: &Path) -> Result<Vec<FileEntry>> {
        let mut reader = DeviceReader::new();
        reader.open(path)?;
        let mut ctx = ScanContext::new(ScanOptions::default());
        self.parse(&reader, &mut ctx)
    }
}

/// The closed set of parsers, selected by detected type
pub enum FsParser {
    Ntfs(NtfsParser),
    Apfs(ApfsParser),
    Ext4(Ext4Parser),
}

impl FsParser {
    /// `None` for types that are detected but have no parser
    pub fn for_type(fs_type: FilesystemType) -> Option<Self> {
        match fs_type {
            FilesystemType::Ntfs => Some(FsParser::Ntfs(NtfsParser::new())),
            FilesystemType::Apfs => Some(FsParser::Apfs(ApfsParser::new())),
            FilesystemType::Ext4 => Some(FsParser::Ext4(Ext4Parser::new())),
            FilesystemType::Fat32 | FilesystemType::HfsPlus | FilesystemType::Unknown => None,
        }
    }

    pub fn as_apfs(&self) -> Option<&ApfsParser> {
        match self {
            FsParser::Apfs(parser) => Some(parser),
            _ => None,
        }
    }

    pub fn as_ext4(&self) -> Option<&Ext4Parser> {
        match self {
            FsParser::Ext4(parser) => Some(parser),
            _ => None,
        }
    }
}

impl FilesystemParser for FsParser {
    fn filesystem_type(&self) -> FilesystemType {
        match self {
            FsParser::Ntfs(p) => p.filesystem_type(),
            FsParser::Apfs(p) => p.filesystem_type(),
            FsParser::Ext4(p) => p.filesystem_type(),
        }
    }

    fn can_handle(&self, source: &dyn BlockSource) -> bool {
        match self {
            FsParser::Ntfs(p) => p.can_handle(source),
            FsParser::Apfs(p) => p.can_handle(source),
            FsParser::Ext4(p) => p.can_handle(source),
        }
    }

    fn parse(
        &mut self,
        source: &dyn BlockSource,
        ctx: &mut ScanContext<'_>,
    ) -> Result<Vec<FileEntry>> {
        match self {
            FsParser::Ntfs(p) => p.parse(source, ctx),
            FsParser::Apfs(p) => p.parse(source, ctx),
            FsParser::Ext4(p) => p.parse(source, ctx),
        }
    }

    fn recovery_stats(&self) -> RecoveryStats {
        match self {
            FsParser::Ntfs(p) => p.recovery_stats(),
            FsParser::Apfs(p) => p.recovery_stats(),
            FsParser::Ext4(p) => p.recovery_stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_selection() {
        for fs in [FilesystemType::Ntfs, FilesystemType::Apfs, FilesystemType::Ext4] {
            let parser = FsParser::for_type(fs).unwrap();
            assert_eq!(parser.filesystem_type(), fs);
            assert_eq!(parser.recovery_stats().as_pair(), (0, 0));
        }
        for fs in [
            FilesystemType::Fat32,
            FilesystemType::HfsPlus,
            FilesystemType::Unknown,
        ] {
            assert!(FsParser::for_type(fs).is_none());
        }
    }
}
