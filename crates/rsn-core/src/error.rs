use thiserror::Error;

use crate::FilesystemType;

/// Failures surfaced by the recovery engine
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Device unavailable: {path}: {source}")]
    DeviceUnavailable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Device is not open")]
    NotOpen,

    #[error("Read of {length} bytes at offset {offset} exceeds device size {size}")]
    OutOfBounds { offset: u64, length: usize, size: u64 },

    #[error("I/O fault reading {length} bytes at offset {offset}: {source}")]
    IoFault {
        offset: u64,
        length: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Structural corruption: {0}")]
    StructuralCorruption(String),

    #[error("Unsupported filesystem: {0}")]
    UnsupportedFilesystem(FilesystemType),

    #[error("Traversal cycle detected at block {block}")]
    TraversalCycle { block: u64 },

    #[error("Scan cancelled")]
    Cancelled,
}

impl RecoveryError {
    /// Wrap a header decode failure. Uses the alternate format so the full
    /// anyhow context chain is kept.
    pub fn corruption(err: anyhow::Error) -> Self {
        RecoveryError::StructuralCorruption(format!("{:#}", err))
    }

    /// Read failures that a parser may skip past rather than abort on
    pub fn is_read_failure(&self) -> bool {
        matches!(
            self,
            RecoveryError::OutOfBounds { .. } | RecoveryError::IoFault { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
