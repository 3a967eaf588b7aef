#![forbid(unsafe_code)]
//! Error types for the VDO toolkit.
//!
//! Defines `VdoError` and a `Result<T>` alias used throughout the workspace,
//! plus the process exit codes the CLI maps each kind to.

use thiserror::Error;
use vdo_types::ParseError;

/// Unified error type for all VDO format and reconfigure operations.
#[derive(Debug, Error)]
pub enum VdoError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    #[error("block {block} is not a VDO metadata block")]
    BadMagic { block: u64 },

    #[error("unsupported {component} version {major}.{minor}")]
    UnsupportedVersion {
        component: &'static str,
        major: u32,
        minor: u32,
    },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    BadChecksum { stored: u32, computed: u32 },

    #[error("incorrect component id: expected {expected}, got {actual}")]
    IncorrectComponent { expected: u32, actual: u32 },

    #[error("bad {component} length: declared {declared}, actual {actual}")]
    BadLength {
        component: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("can't force rebuild on a normal VDO")]
    NotReadOnly,

    #[error("corrupt metadata: {0}")]
    Corrupt(String),
}

impl VdoError {
    /// Convert this error into a stable process exit code for the CLI.
    #[must_use]
    pub fn to_exit_code(&self) -> i32 {
        match self {
            Self::OutOfRange(_) => 2,
            Self::OutOfMemory(_) => 3,
            Self::Io(_) => 4,
            Self::BadMagic { .. } => 5,
            Self::UnsupportedVersion { .. } => 6,
            Self::BadChecksum { .. } => 7,
            Self::IncorrectComponent { .. } => 8,
            Self::BadLength { .. } | Self::Parse(_) => 9,
            Self::NotReadOnly => 10,
            Self::Corrupt(_) => 11,
        }
    }
}

/// Result alias using `VdoError`.
pub type Result<T> = std::result::Result<T, VdoError>;
