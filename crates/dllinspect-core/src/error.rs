//! Error types for dllinspect.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The operating system refused a read-only diagnostic channel into the target.
    #[error("Failed to attach to process {pid}: {reason}")]
    AttachFailed { pid: u32, reason: String },

    /// The target is running, but hosts no managed runtime this tool can read.
    #[error("No managed runtime found in process {pid}")]
    NoManagedEnvironment { pid: u32 },

    /// A single module record could not be read from the live target.
    #[error("Failed to read module record: {0}")]
    RecordRead(String),

    #[error("Malformed assembly metadata: {0}")]
    Metadata(String),

    #[error("Failed to enumerate assemblies: {0}")]
    EnumerationFailed(String),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    WindowsError(#[from] windows::core::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn attach(pid: u32, reason: impl std::fmt::Display) -> Self {
        Error::AttachFailed {
            pid,
            reason: reason.to_string(),
        }
    }

    /// Whether this error only concerns one record and must not abort enumeration.
    pub fn is_per_record(&self) -> bool {
        matches!(self, Error::RecordRead(_) | Error::Metadata(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
