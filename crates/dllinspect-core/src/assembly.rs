//! Assembly record structures.

use serde::Serialize;

/// Source path reported for assemblies with no backing file.
pub const IN_MEMORY: &str = "(in-memory)";

/// Version reported when an identity string carries no `Version=` field.
pub const UNKNOWN_VERSION: &str = "unknown";

/// A module as read from the target, before any normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawModuleRecord {
    /// Display name, e.g. `Newtonsoft.Json, Version=13.0.0.0, Culture=neutral, ...`.
    pub identity: Option<String>,
    /// Base load address of the module in the target.
    pub base_address: u64,
    /// Backing file, if the module was loaded from disk.
    pub file_path: Option<String>,
}

impl RawModuleRecord {
    pub fn new(identity: impl Into<String>, base_address: u64, file_path: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            base_address,
            file_path: Some(file_path.into()),
        }
    }
}

/// A module reduced to its stable `(name, version)` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalModule {
    pub name: String,
    pub version: String,
    pub source_path: String,
}

impl CanonicalModule {
    /// Whether the module was loaded from a byte array rather than a file.
    pub fn is_in_memory(&self) -> bool {
        self.source_path == IN_MEMORY
    }
}

/// One row of the final result handed to a renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleReport {
    pub name: String,
    pub version: String,
    pub source_path: String,
    pub conflict_prone: bool,
}

/// A name that more than one execution context loaded at different versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionConflict {
    pub name: String,
    /// Distinct versions in first-seen order.
    pub versions: Vec<String>,
}
