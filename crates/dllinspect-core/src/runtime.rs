//! Runtime detection types and the attach capability interface.
//!
//! The pipeline only talks to a target through these traits. Platform
//! adapters in [`crate::platform`] implement them against a real process,
//! tests implement them in memory.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{RawModuleRecord, Result};

// =============================================================================
// Runtime Types
// =============================================================================

/// Type of .NET runtime detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuntimeKind {
    /// .NET Core / .NET 5+ (coreclr, mscordaccore)
    Core,
    /// .NET Framework 4.x (clr.dll, mscordacwks.dll)
    Framework,
    /// .NET Framework 2.0/3.5 (mscorwks.dll, mscordacwks.dll)
    FrameworkLegacy,
}

impl RuntimeKind {
    /// Get the DAC DLL name for this runtime type
    pub fn dac_dll_name(&self) -> &'static str {
        match self {
            RuntimeKind::Core => "mscordaccore.dll",
            RuntimeKind::Framework | RuntimeKind::FrameworkLegacy => "mscordacwks.dll",
        }
    }

    /// Identify a runtime from the file name of a loaded native module.
    pub fn from_module_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        match name.as_str() {
            "coreclr.dll" | "libcoreclr.so" | "libcoreclr.dylib" => Some(RuntimeKind::Core),
            "clr.dll" => Some(RuntimeKind::Framework),
            "mscorwks.dll" => Some(RuntimeKind::FrameworkLegacy),
            _ => None,
        }
    }
}

/// A managed runtime found inside the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeDescriptor {
    pub kind: RuntimeKind,
    /// Free-form version, taken from the runtime's install directory name.
    pub version: String,
    /// Directory containing the runtime DLLs
    pub directory: PathBuf,
}

impl RuntimeDescriptor {
    /// Describe the runtime whose core module was loaded from `module_path`.
    pub fn from_module_path(kind: RuntimeKind, module_path: &Path) -> Self {
        let directory = module_path.parent().map(Path::to_path_buf).unwrap_or_default();
        let version = directory
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| crate::UNKNOWN_VERSION.to_string());

        Self {
            kind,
            version,
            directory,
        }
    }

    /// Get the full path to the DAC DLL
    pub fn dac_path(&self) -> PathBuf {
        self.directory.join(self.kind.dac_dll_name())
    }
}

/// One logical execution context (AppDomain) inside a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Runtime-internal address or index of the domain.
    pub id: u64,
    pub name: String,
}

// =============================================================================
// Capability Interface
// =============================================================================

/// Lazy, single-pass stream of module records from one execution context.
///
/// `Err` items are per-record read failures; consumers skip them.
pub type ModuleStream<'a> = Box<dyn Iterator<Item = Result<RawModuleRecord>> + 'a>;

/// Opens diagnostic channels into processes.
pub trait RuntimeSource {
    type Target: DiagnosticTarget;

    /// Attach to `pid` without suspending it.
    ///
    /// The returned target releases the channel when dropped.
    fn attach(&self, pid: u32) -> Result<Self::Target>;
}

/// A live, read-only connection to one process.
pub trait DiagnosticTarget {
    fn pid(&self) -> u32;

    /// Managed runtimes loaded in the target, in discovery order.
    fn runtimes(&self) -> Result<Vec<RuntimeDescriptor>>;

    /// Start reading the given runtime's data structures.
    fn open_runtime(&self, runtime: &RuntimeDescriptor) -> Result<Box<dyn RuntimeSession + '_>>;
}

/// Read access to one runtime inside an attached target.
pub trait RuntimeSession {
    /// Every execution context registered with the runtime.
    fn contexts(&self) -> Result<Vec<ExecutionContext>>;

    /// Modules loaded in `context`.
    fn modules(&self, context: &ExecutionContext) -> ModuleStream<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_from_module_name() {
        assert_eq!(RuntimeKind::from_module_name("CoreCLR.dll"), Some(RuntimeKind::Core));
        assert_eq!(RuntimeKind::from_module_name("libcoreclr.so"), Some(RuntimeKind::Core));
        assert_eq!(RuntimeKind::from_module_name("clr.dll"), Some(RuntimeKind::Framework));
        assert_eq!(
            RuntimeKind::from_module_name("mscorwks.dll"),
            Some(RuntimeKind::FrameworkLegacy)
        );
        assert_eq!(RuntimeKind::from_module_name("kernel32.dll"), None);
    }

    #[test]
    fn descriptor_version_comes_from_directory() {
        let path = Path::new("/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.11/libcoreclr.so");
        let runtime = RuntimeDescriptor::from_module_path(RuntimeKind::Core, path);
        assert_eq!(runtime.version, "8.0.11");
        assert_eq!(
            runtime.dac_path(),
            Path::new("/usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.11/mscordaccore.dll")
        );
    }

    #[test]
    fn descriptor_without_directory_is_unknown() {
        let runtime = RuntimeDescriptor::from_module_path(RuntimeKind::Framework, Path::new("clr.dll"));
        assert_eq!(runtime.version, "unknown");
    }
}
