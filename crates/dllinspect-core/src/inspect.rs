//! Attach, enumerate, normalize, classify and filter in one pass.

use serde::Serialize;

use crate::identity::{find_version_conflicts, normalize};
use crate::{
    CanonicalModule, ConflictRegistry, DiagnosticTarget, Error, ModuleEnumerator, ModuleFilter,
    ModuleReport, RawModuleRecord, Result, RuntimeDescriptor, RuntimeSource, VersionConflict,
};

/// Caller-supplied knobs for one inspection.
#[derive(Debug, Clone, Default)]
pub struct InspectOptions {
    pub filter: ModuleFilter,
    pub registry: ConflictRegistry,
}

/// Point-in-time snapshot of the assemblies loaded in one process.
#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub pid: u32,
    pub runtime: RuntimeDescriptor,
    /// Distinct assemblies before the filter was applied.
    pub total_loaded: usize,
    /// Records that could not be read from the live target.
    pub skipped_records: usize,
    pub filter: Option<String>,
    /// Sorted by name, filtered.
    pub modules: Vec<ModuleReport>,
    /// Names loaded at more than one version across execution contexts.
    pub version_conflicts: Vec<VersionConflict>,
}

impl InspectionReport {
    pub fn count(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn conflict_prone_count(&self) -> usize {
        self.modules.iter().filter(|m| m.conflict_prone).count()
    }
}

/// Tag each module with its conflict-prone flag.
pub fn classify(registry: &ConflictRegistry, modules: Vec<CanonicalModule>) -> Vec<ModuleReport> {
    modules
        .into_iter()
        .map(|m| ModuleReport {
            conflict_prone: registry.is_conflict_prone(&m.name),
            name: m.name,
            version: m.version,
            source_path: m.source_path,
        })
        .collect()
}

/// Inspect the assemblies loaded in `pid`.
///
/// The target is released before this returns, on success and on error.
pub fn inspect<S: RuntimeSource>(
    source: &S,
    pid: u32,
    options: &InspectOptions,
) -> Result<InspectionReport> {
    let target = source.attach(pid)?;
    tracing::info!(pid, "Attached to process");

    let runtime = target
        .runtimes()?
        .into_iter()
        .next()
        .ok_or(Error::NoManagedEnvironment { pid })?;
    tracing::info!(
        kind = ?runtime.kind,
        version = %runtime.version,
        directory = %runtime.directory.display(),
        "Selected managed runtime"
    );

    let session = target.open_runtime(&runtime)?;
    let mut enumerator = ModuleEnumerator::new(&*session)?;
    let records: Vec<RawModuleRecord> = enumerator.by_ref().collect();
    let skipped_records = enumerator.skipped();
    if skipped_records > 0 {
        tracing::info!(skipped_records, "Some module records could not be read");
    }

    let version_conflicts = find_version_conflicts(&records);
    let canonical = normalize(records);
    let total_loaded = canonical.len();
    let modules = classify(&options.registry, options.filter.apply(canonical));

    tracing::debug!(total_loaded, shown = modules.len(), "Inspection complete");

    Ok(InspectionReport {
        pid,
        runtime,
        total_loaded,
        skipped_records,
        filter: options.filter.pattern().map(str::to_string),
        modules,
        version_conflicts,
    })
}
