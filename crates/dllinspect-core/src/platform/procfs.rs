//! `/proc`-based adapter for .NET (Core) processes on Linux.
//!
//! Attaching reads `/proc/<pid>/maps` once; nothing is ptrace-stopped.
//! CoreCLR has a single execution context, and every managed assembly it
//! loads from disk is mapped from its file, so the mapping list doubles as
//! the module list. Assemblies replaced on disk since load are read back
//! through `/proc/<pid>/map_files`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::metadata::read_assembly_identity_from_file;
use crate::{
    DiagnosticTarget, Error, ExecutionContext, ModuleStream, RawModuleRecord, Result,
    RuntimeDescriptor, RuntimeKind, RuntimeSession, RuntimeSource,
};

/// Name CoreCLR gives its only AppDomain.
const DEFAULT_DOMAIN: &str = "clrhost";

const ASSEMBLY_EXTENSIONS: &[&str] = &["dll", "exe"];

/// Appended by the kernel when the mapped file was unlinked or replaced.
const DELETED_SUFFIX: &str = " (deleted)";

/// One file-backed line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    start: u64,
    end: u64,
    path: String,
    deleted: bool,
}

impl Mapping {
    /// Name of this mapping's entry under `/proc/<pid>/map_files`.
    fn range(&self) -> String {
        format!("{:x}-{:x}", self.start, self.end)
    }
}

fn parse_maps(contents: &str) -> Vec<Mapping> {
    contents
        .lines()
        .filter_map(|line| {
            // start-end perms offset dev inode [path]
            let mut fields = line.splitn(6, ' ');
            let (start, end) = fields.next()?.split_once('-')?;
            let path = fields.nth(4)?.trim_start();
            if !path.starts_with('/') {
                return None;
            }
            let (path, deleted) = match path.strip_suffix(DELETED_SUFFIX) {
                Some(path) => (path, true),
                None => (path, false),
            };
            Some(Mapping {
                start: u64::from_str_radix(start, 16).ok()?,
                end: u64::from_str_radix(end, 16).ok()?,
                path: path.to_string(),
                deleted,
            })
        })
        .collect()
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_assembly_file(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| ASSEMBLY_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

/// Attaches through a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
}

impl ProcfsSource {
    /// Read process information from `root` instead of `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcfsSource {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl RuntimeSource for ProcfsSource {
    type Target = ProcfsTarget;

    fn attach(&self, pid: u32) -> Result<ProcfsTarget> {
        let maps_path = self.root.join(pid.to_string()).join("maps");
        let contents = std::fs::read_to_string(&maps_path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::attach(pid, "no such process"),
            ErrorKind::PermissionDenied => Error::attach(
                pid,
                "permission denied reading the memory map (different user or ptrace restrictions)",
            ),
            _ => Error::attach(pid, e),
        })?;

        let mappings = parse_maps(&contents);
        tracing::debug!(pid, mappings = mappings.len(), "Read process memory map");
        Ok(ProcfsTarget {
            pid,
            map_files: self.root.join(pid.to_string()).join("map_files"),
            mappings,
        })
    }
}

/// Snapshot of a process's file mappings.
#[derive(Debug)]
pub struct ProcfsTarget {
    pid: u32,
    map_files: PathBuf,
    mappings: Vec<Mapping>,
}

impl DiagnosticTarget for ProcfsTarget {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn runtimes(&self) -> Result<Vec<RuntimeDescriptor>> {
        let mut runtimes: Vec<RuntimeDescriptor> = Vec::new();
        for mapping in &self.mappings {
            let Some(kind) = RuntimeKind::from_module_name(file_name(&mapping.path)) else {
                continue;
            };
            let runtime = RuntimeDescriptor::from_module_path(kind, Path::new(&mapping.path));
            if !runtimes.contains(&runtime) {
                runtimes.push(runtime);
            }
        }
        Ok(runtimes)
    }

    fn open_runtime(&self, _runtime: &RuntimeDescriptor) -> Result<Box<dyn RuntimeSession + '_>> {
        // Lowest mapping of each file is its load base; maps is sorted by address.
        let mut modules: Vec<MappedAssembly<'_>> = Vec::new();
        for mapping in self.mappings.iter().filter(|m| is_assembly_file(&m.path)) {
            let seen = modules
                .iter()
                .any(|m| m.mapping.path == mapping.path && m.mapping.deleted == mapping.deleted);
            if seen {
                continue;
            }
            // An unlinked file is only reachable through the mapping itself.
            let image = if mapping.deleted {
                self.map_files.join(mapping.range())
            } else {
                PathBuf::from(&mapping.path)
            };
            modules.push(MappedAssembly { mapping, image });
        }

        Ok(Box::new(ProcfsSession { modules }))
    }
}

struct MappedAssembly<'a> {
    mapping: &'a Mapping,
    image: PathBuf,
}

impl MappedAssembly<'_> {
    fn read(&self) -> Result<RawModuleRecord> {
        let path = &self.mapping.path;
        let identity = read_assembly_identity_from_file(&self.image).map_err(|e| {
            if self.mapping.deleted {
                Error::RecordRead(format!("{} (replaced on disk since load): {}", path, e))
            } else {
                Error::RecordRead(format!("{}: {}", path, e))
            }
        })?;
        Ok(RawModuleRecord {
            identity: Some(identity.to_string()),
            base_address: self.mapping.start,
            file_path: Some(path.clone()),
        })
    }
}

struct ProcfsSession<'a> {
    modules: Vec<MappedAssembly<'a>>,
}

impl RuntimeSession for ProcfsSession<'_> {
    fn contexts(&self) -> Result<Vec<ExecutionContext>> {
        Ok(vec![ExecutionContext {
            id: 1,
            name: DEFAULT_DOMAIN.to_string(),
        }])
    }

    fn modules(&self, _context: &ExecutionContext) -> ModuleStream<'_> {
        Box::new(self.modules.iter().map(MappedAssembly::read))
    }
}
