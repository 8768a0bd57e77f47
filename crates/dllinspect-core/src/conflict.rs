//! Registry of assembly names known to clash between independently loaded plugins.

use std::collections::HashSet;

/// Assemblies that commonly cause version conflicts between add-ins
/// sharing one host process.
pub const DEFAULT_CONFLICT_PRONE: &[&str] = &[
    "Newtonsoft.Json",
    "System.Text.Json",
    "System.Memory",
    "System.Buffers",
    "System.Runtime.CompilerServices.Unsafe",
    "System.Threading.Tasks.Extensions",
    "Microsoft.Bcl.AsyncInterfaces",
    "System.ValueTuple",
    "System.Numerics.Vectors",
    "RestSharp",
    "NLog",
    "log4net",
    "Serilog",
    "Autofac",
    "Dapper",
    "CsvHelper",
];

/// Immutable, case-insensitive set of conflict-prone names.
#[derive(Debug, Clone)]
pub struct ConflictRegistry {
    names: HashSet<String>,
}

impl ConflictRegistry {
    /// Build a registry from an explicit list of names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names.into_iter().map(|n| fold(n.as_ref())).collect(),
        }
    }

    /// The built-in list plus `extra`.
    pub fn with_additional<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::default();
        registry
            .names
            .extend(extra.into_iter().map(|n| fold(n.as_ref())).filter(|n| !n.is_empty()));
        registry
    }

    pub fn is_conflict_prone(&self, name: &str) -> bool {
        self.names.contains(&fold(name))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ConflictRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CONFLICT_PRONE)
    }
}

fn fold(name: &str) -> String {
    name.trim().to_lowercase()
}
