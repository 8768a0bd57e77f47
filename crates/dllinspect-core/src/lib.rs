//! Read-only inspection of the .NET assemblies loaded in a live process.
//!
//! [`inspect`] runs the whole pipeline against any [`RuntimeSource`]:
//! attach, enumerate every execution context, normalize and deduplicate to
//! `(name, version)`, filter, then classify against a [`ConflictRegistry`].
//! [`platform::NativeSource`] is the source for the current OS.

pub mod assembly;
pub mod conflict;
pub mod enumerate;
pub mod error;
pub mod filter;
pub mod identity;
pub mod inspect;
pub mod metadata;
pub mod platform;
pub mod runtime;

#[cfg(test)]
mod testutil;

pub use assembly::{CanonicalModule, IN_MEMORY, ModuleReport, RawModuleRecord, UNKNOWN_VERSION, VersionConflict};
pub use conflict::{ConflictRegistry, DEFAULT_CONFLICT_PRONE};
pub use enumerate::ModuleEnumerator;
pub use error::{Error, Result};
pub use filter::ModuleFilter;
pub use identity::{canonicalize, dedup_and_sort, find_version_conflicts, normalize, parse_identity};
pub use inspect::{InspectOptions, InspectionReport, classify, inspect};
pub use runtime::{
    DiagnosticTarget, ExecutionContext, ModuleStream, RuntimeDescriptor, RuntimeKind, RuntimeSession,
    RuntimeSource,
};
