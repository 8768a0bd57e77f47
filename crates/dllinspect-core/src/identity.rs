//! Assembly identity parsing, deduplication and ordering.
//!
//! Identity strings have the form
//! `Name, Version=W.X.Y.Z, Culture=neutral, PublicKeyToken=...`.
//! Only the name and the `Version` field feed the canonical model.

use std::collections::{HashMap, HashSet};

use crate::{CanonicalModule, IN_MEMORY, RawModuleRecord, UNKNOWN_VERSION, VersionConflict};

/// Split an identity string into its trimmed name and version.
///
/// Keys are matched case-insensitively; the first `Version` field wins.
/// A missing `Version` field yields [`UNKNOWN_VERSION`]; a present but
/// empty one is kept as an empty string.
pub fn parse_identity(identity: &str) -> (String, String) {
    let mut parts = identity.split(',');
    let name = parts.next().unwrap_or_default().trim().to_string();

    let version = parts
        .filter_map(|field| field.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("version"))
        .map(|(_, value)| value.trim())
        .unwrap_or(UNKNOWN_VERSION)
        .to_string();

    (name, version)
}

/// Map one raw record onto the canonical model.
///
/// Returns `None` for records without a usable name.
pub fn canonicalize(record: &RawModuleRecord) -> Option<CanonicalModule> {
    let identity = record.identity.as_deref()?;
    let (name, version) = parse_identity(identity);
    if name.is_empty() {
        tracing::debug!(
            base_address = record.base_address,
            "Dropping module with empty assembly name"
        );
        return None;
    }

    let source_path = match record.file_path.as_deref() {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => IN_MEMORY.to_string(),
    };

    Some(CanonicalModule {
        name,
        version,
        source_path,
    })
}

/// Keep the first module seen for each name, then sort by name (ordinal).
///
/// Applying this to its own output returns the same list.
pub fn dedup_and_sort<I>(modules: I) -> Vec<CanonicalModule>
where
    I: IntoIterator<Item = CanonicalModule>,
{
    let mut seen = HashSet::new();
    let mut unique: Vec<CanonicalModule> = modules
        .into_iter()
        .filter(|m| seen.insert(m.name.clone()))
        .collect();

    unique.sort_by(|a, b| a.name.cmp(&b.name));
    unique
}

/// Normalize the flattened record stream of every execution context.
pub fn normalize<I>(records: I) -> Vec<CanonicalModule>
where
    I: IntoIterator<Item = RawModuleRecord>,
{
    dedup_and_sort(records.into_iter().filter_map(|r| canonicalize(&r)))
}

/// Names that appear with more than one distinct version.
///
/// Does not affect [`normalize`]; the first-seen record still wins there.
pub fn find_version_conflicts<'a, I>(records: I) -> Vec<VersionConflict>
where
    I: IntoIterator<Item = &'a RawModuleRecord>,
{
    let mut versions: HashMap<String, Vec<String>> = HashMap::new();

    for module in records.into_iter().filter_map(canonicalize) {
        let seen = versions.entry(module.name).or_default();
        if !seen.contains(&module.version) {
            seen.push(module.version);
        }
    }

    let mut conflicts: Vec<VersionConflict> = versions
        .into_iter()
        .filter(|(_, v)| v.len() > 1)
        .map(|(name, versions)| VersionConflict { name, versions })
        .collect();

    conflicts.sort_by(|a, b| a.name.cmp(&b.name));
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(identity: &str, base: u64, path: &str) -> RawModuleRecord {
        RawModuleRecord::new(identity, base, path)
    }

    #[test]
    fn parses_full_display_name() {
        let (name, version) = parse_identity(
            "Newtonsoft.Json, Version=13.0.0.0, Culture=neutral, PublicKeyToken=30ad4fe6b2a6aeed",
        );
        assert_eq!(name, "Newtonsoft.Json");
        assert_eq!(version, "13.0.0.0");
    }

    #[test]
    fn version_key_is_case_insensitive_and_trimmed() {
        let (name, version) = parse_identity("  Foo ,Culture=neutral,  version =  2.1.0.0  ");
        assert_eq!(name, "Foo");
        assert_eq!(version, "2.1.0.0");
    }

    #[test]
    fn first_version_field_wins() {
        let (_, version) = parse_identity("Foo, Version=1.0, Version=2.0");
        assert_eq!(version, "1.0");
    }

    #[test]
    fn missing_version_is_unknown() {
        assert_eq!(parse_identity("Foo").1, "unknown");
        assert_eq!(parse_identity("Foo, Culture=neutral").1, "unknown");
        assert_eq!(parse_identity("Foo, VersionX=1.0").1, "unknown");
    }

    #[test]
    fn empty_version_value_is_kept_empty() {
        assert_eq!(parse_identity("Foo, Version="), ("Foo".into(), String::new()));
        assert_eq!(
            parse_identity("Foo, Version= , Culture=neutral"),
            ("Foo".into(), String::new())
        );
    }

    #[test]
    fn empty_path_becomes_in_memory() {
        let module = canonicalize(&raw("B, Culture=neutral", 0x3000, "")).unwrap();
        assert_eq!(module.source_path, IN_MEMORY);
        assert!(module.is_in_memory());

        let module = canonicalize(&RawModuleRecord {
            identity: Some("C".into()),
            base_address: 0,
            file_path: None,
        })
        .unwrap();
        assert_eq!(module.source_path, IN_MEMORY);
    }

    #[test]
    fn records_without_a_name_are_dropped() {
        let missing = RawModuleRecord {
            identity: None,
            base_address: 0x1000,
            file_path: Some("C:\\x.dll".into()),
        };
        assert!(canonicalize(&missing).is_none());
        assert!(canonicalize(&raw("", 0x1000, "")).is_none());
        assert!(canonicalize(&raw(" , Version=1.0", 0x1000, "")).is_none());
    }

    #[test]
    fn first_seen_wins_and_output_is_sorted() {
        let modules = normalize(vec![
            raw("A,Version=1.0,Culture=neutral", 0x1000, "C:\\A.dll"),
            raw("A,Version=2.0", 0x2000, ""),
            raw("B,Culture=neutral", 0x3000, ""),
        ]);

        assert_eq!(
            modules,
            vec![
                CanonicalModule {
                    name: "A".into(),
                    version: "1.0".into(),
                    source_path: "C:\\A.dll".into(),
                },
                CanonicalModule {
                    name: "B".into(),
                    version: "unknown".into(),
                    source_path: IN_MEMORY.into(),
                },
            ]
        );
    }

    #[test]
    fn dedup_is_case_sensitive() {
        let modules = normalize(vec![raw("foo", 1, ""), raw("Foo", 2, "")]);
        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Foo", "foo"]);
    }

    #[test]
    fn sort_is_ordinal() {
        let modules = normalize(vec![raw("b", 1, ""), raw("Z", 2, ""), raw("a", 3, "")]);
        let names: Vec<_> = modules.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Z", "a", "b"]);
    }

    #[test]
    fn version_conflicts_list_distinct_versions() {
        let records = vec![
            raw("A, Version=1.0", 1, ""),
            raw("B, Version=3.0", 2, ""),
            raw("A, Version=2.0", 3, ""),
            raw("A, Version=1.0", 4, ""),
            raw("B, Version=3.0", 5, ""),
        ];

        let conflicts = find_version_conflicts(&records);
        assert_eq!(
            conflicts,
            vec![VersionConflict {
                name: "A".into(),
                versions: vec!["1.0".into(), "2.0".into()],
            }]
        );
    }
}
