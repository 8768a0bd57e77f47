//! Case-insensitive substring filtering over name and source path.

use crate::CanonicalModule;

/// Optional substring predicate; `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleFilter {
    pattern: Option<String>,
    needle: Option<String>,
}

impl ModuleFilter {
    /// A blank pattern is treated the same as no pattern.
    pub fn new(pattern: Option<&str>) -> Self {
        let pattern = pattern.filter(|p| !p.trim().is_empty());
        Self {
            pattern: pattern.map(str::to_string),
            needle: pattern.map(str::to_lowercase),
        }
    }

    /// The pattern as the caller supplied it.
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.needle.is_some()
    }

    pub fn matches(&self, module: &CanonicalModule) -> bool {
        match &self.needle {
            None => true,
            Some(needle) => {
                module.name.to_lowercase().contains(needle.as_str())
                    || module.source_path.to_lowercase().contains(needle.as_str())
            }
        }
    }

    /// Keep matching modules, preserving input order.
    pub fn apply(&self, modules: Vec<CanonicalModule>) -> Vec<CanonicalModule> {
        if !self.is_active() {
            return modules;
        }
        modules.into_iter().filter(|m| self.matches(m)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, path: &str) -> CanonicalModule {
        CanonicalModule {
            name: name.into(),
            version: "1.0.0.0".into(),
            source_path: path.into(),
        }
    }

    fn sample() -> Vec<CanonicalModule> {
        vec![
            module("Newtonsoft.Json", "C:\\Plugins\\A\\Newtonsoft.Json.dll"),
            module("RestSharp", "C:\\Plugins\\B\\RestSharp.dll"),
            module("Vendor.Core", "C:\\Vendor\\json\\Vendor.Core.dll"),
        ]
    }

    #[test]
    fn absent_or_blank_pattern_is_identity() {
        assert_eq!(ModuleFilter::new(None).apply(sample()), sample());
        assert_eq!(ModuleFilter::new(Some("")).apply(sample()), sample());
        assert_eq!(ModuleFilter::new(Some("   ")).apply(sample()), sample());
    }

    #[test]
    fn matches_name_or_path_ignoring_case() {
        let kept = ModuleFilter::new(Some("Json")).apply(sample());
        let names: Vec<_> = kept.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["Newtonsoft.Json", "Vendor.Core"]);
    }

    #[test]
    fn excludes_entries_matching_nowhere() {
        let filter = ModuleFilter::new(Some("json"));
        assert!(!filter.matches(&module("RestSharp", "C:\\Plugins\\B\\RestSharp.dll")));
        assert!(filter.matches(&module("Newtonsoft.Json", "(in-memory)")));
    }

    #[test]
    fn preserves_order() {
        let kept = ModuleFilter::new(Some("c:\\")).apply(sample());
        assert_eq!(kept, sample());
    }
}
