//! Human-readable and JSON output of an inspection report.

use std::io::{self, Write};

use console::Style;
use dllinspect_core::{IN_MEMORY, InspectionReport};

use crate::error::CliError;
use crate::select::Selection;

const NAME_WIDTH: usize = 60;
const VERSION_WIDTH: usize = 20;
const RULE_WIDTH: usize = 140;

// =============================================================================
// Path shortening
// =============================================================================

/// Replaces well-known directory prefixes with short placeholders.
#[derive(Debug, Clone, Default)]
pub struct PathShortener {
    prefixes: Vec<(String, String)>,
}

impl PathShortener {
    /// Build from `(directory, placeholder)` pairs; earlier pairs win.
    pub fn new<I, D, P>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = (D, P)>,
        D: Into<String>,
        P: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .filter_map(|(dir, placeholder)| {
                    let dir: String = dir.into();
                    let dir = dir.trim_end_matches(['/', '\\']).to_string();
                    (!dir.is_empty()).then(|| (dir, placeholder.into()))
                })
                .collect(),
        }
    }

    /// Placeholders for the directories of the current user and machine.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        #[cfg(windows)]
        let pairs = [
            (var("ProgramData"), "%ProgramData%"),
            (var("APPDATA"), "%AppData%"),
            (var("ProgramFiles"), "%ProgramFiles%"),
        ];
        #[cfg(not(windows))]
        let pairs = [(var("HOME"), "~")];

        Self::new(pairs.into_iter().filter_map(|(dir, label)| dir.map(|d| (d, label))))
    }

    pub fn shorten(&self, path: &str) -> String {
        if path == IN_MEMORY {
            return path.to_string();
        }

        for (dir, placeholder) in &self.prefixes {
            let Some(head) = path.get(..dir.len()) else {
                continue;
            };
            let rest = &path[dir.len()..];
            let at_boundary = rest.is_empty() || rest.starts_with(['/', '\\']);
            if at_boundary && head.eq_ignore_ascii_case(dir) {
                return format!("{}{}", placeholder, rest);
            }
        }

        path.to_string()
    }
}

// =============================================================================
// Renderer
// =============================================================================

/// Console styles; all plain when colour is off.
#[derive(Debug, Clone)]
pub struct Renderer {
    shortener: PathShortener,
    conflict: Style,
    heading: Style,
    tip: Style,
    warning: Style,
    error: Style,
}

impl Renderer {
    pub fn new(shortener: PathShortener, color: bool) -> Self {
        let pick = |style: Style| if color { style } else { Style::new() };
        Self {
            shortener,
            conflict: pick(Style::new().yellow()),
            heading: pick(Style::new().bold()),
            tip: pick(Style::new().cyan()),
            warning: pick(Style::new().yellow().bold()),
            error: pick(Style::new().red()),
        }
    }

    pub fn write_header<W: Write>(&self, out: &mut W, selection: &Selection, report: &InspectionReport) -> io::Result<()> {
        writeln!(out, "Found {} (PID: {})", selection.label, report.pid)?;
        writeln!(
            out,
            "CLR Version: {} ({:?})",
            report.runtime.version, report.runtime.kind
        )?;
        if let Some(filter) = &report.filter {
            writeln!(out, "Filter: \"{}\"", filter)?;
        }
        writeln!(out)
    }

    pub fn write_report<W: Write>(&self, out: &mut W, report: &InspectionReport) -> io::Result<()> {
        if report.is_empty() {
            let message = match &report.filter {
                None => format!("No managed assemblies found in process {}.", report.pid),
                Some(filter) => format!(
                    "No assemblies matching \"{}\" ({} loaded).",
                    filter, report.total_loaded
                ),
            };
            writeln!(out, "{}", self.warning.apply_to(message))?;
            return Ok(());
        }

        let header = format!(
            "{:<name$} {:<version$} {}",
            "Assembly Name",
            "Version",
            "Location",
            name = NAME_WIDTH,
            version = VERSION_WIDTH
        );
        writeln!(out, "{}", self.heading.apply_to(header))?;
        writeln!(out, "{}", "-".repeat(RULE_WIDTH))?;

        for module in &report.modules {
            let line = format!(
                "{:<name$} {:<version$} {}",
                module.name,
                module.version,
                self.shortener.shorten(&module.source_path),
                name = NAME_WIDTH,
                version = VERSION_WIDTH
            );
            if module.conflict_prone {
                writeln!(out, "{}", self.conflict.apply_to(line))?;
            } else {
                writeln!(out, "{}", line)?;
            }
        }

        writeln!(out)?;
        writeln!(out, "Found {} assemblies", report.total_loaded)?;
        if let Some(filter) = &report.filter {
            writeln!(out, "Showing {} matching \"{}\"", report.count(), filter)?;
        }
        if report.skipped_records > 0 {
            writeln!(out, "{} module records could not be read", report.skipped_records)?;
        }

        let flagged = report.conflict_prone_count();
        if flagged > 0 {
            writeln!(
                out,
                "{}",
                self.conflict
                    .apply_to(format!("{} highlighted assemblies commonly conflict between add-ins", flagged))
            )?;
        }

        self.write_version_conflicts(out, report)?;

        if report.filter.is_none() {
            writeln!(out)?;
            writeln!(out, "{}", self.tip.apply_to("TIP: Run with a filter to search, e.g.:"))?;
            writeln!(out, "{}", self.tip.apply_to("  dllinspect Newtonsoft"))?;
            writeln!(out, "{}", self.tip.apply_to("  dllinspect System.Text.Json"))?;
        }
        Ok(())
    }

    fn write_version_conflicts<W: Write>(&self, out: &mut W, report: &InspectionReport) -> io::Result<()> {
        if report.version_conflicts.is_empty() {
            return Ok(());
        }

        writeln!(out)?;
        writeln!(
            out,
            "{}",
            self.warning
                .apply_to("Loaded at more than one version (only the first is listed above):")
        )?;
        for conflict in &report.version_conflicts {
            writeln!(out, "  {}: {}", conflict.name, conflict.versions.join(", "))?;
        }
        Ok(())
    }

    pub fn write_error<W: Write>(&self, out: &mut W, error: &CliError) -> io::Result<()> {
        writeln!(out, "{}", self.error.apply_to(format!("ERROR: {}", error)))?;
        let hints = error.hints();
        if !hints.is_empty() {
            writeln!(out)?;
            for hint in hints {
                writeln!(out, "{}", self.error.apply_to(hint))?;
            }
        }
        Ok(())
    }
}

/// Pretty-printed JSON of the whole report.
pub fn write_json<W: Write>(out: &mut W, report: &InspectionReport) -> Result<(), CliError> {
    serde_json::to_writer_pretty(&mut *out, report)?;
    writeln!(out)?;
    Ok(())
}
