//! Target process discovery and selection.

use console::Term;
use dialoguer::Select;
use dialoguer::theme::ColorfulTheme;

use crate::error::{CliError, Result};

/// Hosts searched when neither `--pid` nor `--name` is given: (display name, process name).
pub const HOST_PRESETS: &[(&str, &str)] = &[
    ("Revit", "Revit"),
    ("AutoCAD", "acad"),
    // Civil 3D runs inside acad.exe too
    ("Civil 3D", "acad"),
];

/// A running process as seen by the process list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// The process chosen for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub pid: u32,
    pub label: String,
}

/// A preset host with its running instances.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    label: String,
    instances: Vec<ProcessEntry>,
}

fn normalize_name(name: &str) -> String {
    let lower = name.trim().to_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => stem.to_string(),
        None => lower,
    }
}

/// Processes whose image name equals `name`, ignoring case and `.exe`.
pub fn find_by_name<'a>(processes: &'a [ProcessEntry], name: &str) -> Vec<&'a ProcessEntry> {
    let wanted = normalize_name(name);
    processes
        .iter()
        .filter(|p| normalize_name(&p.name) == wanted)
        .collect()
}

/// Running preset hosts, one candidate per distinct process name.
fn preset_candidates(processes: &[ProcessEntry]) -> Vec<Candidate> {
    let mut candidates: Vec<(&str, Candidate)> = Vec::new();

    for &(app, process_name) in HOST_PRESETS {
        if let Some((_, existing)) = candidates.iter_mut().find(|(p, _)| *p == process_name) {
            existing.label = format!("{} / {}", existing.label, app);
            continue;
        }
        let instances: Vec<ProcessEntry> = find_by_name(processes, process_name)
            .into_iter()
            .cloned()
            .collect();
        if !instances.is_empty() {
            candidates.push((
                process_name,
                Candidate {
                    label: app.to_string(),
                    instances,
                },
            ));
        }
    }

    candidates.into_iter().map(|(_, c)| c).collect()
}

/// Pick the first instance, warning when there are several.
fn first_instance(label: &str, instances: &[ProcessEntry]) -> Option<Selection> {
    let first = instances.first()?;
    if instances.len() > 1 {
        tracing::warn!(
            count = instances.len(),
            pid = first.pid,
            "Multiple {} instances found, attaching to the first one",
            label
        );
    }
    Some(Selection {
        pid: first.pid,
        label: label.to_string(),
    })
}

fn choose(candidates: &[Candidate], interactive: bool) -> Result<usize> {
    if !interactive {
        tracing::warn!(
            chosen = %candidates[0].label,
            "Multiple applications detected, using the first (non-interactive)"
        );
        return Ok(0);
    }

    let labels: Vec<String> = candidates
        .iter()
        .map(|c| match c.instances.as_slice() {
            [single] => format!("{} (PID {})", c.label, single.pid),
            many => format!("{} ({} instances)", c.label, many.len()),
        })
        .collect();

    Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Multiple applications detected. Select application")
        .items(&labels)
        .default(0)
        .interact_on_opt(&Term::stderr())?
        .ok_or(CliError::SelectionCancelled)
}

/// Resolve the target from `--pid`, `--name`, or the host presets.
pub fn resolve_target(
    processes: &[ProcessEntry],
    pid: Option<u32>,
    name: Option<&str>,
    interactive: bool,
) -> Result<Selection> {
    if let Some(pid) = pid {
        let label = processes
            .iter()
            .find(|p| p.pid == pid)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "process".to_string());
        return Ok(Selection { pid, label });
    }

    if let Some(name) = name {
        let instances: Vec<ProcessEntry> = find_by_name(processes, name).into_iter().cloned().collect();
        return first_instance(name, &instances).ok_or_else(|| CliError::ProcessNotFound(format!("'{}'", name)));
    }

    let candidates = preset_candidates(processes);
    let index = match candidates.len() {
        0 => return Err(CliError::ProcessNotFound("Revit or AutoCAD".to_string())),
        1 => 0,
        _ => choose(&candidates, interactive)?,
    };
    let candidate = &candidates[index];
    first_instance(&candidate.label, &candidate.instances)
        .ok_or_else(|| CliError::ProcessNotFound(candidate.label.clone()))
}

// =============================================================================
// Process listing
// =============================================================================

/// Every process whose image name can be read, sorted by PID.
#[cfg(windows)]
pub fn list_processes() -> Result<Vec<ProcessEntry>> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::ProcessStatus::{EnumProcesses, GetModuleBaseNameW};
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_INFORMATION, PROCESS_VM_READ};

    let mut pids = [0u32; 4096];
    let mut bytes_returned: u32 = 0;

    unsafe {
        EnumProcesses(
            pids.as_mut_ptr(),
            (pids.len() * std::mem::size_of::<u32>()) as u32,
            &mut bytes_returned,
        )
    }
    .map_err(|e| std::io::Error::other(e.to_string()))?;

    let count = bytes_returned as usize / std::mem::size_of::<u32>();
    let mut processes = Vec::new();

    for &pid in &pids[..count] {
        if pid == 0 {
            continue;
        }
        let Ok(process) =
            (unsafe { OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid) })
        else {
            continue;
        };

        let mut name_buf = [0u16; 260];
        let len = unsafe { GetModuleBaseNameW(process, None, &mut name_buf) };
        let _ = unsafe { CloseHandle(process) };

        if len > 0 {
            processes.push(ProcessEntry {
                pid,
                name: String::from_utf16_lossy(&name_buf[..len as usize]),
            });
        }
    }

    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

/// Every process whose `comm` can be read, sorted by PID.
#[cfg(not(windows))]
pub fn list_processes() -> Result<Vec<ProcessEntry>> {
    let mut processes = Vec::new();

    for entry in std::fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Processes can exit between listing and reading.
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        processes.push(ProcessEntry {
            pid,
            name: comm.trim_end().to_string(),
        });
    }

    processes.sort_by_key(|p| p.pid);
    Ok(processes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(pid: u32, name: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            name: name.to_string(),
        }
    }

    #[test]
    fn name_match_ignores_case_and_extension() {
        let processes = [process(1, "Revit.exe"), process(2, "acad.exe"), process(3, "REVIT")];
        let found: Vec<u32> = find_by_name(&processes, "revit").iter().map(|p| p.pid).collect();
        assert_eq!(found, vec![1, 3]);

        let found: Vec<u32> = find_by_name(&processes, "ACAD.EXE").iter().map(|p| p.pid).collect();
        assert_eq!(found, vec![2]);
    }

    #[test]
    fn explicit_pid_wins() {
        let processes = [process(10, "Revit.exe")];
        let selection = resolve_target(&processes, Some(10), Some("acad"), false).unwrap();
        assert_eq!(
            selection,
            Selection {
                pid: 10,
                label: "Revit.exe".into()
            }
        );

        let selection = resolve_target(&processes, Some(99), None, false).unwrap();
        assert_eq!(selection.pid, 99);
        assert_eq!(selection.label, "process");
    }

    #[test]
    fn name_selects_first_instance() {
        let processes = [process(5, "dotnet"), process(7, "dotnet"), process(9, "bash")];
        let selection = resolve_target(&processes, None, Some("dotnet"), false).unwrap();
        assert_eq!(selection.pid, 5);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let processes = [process(9, "bash")];
        let err = resolve_target(&processes, None, Some("Revit"), false).unwrap_err();
        assert!(matches!(err, CliError::ProcessNotFound(_)));
    }

    #[test]
    fn no_running_host_is_not_found() {
        let processes = [process(9, "bash")];
        let err = resolve_target(&processes, None, None, false).unwrap_err();
        assert!(matches!(err, CliError::ProcessNotFound(_)));
    }

    #[test]
    fn single_host_with_several_instances_picks_first() {
        let processes = [process(30, "Revit.exe"), process(20, "Revit.exe")];
        let selection = resolve_target(&processes, None, None, false).unwrap();
        assert_eq!(selection.pid, 30);
        assert_eq!(selection.label, "Revit");
    }

    #[test]
    fn autocad_and_civil_share_one_candidate() {
        let processes = [process(4, "acad.exe")];
        let candidates = preset_candidates(&processes);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].label, "AutoCAD / Civil 3D");

        let selection = resolve_target(&processes, None, None, false).unwrap();
        assert_eq!(selection.pid, 4);
    }

    #[test]
    fn several_hosts_non_interactive_picks_first_preset() {
        let processes = [process(4, "acad.exe"), process(8, "Revit.exe")];
        let selection = resolve_target(&processes, None, None, false).unwrap();
        assert_eq!(selection.pid, 8);
        assert_eq!(selection.label, "Revit");
    }
}
