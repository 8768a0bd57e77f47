//! Error types for the command-line front end.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Inspect(#[from] dllinspect_core::Error),

    #[error("No process found matching {0}")]
    ProcessNotFound(String),

    #[error("Selection cancelled")]
    SelectionCancelled,

    #[error("Prompt failed: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error("Failed to write JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Follow-up advice shown under the error message.
    pub fn hints(&self) -> &'static [&'static str] {
        match self {
            CliError::Inspect(dllinspect_core::Error::AttachFailed { .. }) => &[
                "This may happen if:",
                "  - You need to run as Administrator (or root)",
                "  - The application is running as a different user",
                "  - AntiVirus is blocking process inspection",
                "  - The tool and the target differ in bitness (32/64-bit)",
            ],
            CliError::Inspect(dllinspect_core::Error::NoManagedEnvironment { .. }) => &[
                "The process does not host a .NET runtime this tool can read.",
                "Check that the right process was selected.",
            ],
            CliError::ProcessNotFound(_) => &[
                "Start Revit or AutoCAD and try again,",
                "or pick a process with --pid <PID> or --name <NAME>.",
            ],
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;
