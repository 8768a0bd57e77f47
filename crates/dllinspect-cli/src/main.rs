mod error;
mod render;
mod select;

use std::io::{IsTerminal, Write};
use std::process::ExitCode;

use clap::Parser;
use dllinspect_core::platform::NativeSource;
use dllinspect_core::{ConflictRegistry, InspectOptions, ModuleFilter, inspect};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::Result;
use crate::render::{PathShortener, Renderer};

#[derive(Debug, Parser)]
#[command(name = "dllinspect")]
#[command(version, about = "Inspect the .NET assemblies loaded in a running host process (Revit, AutoCAD, ...)")]
struct Cli {
    /// Process ID to target
    #[arg(short, long, env = "DLLINSPECT_PID", conflicts_with = "name")]
    pid: Option<u32>,

    /// Process name to target (e.g., "Revit.exe" or "acad")
    #[arg(short, long)]
    name: Option<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Never prompt; pick the first candidate instead
    #[arg(long)]
    non_interactive: bool,

    /// Extra assembly name to flag as conflict-prone (repeatable)
    #[arg(long = "conflict", value_name = "NAME")]
    conflicts: Vec<String>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Case-insensitive search over assembly names and paths
    #[arg(trailing_var_arg = true, value_name = "FILTER")]
    filter: Vec<String>,
}

impl Cli {
    fn filter(&self) -> Option<String> {
        (!self.filter.is_empty()).then(|| self.filter.join(" "))
    }

    fn interactive(&self) -> bool {
        !self.non_interactive && std::io::stdin().is_terminal() && console::Term::stderr().is_term()
    }
}

/// Log to stderr so stdout stays clean for `--json`.
///
/// `-v`/`-vv` override `RUST_LOG`; otherwise it applies, defaulting to warnings only.
fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dllinspect=warn")),
        1 => EnvFilter::new("dllinspect=info"),
        _ => EnvFilter::new("dllinspect=debug"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn run(cli: &Cli, renderer: &Renderer) -> Result<()> {
    // With --pid the listing only provides a label, so failing to read it is fine.
    let processes = if cli.pid.is_some() {
        select::list_processes().unwrap_or_default()
    } else {
        select::list_processes()?
    };
    let selection = select::resolve_target(&processes, cli.pid, cli.name.as_deref(), cli.interactive())?;
    tracing::info!(pid = selection.pid, label = %selection.label, "Selected target process");

    let filter = cli.filter();
    let options = InspectOptions {
        filter: ModuleFilter::new(filter.as_deref()),
        registry: ConflictRegistry::with_additional(&cli.conflicts),
    };
    let report = inspect(&NativeSource::default(), selection.pid, &options)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    if cli.json {
        render::write_json(&mut out, &report)?;
    } else {
        renderer.write_header(&mut out, &selection, &report)?;
        renderer.write_report(&mut out, &report)?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.no_color {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }
    let color = !cli.no_color && console::colors_enabled();
    let renderer = Renderer::new(PathShortener::from_env(), color);

    tracing::debug!("dllinspect starting with args: {:?}", cli);

    match run(&cli, &renderer) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let _ = renderer.write_error(&mut std::io::stderr().lock(), &e);
            ExitCode::FAILURE
        }
    }
}
