//! remotehook-inject - loads a DLL into a running process and optionally
//! calls one of its exports.

use clap::Parser;
use std::path::PathBuf;

#[cfg(windows)]
use anyhow::Context;
#[cfg(windows)]
use remotehook::inject::{InjectFlags, call_export, inject_dll};
#[cfg(windows)]
use remotehook::process::Process;

/// Injects a DLL into a process.
#[derive(Parser)]
#[command(name = "remotehook-inject")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Id of the target process
    #[arg(long)]
    pid: u32,

    /// Path of the DLL to load
    #[arg(long)]
    path: PathBuf,

    /// Resolve a relative path against the injector's own directory
    #[arg(long)]
    path_resolution: bool,

    /// Export to call once the DLL is loaded
    #[arg(long)]
    export: Option<String>,
}

fn parse_args() -> Cli {
    // help and usage errors both exit with 1
    Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    })
}

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = parse_args();

    let process = Process::open(cli.pid).with_context(|| format!("opening process {}", cli.pid))?;
    let mut flags = InjectFlags::empty();
    if cli.path_resolution {
        flags |= InjectFlags::PATH_RESOLUTION;
    }
    let module = inject_dll(&process, &cli.path, flags)
        .with_context(|| format!("injecting {}", cli.path.display()))?;
    println!("Module base: {module:#x}");

    if let Some(export) = &cli.export {
        let result = call_export(&process, module, export)
            .with_context(|| format!("calling export {export}"))?;
        println!("Return value: {:#x}", result.value());
        println!("Last error: {:#x}", result.last_error());
    }
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    let _ = parse_args();
    eprintln!("remotehook-inject is only supported on Windows");
    std::process::exit(1);
}
