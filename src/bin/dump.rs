//! remotehook-dump - prints the modules and memory regions of one or all
//! processes.

use clap::Parser;

#[cfg(windows)]
use remotehook::process::{self, Process, RegionInfo, RegionState};

/// Lists modules and memory regions with their protection.
#[derive(Parser)]
#[command(name = "remotehook-dump")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Id of the process to dump; every process when omitted
    #[arg(long)]
    pid: Option<u32>,
}

fn parse_args() -> Cli {
    // help and usage errors both exit with 1
    Cli::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        std::process::exit(1);
    })
}

#[cfg(windows)]
fn print_region(region: &RegionInfo) {
    if region.state == RegionState::Free {
        return;
    }
    println!(
        "  {:#018x}-{:#018x} {:<8} {:<8} alloc:{:#018x} {:?}",
        region.base,
        region.end(),
        format!("{:?}", region.state),
        format!("{:?}", region.kind),
        region.alloc_base,
        region.protect,
    );
}

#[cfg(windows)]
fn dump(pid: u32) -> anyhow::Result<()> {
    use anyhow::Context;

    let process = Process::open(pid).with_context(|| format!("opening process {pid}"))?;
    println!("Process {pid}");
    println!(" Modules:");
    for module in process.modules()? {
        println!(
            "  {:#018x} {:>10} {} ({})",
            module.base,
            module.size,
            module.name,
            module.path.display()
        );
    }
    println!(" Regions:");
    for region in process::regions(&process) {
        print_region(&region);
    }
    Ok(())
}

#[cfg(windows)]
fn main() -> anyhow::Result<()> {
    use tracing::warn;
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = parse_args();
    match cli.pid {
        Some(pid) => dump(pid),
        None => {
            for entry in process::processes()? {
                // system and protected processes can't be opened
                if let Err(e) = dump(entry.pid) {
                    warn!(pid = entry.pid, name = %entry.name, error = %e, "skipped");
                }
            }
            Ok(())
        }
    }
}

#[cfg(not(windows))]
fn main() {
    let _ = parse_args();
    eprintln!("remotehook-dump is only supported on Windows");
    std::process::exit(1);
}
