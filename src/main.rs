//! pvefw service wrapper.
//!
//! The binary drives the core pipeline:
//!
//! ```bash
//! pvefw start [--debug]   # run the update daemon in the foreground
//! pvefw stop              # stop a running daemon / remove the chains
//! pvefw compile           # compile and report pending changes
//! pvefw status            # firewall status and change detection
//! ```
//!
//! The daemon runs one compile+apply cycle every tick, each under the
//! advisory lock. SIGINT/SIGTERM/SIGQUIT act at cycle boundaries: the
//! managed chains are removed and the process exits. SIGHUP requests an
//! immediate next cycle.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use pvefw::config::{FwPaths, LOCK_TIMEOUT, TICK_INTERVAL};
use pvefw::core::compile::compile_from_paths;
use pvefw::core::ipt::{self, Iptables, KernelFilter};
use pvefw::core::reconcile;
use pvefw::{audit, lockfile, utils};

#[derive(Parser)]
#[command(name = "pvefw")]
#[command(about = "Host firewall compiler and reconciler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the firewall update daemon in the foreground
    Start {
        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },
    /// Stop a running daemon, or remove the managed chains directly
    Stop,
    /// Compile the ruleset and report whether the kernel is out of date
    Compile,
    /// Show firewall status and pending changes
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.command {
        Commands::Start { debug: true } => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(run(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> pvefw::Result<()> {
    let paths = FwPaths::default();
    let kernel = Iptables::default();

    match command {
        Commands::Start { .. } => daemon(&paths, &kernel).await,
        Commands::Stop => stop(&paths, &kernel).await,
        Commands::Compile => {
            let _guard = lockfile::lock_file(&paths.lock_file, LOCK_TIMEOUT)?;
            let ruleset = compile_from_paths(&paths)?;
            let changed = reconcile::has_changes(&kernel, &ruleset).await?;
            println!("{}", if changed { "detected changes" } else { "no changes" });
            Ok(())
        }
        Commands::Status => status(&paths, &kernel).await,
    }
}

/// One compile+apply cycle under the lock.
async fn run_cycle(paths: &FwPaths, kernel: &Iptables) -> pvefw::Result<()> {
    let _guard = lockfile::lock_file(&paths.lock_file, LOCK_TIMEOUT)?;
    ipt::enable_bridge_firewall(&paths.bridge_proc_dir);
    let ruleset = compile_from_paths(paths)?;
    match reconcile::apply(kernel, &ruleset).await {
        Ok(summary) => {
            if summary.changed() {
                audit::log_apply(summary.created, summary.updated, summary.deleted, true, None)
                    .await;
            }
            Ok(())
        }
        Err(e) => {
            audit::log_apply(0, 0, 0, false, Some(e.to_string())).await;
            Err(e)
        }
    }
}

async fn daemon(paths: &FwPaths, kernel: &Iptables) -> pvefw::Result<()> {
    utils::ensure_dirs()?;
    write_pid_file(paths)?;
    info!("starting firewall daemon");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    loop {
        if let Err(e) = run_cycle(paths, kernel).await {
            // lock timeouts and apply failures end the cycle, not the daemon
            error!("update cycle failed: {e}");
        }

        tokio::select! {
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
            _ = sigquit.recv() => break,
            _ = sighup.recv() => info!("SIGHUP received, running immediate update"),
        }
    }

    info!("shutting down, removing firewall chains");
    let result = shutdown(paths, kernel).await;
    let _ = std::fs::remove_file(&paths.pid_file);
    result
}

async fn shutdown(paths: &FwPaths, kernel: &Iptables) -> pvefw::Result<()> {
    let _guard = lockfile::lock_file(&paths.lock_file, LOCK_TIMEOUT)?;
    match reconcile::remove_managed_chains(kernel).await {
        Ok(()) => {
            audit::log_remove(true, None).await;
            Ok(())
        }
        Err(e) => {
            audit::log_remove(false, Some(e.to_string())).await;
            Err(e)
        }
    }
}

async fn stop(paths: &FwPaths, kernel: &Iptables) -> pvefw::Result<()> {
    if let Some(pid) = read_pid_file(paths)
        && pid_alive(pid)
    {
        info!("sending SIGTERM to daemon (pid {pid})");
        nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGTERM,
        )
        .map_err(std::io::Error::from)?;
        return Ok(());
    }

    // no daemon running; remove the chains ourselves
    shutdown(paths, kernel).await
}

async fn status(paths: &FwPaths, kernel: &Iptables) -> pvefw::Result<()> {
    let _guard = lockfile::lock_file(&paths.lock_file, LOCK_TIMEOUT)?;
    match kernel.get_chains().await {
        Err(e) => {
            warn!("unable to read kernel chains: {e}");
            println!("status: unknown");
        }
        Ok(chains) if !chains.contains_key("PVEFW-INPUT") => {
            println!("status: stopped");
        }
        Ok(_) => {
            println!("status: active");
            let ruleset = compile_from_paths(paths)?;
            let changed = reconcile::has_changes(kernel, &ruleset).await?;
            println!("changes: {}", if changed { "detected" } else { "none" });
        }
    }
    Ok(())
}

fn write_pid_file(paths: &FwPaths) -> pvefw::Result<()> {
    if let Some(parent) = paths.pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&paths.pid_file, format!("{}\n", std::process::id()))?;
    Ok(())
}

fn read_pid_file(paths: &FwPaths) -> Option<i32> {
    std::fs::read_to_string(&paths.pid_file)
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn pid_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
