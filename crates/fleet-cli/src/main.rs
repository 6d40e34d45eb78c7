//! fleetctl - Controller CLI for the fleet orchestrator
//!
//! Edits a persisted instance list (`devices`/`add`/`remove`/`list`) and
//! runs the whole fleet (`run`): start every instance, stream the merged
//! log feed, and stop everything on ctrl-c.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use fleet_orchestrator::config::DEFAULT_HOST;
use fleet_orchestrator::{
    DeviceRegistry, DeviceSelector, FleetConfig, InstanceConfig, InstanceRegistry, LogHub,
    ServerCommand, VramMode,
};

#[derive(Parser, Debug)]
#[command(name = "fleetctl")]
#[command(version)]
#[command(about = "Orchestrate multiple generative-media server instances across GPUs")]
struct Cli {
    /// Path to the persisted instance list
    #[arg(long, default_value = "instances.json")]
    instances: PathBuf,

    /// Server program to spawn for each instance
    #[arg(long, default_value = "python")]
    server: PathBuf,

    /// Leading argument for the server program (repeatable, e.g. --server-arg main.py)
    #[arg(long = "server-arg")]
    server_args: Vec<String>,

    /// Working directory for spawned servers
    #[arg(long)]
    server_dir: Option<PathBuf>,

    /// Host instances listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List detected compute devices
    Devices,
    /// List configured instances
    List,
    /// Add an instance to the persisted list
    Add {
        /// Device to pin the instance to: "cpu" or a GPU index
        #[arg(long)]
        device: DeviceSelector,

        /// Port to listen on (defaults to the lowest free port in range)
        #[arg(long)]
        port: Option<u16>,

        /// VRAM mode: normal, low, none, cpu
        #[arg(long, default_value = "normal")]
        vram_mode: VramMode,

        /// Extra launch flag passed through to the server (repeatable)
        #[arg(long = "flag")]
        flags: Vec<String>,
    },
    /// Remove an instance from the persisted list
    Remove {
        /// Instance id, e.g. gpu0_8188
        id: String,
    },
    /// Start all configured instances and stream their logs until ctrl-c
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    if let Command::Devices = cli.command {
        for device in DeviceRegistry::detect() {
            println!("{:>6}  {}", device.selector.to_string(), device.label);
        }
        return Ok(());
    }

    let mut server = ServerCommand::new(&cli.server).with_args(cli.server_args.clone());
    if let Some(dir) = &cli.server_dir {
        server = server.with_working_dir(dir);
    }
    let config = FleetConfig::new(server).with_host(cli.host.clone());

    let logs = std::sync::Arc::new(LogHub::new());
    let registry = InstanceRegistry::new(config, std::sync::Arc::clone(&logs));
    registry.restore(&cli.instances);

    match cli.command {
        Command::Devices => unreachable!("handled above"),
        Command::List => {
            let instances = registry.list();
            if instances.is_empty() {
                println!("no instances configured");
                return Ok(());
            }
            for snap in instances {
                println!(
                    "{:<12} {:<8} port {:<5} vram {:<6} {}",
                    snap.id,
                    snap.state.to_string(),
                    snap.config.port,
                    snap.config.vram_mode.to_string(),
                    snap.config.device_label,
                );
            }
        }
        Command::Add {
            device,
            port,
            vram_mode,
            flags,
        } => {
            let port = match port {
                Some(port) => port,
                None => registry.next_available_port()?,
            };
            let devices = DeviceRegistry::detect();
            let label = DeviceRegistry::label_for(&devices, device);
            let config = InstanceConfig::new(device, label, port)
                .with_vram_mode(vram_mode)
                .with_extra_flags(flags);
            let snap = registry.add_instance(config)?;
            registry.save(&cli.instances)?;
            println!("added {} ({} on port {})", snap.id, snap.config.device_label, snap.config.port);
        }
        Command::Remove { id } => {
            let config = registry.remove_instance(&id)?;
            registry.save(&cli.instances)?;
            println!("removed {} (port {} released)", id, config.port);
        }
        Command::Run => run_fleet(&registry, &logs).await?,
    }

    Ok(())
}

/// Start everything, stream logs, and shut the fleet down on ctrl-c.
async fn run_fleet(registry: &InstanceRegistry, logs: &LogHub) -> Result<()> {
    let total = registry.list().len();
    if total == 0 {
        println!("no instances configured; add some with `fleetctl add`");
        return Ok(());
    }

    let mut rx = logs.subscribe();

    let outcomes = registry.start_all();
    let started = outcomes.iter().filter(|(_, r)| r.is_ok()).count();
    println!("started {}/{} instance(s); press ctrl-c to stop", started, outcomes.len());
    for (id, outcome) in &outcomes {
        if let Err(e) = outcome {
            eprintln!("{}: {}", id, e);
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            line = rx.recv() => match line {
                Ok(line) => println!("{}", line.format()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    eprintln!("(log feed lagged, {} lines dropped)", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    println!("stopping all instances...");
    registry.stop_all();

    // Drain remaining output until every process is confirmed gone, bounded
    // by the grace + kill windows.
    let fleet = registry.fleet_config();
    let deadline = tokio::time::Instant::now()
        + fleet.grace_period
        + fleet.kill_timeout
        + Duration::from_secs(2);
    while registry.any_live() && tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            line = rx.recv() => {
                if let Ok(line) = line {
                    println!("{}", line.format());
                }
            }
        }
    }

    let crashed: Vec<String> = registry
        .list()
        .into_iter()
        .filter(|s| s.state == fleet_orchestrator::InstanceState::Crashed)
        .map(|s| s.id)
        .collect();
    if !crashed.is_empty() {
        eprintln!("instances ended in a crashed state: {}", crashed.join(", "));
    }
    println!("shutdown complete");
    Ok(())
}
