use clap::{Parser, Subcommand};
use sleepproxy::capture::AfPacketDevice;
use sleepproxy::config;
use sleepproxy::engine::WakeOrchestrator;
use sleepproxy::neighbor::{IpNeighCache, NeighborCache, NoopNeighborCache};
use sleepproxy::telemetry::init_logging;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "sleepproxy.toml";

/// Largest frame read from the capture socket
const SNAPLEN: usize = 65536;

#[derive(Parser)]
#[command(name = "sleepproxy")]
#[command(about = "Keeps sleeping hosts reachable and wakes them on demand")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate sleepproxy.toml without starting
    Validate {
        /// Path to sleepproxy.toml
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Run the proxy daemon
    Run {
        /// Path to sleepproxy.toml
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Validate { config }) => cmd_validate(&config),
        Some(Commands::Run { config }) => cmd_run(&config),
        None => cmd_run(Path::new(DEFAULT_CONFIG)),
    };
    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn cmd_validate(config_path: &Path) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();
    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }

    // Catches what only shows up once hosts reference each other
    let plans = config::resolve(&cfg).map_err(|e| e.to_string())?;
    for plan in &plans {
        println!(
            "[INFO] {}: {} hosts, {} filter chains on {}",
            plan.name,
            plan.hosts.len(),
            plan.chains.len(),
            plan.interface
        );
    }
    println!("[INFO] Configuration is valid");
    Ok(())
}

fn cmd_run(config_path: &Path) -> Result<(), String> {
    use tokio::runtime::Runtime;

    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;
    // RUST_LOG still takes priority over the [logging] section
    init_logging(Some(&cfg.logging));
    info!("Loaded {}", config_path.display());

    let validation = config::validate(&cfg);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    if validation.has_errors() {
        for e in &validation.errors {
            error!("{}", e);
        }
        return Err("Validation failed".to_string());
    }
    let plans = config::resolve(&cfg).map_err(|e| e.to_string())?;

    let rt = Runtime::new().map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(async move {
        let mut running = Vec::with_capacity(plans.len());

        for plan in plans {
            info!(network = %plan.name, interface = %plan.interface, "Binding to interface");
            let device = Arc::new(
                AfPacketDevice::open(&plan.interface, plan.address, plan.link_local).map_err(
                    |e| {
                        format!(
                            "Failed to open {}: {}. Run with root privileges.",
                            plan.interface, e
                        )
                    },
                )?,
            );
            let neighbors: Arc<dyn NeighborCache> = if plan.neighbor_cache {
                Arc::new(IpNeighCache::spawn(&plan.interface))
            } else {
                Arc::new(NoopNeighborCache)
            };

            let network = plan
                .build(device.clone(), neighbors)
                .map_err(|e| e.to_string())?;
            let wake = WakeOrchestrator::new(network);
            wake.start_pose();

            info!(
                network = %wake.network().name(),
                watched = wake.network().watch_hosts().len(),
                "Network up"
            );
            tokio::spawn(capture_loop(device, Arc::clone(&wake)));
            running.push(wake);
        }

        if running.is_empty() {
            return Err("No networks configured".to_string());
        }
        info!("sleepproxy started, watching {} network(s)", running.len());

        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Failed to wait for shutdown signal: {}", e))?;
        info!("Shutting down");

        for wake in &running {
            let network = wake.network();
            for (name, value) in network.stats().export() {
                info!(network = %network.name(), counter = %name, value, "Final statistics");
            }
        }
        Ok(())
    })
}

async fn capture_loop(device: Arc<AfPacketDevice>, wake: Arc<WakeOrchestrator>) {
    let mut buf = vec![0u8; SNAPLEN];
    loop {
        match device.recv(&mut buf).await {
            Ok(len) => wake.handle_frame(buf[..len].to_vec()).await,
            Err(e) => {
                error!(network = %wake.network().name(), "Receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
