use anyhow::anyhow;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use log::info;
use relevo::config::{Config, ConfigError};
use relevo::conn::tcp::{HostProber, ProbeResult};
use relevo::topology::HostSpec;
use relevo::utils::{format_duration, parse_host_list};
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "relevo")]
#[command(
    about = "Multi-host connection routing, load balancing and failover for database client drivers"
)]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Relevo Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate example configuration files
    Config {
        /// Topology mode (load_balanced, failover or replication)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Probe the reachability of configured hosts
    Check {
        /// Path to configuration file listing the hosts
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Probe an explicit "host:port,host:port" list instead
        #[arg(long)]
        hosts: Option<String>,
        /// Per-host connect timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Config { mode, output } => {
            generate_config(mode, output)?;
        }
        Commands::Check {
            config,
            hosts,
            timeout_ms,
        } => {
            check_hosts(config, hosts, timeout_ms).await?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Topology mode: {}", config.topology.mode_name());
            println!("  Balance strategy: {}", config.routing.strategy);
            println!("  Retry count: {}", config.routing.retry_count);
            println!("  Hosts: {} configured", config.topology.all_hosts().len());
            for (i, host) in config.topology.all_hosts().iter().enumerate() {
                println!("    {}: {}", i + 1, host);
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> anyhow::Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode)
        .map_err(|e| anyhow!("Failed to generate config: {}", e))?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  relevo check --config {:?}", output);

    Ok(())
}

async fn check_hosts(
    config: Option<PathBuf>,
    hosts: Option<String>,
    timeout_ms: u64,
) -> anyhow::Result<()> {
    let specs: Vec<HostSpec> = match (hosts, config) {
        (Some(list), _) => parse_host_list(&list)?,
        (None, Some(path)) => {
            let config = Config::load_from_file(&path)?;
            config
                .topology
                .all_hosts()
                .iter()
                .map(|host| host.parse())
                .collect::<Result<_, _>>()?
        }
        (None, None) => {
            return Err(anyhow!("pass either --config or --hosts"));
        }
    };

    if specs.is_empty() {
        return Err(anyhow!("no hosts to probe"));
    }

    info!("Probing {} host(s)", specs.len());
    let started = Instant::now();
    let prober = HostProber::new(Duration::from_millis(timeout_ms));
    let results = join_all(specs.iter().map(|spec| prober.probe(spec))).await;

    let mut unreachable = 0;
    for (spec, result) in specs.iter().zip(results) {
        match result {
            ProbeResult::Reachable { rtt } => {
                println!("✓ {} reachable ({:?})", spec, rtt);
            }
            ProbeResult::ConnectionRefused => {
                unreachable += 1;
                println!("✗ {} connection refused", spec);
            }
            ProbeResult::Timeout => {
                unreachable += 1;
                println!("✗ {} timed out after {}ms", spec, timeout_ms);
            }
            ProbeResult::NetworkError(e) => {
                unreachable += 1;
                println!("✗ {} network error: {}", spec, e);
            }
        }
    }

    println!(
        "Probed {} host(s) in {}",
        specs.len(),
        format_duration(started.elapsed())
    );

    if unreachable > 0 {
        return Err(anyhow!("{} of {} hosts unreachable", unreachable, specs.len()));
    }
    Ok(())
}

fn show_version() {
    println!("relevo v{}", env!("CARGO_PKG_VERSION"));
    println!("Multi-host connection routing, load balancing and failover for database client drivers");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Load-balanced routing with pluggable balance strategies");
    println!("  • Primary/secondary failover with return-to-primary policy");
    println!("  • Replication-aware read/write splitting");
    println!("  • TTL host blacklisting with bounded retry");
    println!("  • Connection groups with broadcast topology changes");
}
