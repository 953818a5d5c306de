use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use edge_transports::{
    logging::{init_logging, LoggingConfig},
    simulate::{load_topology, simulate},
};
use tracing::info;

/// Edge transport coordinator tooling
#[derive(Parser, Debug)]
#[command(name = "edge-transports")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Default log filter when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info", env = "EDGE_TRANSPORTS_LOG_LEVEL")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a cluster topology file
    Check {
        topology: PathBuf,
    },
    /// Connect every host of a topology and print the resulting active edges
    Simulate {
        topology: PathBuf,

        /// Print each update as a JSON protocol message
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LoggingConfig {
        level: cli.log_level,
        json: cli.log_json,
    });

    match cli.command {
        Command::Check { topology } => {
            let parsed = load_topology(&topology)?;
            info!(
                hosts = parsed.hosts.len(),
                instances = parsed.instances.len(),
                "Topology is valid"
            );
            println!("{}: ok", topology.display());
        }
        Command::Simulate { topology, json } => {
            let parsed = load_topology(&topology)?;
            let report = simulate(&parsed);
            for update in report.updates.values() {
                if json {
                    println!("{}", serde_json::to_string(&update.to_message())?);
                } else {
                    println!(
                        "instance {} (host {}): set_active_edges {:?}",
                        update.instance_id, update.host_id, update.active_edges
                    );
                }
            }
            if !json {
                println!("{} edges active", report.active_edges.len());
            }
        }
    }
    Ok(())
}
