use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use fleet_coordinator::{file_storage, Coordinator, WorkPackage};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Fleet Coordinator - plan work packages and inspect shared coordination state
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project directory whose `.fleet/` store is used
    #[arg(long, env = "FLEET_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute a distribution plan from a JSON array of work packages
    Plan {
        file: PathBuf,

        /// Cap on concurrently running agents
        #[arg(long)]
        max_agents: Option<usize>,

        /// Work package ids already finished
        #[arg(long, value_delimiter = ',')]
        completed: Vec<String>,
    },

    /// List registered agents
    Agents,

    /// Remove agents whose heartbeat is older than the timeout
    Reap {
        /// Overrides the configured stale timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// List held locks
    Locks,

    /// Release a lock on behalf of its holder
    Unlock {
        resource: String,

        #[arg(long)]
        holder: String,
    },

    /// Show operations queued for an agent by conflict resolution
    Queued {
        agent: String,

        /// Drop the queued operations after printing them
        #[arg(long)]
        clear: bool,
    },

    /// Show the last usage report an agent published
    Usage { agent: String },
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let coordinator = Coordinator::open(&cli.root)?;

    match cli.command {
        Command::Plan {
            file,
            max_agents,
            completed,
        } => {
            let packages: Vec<WorkPackage> =
                file_storage::read_json(&file).map_err(|e| anyhow!(e))?;
            let completed: HashSet<String> = completed.into_iter().collect();
            let plan = coordinator.plan(&packages, &completed, max_agents)?;
            print_json(&plan)
        }
        Command::Agents => print_json(&coordinator.registry().list_active_agents()),
        Command::Reap { timeout_secs } => {
            let removed = match timeout_secs {
                Some(secs) => coordinator
                    .registry()
                    .cleanup_stale_agents(Duration::from_secs(secs)),
                None => coordinator.reap_stale_agents(),
            };
            log::info!("Reaped {} stale agent(s)", removed.len());
            print_json(&removed)
        }
        Command::Locks => print_json(&coordinator.lock_manager("fleet-cli").list_locks()),
        Command::Unlock { resource, holder } => {
            if !coordinator.lock_manager(&holder).release(&resource) {
                return Err(anyhow!("{} does not hold a lock on {}", holder, resource));
            }
            println!("Released {}", resource);
            Ok(())
        }
        Command::Queued { agent, clear } => {
            let resolver = coordinator.conflict_resolver();
            print_json(&resolver.get_queued_operations(&agent))?;
            if clear {
                let cleared = resolver.clear_queued_operations(&agent);
                log::info!("Cleared {} queued operation(s) for {}", cleared, agent);
            }
            Ok(())
        }
        Command::Usage { agent } => {
            let report = coordinator
                .resource_monitor("fleet-cli")
                .read_usage_report(&agent)
                .ok_or_else(|| anyhow!("No usage report for {}", agent))?;
            print_json(&report)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
