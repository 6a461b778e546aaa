//! SyncDB CLI
//!
//! Runs the SyncDB server and talks to a running one.
//!
//! # Commands
//!
//! - `serve` - Run the server in the foreground
//! - `status` - Show registered clients
//! - `table-status` - Show a table's geometry and counts
//! - `debug` - Print the server's state dump
//! - `nsf` - Change the NSF replication role

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use syncdb_protocol::NsfRole;
use tracing_subscriber::EnvFilter;

/// SyncDB server and administration tools.
#[derive(Parser)]
#[command(name = "syncdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server run directory holding the command socket
    #[arg(global = true, short, long, default_value = "/run/syncdb")]
    run_dir: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Serve {
        /// Directory holding the store and nvram snapshot directories
        #[arg(long, default_value = "/var/lib/syncdb")]
        data_dir: PathBuf,

        /// Directory for NVRAM table snapshots
        #[arg(long)]
        nvram_dir: Option<PathBuf>,

        /// Compressed archive of the snapshot directory
        #[arg(long)]
        archive: Option<PathBuf>,

        /// Socket of the SyncDB agent
        #[arg(long)]
        agent_peer: Option<PathBuf>,

        /// Number of client slots
        #[arg(long)]
        max_clients: Option<usize>,

        /// Timer period in milliseconds
        #[arg(long, default_value = "1000")]
        tick_ms: u64,
    },

    /// Show registered clients
    Status {
        /// Only show this client id
        #[arg(short, long)]
        client: Option<u16>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show a table's geometry and counts
    TableStatus {
        /// Table name
        table: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the server's state dump
    Debug,

    /// Change the NSF replication role
    Nsf {
        /// New role
        #[arg(value_enum)]
        role: Role,
    },

    /// Show version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum Role {
    Disabled,
    Manager,
    Backup,
}

impl From<Role> for NsfRole {
    fn from(role: Role) -> Self {
        match role {
            Role::Disabled => NsfRole::Disabled,
            Role::Manager => NsfRole::Manager,
            Role::Backup => NsfRole::Backup,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            data_dir,
            nvram_dir,
            archive,
            agent_peer,
            max_clients,
            tick_ms,
        } => {
            let options = commands::serve::ServeOptions {
                run_dir: cli.run_dir,
                data_dir,
                nvram_dir,
                archive,
                agent_peer,
                max_clients,
                tick_ms,
            };
            commands::serve::run(options)?;
        }
        Commands::Status { client, format } => {
            commands::status::run(&cli.run_dir, client, &format)?;
        }
        Commands::TableStatus { table, format } => {
            commands::table_status::run(&cli.run_dir, &table, &format)?;
        }
        Commands::Debug => {
            commands::debug::run(&cli.run_dir)?;
        }
        Commands::Nsf { role } => {
            commands::nsf::run(&cli.run_dir, role.into())?;
        }
        Commands::Version => {
            println!("SyncDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("SyncDB Core v{}", syncdb_core::VERSION);
        }
    }

    Ok(())
}
