//! FieldSync CLI
//!
//! Runs and administers a FieldSync sync server.
//!
//! # Commands
//!
//! - `serve` - Serve `/sync/pull` and `/sync/push` until interrupted
//! - `migrate` - Apply pending schema migrations
//! - `issue-token` - Sign a session token for a user in a tenant
//! - `grant` / `revoke` - Manage tenant memberships
//! - `inspect` - Show per-tenant row counts

mod commands;

use clap::{Parser, Subcommand};
use fieldsync_server::ServerConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the token signing secret.
const SECRET_ENV: &str = "FIELDSYNC_SECRET";

/// FieldSync server tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// SQLite connection URL of the system of record
    #[arg(global = true, short, long, default_value = "sqlite://fieldsync.db")]
    database: String,

    /// Token signing secret (defaults to $FIELDSYNC_SECRET)
    #[arg(global = true, long)]
    secret: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the sync endpoints
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Hard cap on records per kind per pull page
        #[arg(long, default_value = "500")]
        max_pull_limit: u32,

        /// Hard cap on entries in one push
        #[arg(long, default_value = "1000")]
        max_push_records: usize,
    },

    /// Apply pending schema migrations
    Migrate,

    /// Sign a session token
    IssueToken {
        /// User ID
        #[arg(short, long)]
        user: String,

        /// Tenant the session is active in
        #[arg(short, long)]
        location: String,

        /// Token lifetime in hours
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// Grant a user access to a tenant
    Grant {
        /// User ID
        #[arg(short, long)]
        user: String,

        /// Tenant ID
        #[arg(short, long)]
        location: String,

        /// Role within the tenant
        #[arg(short, long, default_value = "technician")]
        role: String,
    },

    /// Revoke a user's access to a tenant
    Revoke {
        /// User ID
        #[arg(short, long)]
        user: String,

        /// Tenant ID
        #[arg(short, long)]
        location: String,
    },

    /// Show per-tenant row counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

impl Cli {
    fn config(&self, bind_addr: SocketAddr) -> ServerConfig {
        let mut config = ServerConfig::new(bind_addr, self.database.as_str());
        let secret = self
            .secret
            .clone()
            .or_else(|| std::env::var(SECRET_ENV).ok());
        if let Some(secret) = secret {
            config = config.with_auth(secret.into_bytes());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let unbound = SocketAddr::from(([127, 0, 0, 1], 0));
    match &cli.command {
        Commands::Serve {
            bind,
            max_pull_limit,
            max_push_records,
        } => {
            let config = cli
                .config(*bind)
                .with_max_pull_limit(*max_pull_limit)
                .with_max_push_records(*max_push_records);
            commands::serve::run(config).await?;
        }
        Commands::Migrate => {
            commands::migrate::run(&cli.config(unbound)).await?;
        }
        Commands::IssueToken {
            user,
            location,
            hours,
        } => {
            let config = cli
                .config(unbound)
                .with_token_expiry(Duration::from_secs(hours.saturating_mul(3600)));
            commands::token::run(config, user, location).await?;
        }
        Commands::Grant {
            user,
            location,
            role,
        } => {
            commands::membership::grant(&cli.config(unbound), user, location, role).await?;
        }
        Commands::Revoke { user, location } => {
            commands::membership::revoke(&cli.config(unbound), user, location).await?;
        }
        Commands::Inspect { format } => {
            commands::inspect::run(&cli.config(unbound), format).await?;
        }
        Commands::Version => {
            println!("FieldSync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
