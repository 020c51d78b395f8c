//! meshboot: bootstrap a freshly started multi-cluster service mesh.
//!
//! # Usage
//!
//! ```text
//! meshboot boot --topology topology.toml --config meshboot.toml --cache meshboot.redb
//! meshboot cache list --cache meshboot.redb
//! meshboot cache forget gossip-key --cache meshboot.redb
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "meshboot",
    about = "Bootstrap ACLs, credentials, linking and config entries of a service mesh",
    version,
    propagate_version = true
)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bootstrap against a running topology.
    Boot {
        /// Topology inventory (TOML).
        #[arg(long)]
        topology: PathBuf,
        /// Bootstrap configuration (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Durable credential cache.
        #[arg(long, default_value = "meshboot.redb")]
        cache: PathBuf,
        /// Stop after the primary cluster.
        #[arg(long)]
        primary_only: bool,
        /// Per-request timeout against the control plane, in seconds.
        #[arg(long, default_value = "10")]
        request_timeout: u64,
    },
    /// Inspect or prune the credential cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached secret names (values are never printed).
    List {
        #[arg(long, default_value = "meshboot.redb")]
        cache: PathBuf,
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Forget a cached secret so the next run derives it again.
    Forget {
        name: String,
        #[arg(long, default_value = "meshboot.redb")]
        cache: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Boot {
            topology,
            config,
            cache,
            primary_only,
            request_timeout,
        } => {
            commands::boot::run(
                &topology,
                config.as_deref(),
                &cache,
                primary_only,
                request_timeout,
            )
            .await
        }
        Commands::Cache { action } => match action {
            CacheAction::List { cache, format } => commands::cache::list(&cache, &format),
            CacheAction::Forget { name, cache } => commands::cache::forget(&cache, &name),
        },
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,meshboot=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
