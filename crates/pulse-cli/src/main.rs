mod cmd_cache;
mod cmd_route;
mod cmd_serve;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pulse", version, about = "Behavioral analytics collector and heatmap server")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP ingest and heatmap server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Inspect the snapshot cache
    Cache {
        #[command(subcommand)]
        cmd: CacheCommand,
    },
    /// Print the normalized form of a route path
    Route {
        /// Raw route, e.g. "/user/42/profile?tab=1"
        path: String,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// List cached snapshot entries
    Ls {
        /// Only entries under this snapshot hash
        #[arg(long)]
        snapshot: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Serve { bind, port } => cmd_serve::execute(&bind, port),
        Command::Cache { cmd } => match cmd {
            CacheCommand::Ls { snapshot } => cmd_cache::ls(snapshot.as_deref()),
        },
        Command::Route { path } => cmd_route::execute(&path),
    }
}
