use chat_relay::{app, config::Config, dashboard::ViewFilter};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "chat-relay", version, about = "Real-time session relay and dashboard sync")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the broadcast hub and the session HTTP API.
    Serve {
        /// Keep sessions in process memory instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Follow a running relay and log the reconciled session list.
    Watch {
        /// Only show sessions whose name or id contains this text.
        #[arg(long, default_value = "")]
        search: String,
        /// First day (YYYY-MM-DD) a shown session must have a message on or after.
        #[arg(long)]
        from: Option<String>,
        /// Last day (YYYY-MM-DD) a shown session must have a message on or before.
        #[arg(long)]
        to: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "chat-relay starting");

    match cli.command {
        Command::Serve { memory } => app::run(&config, memory).await,
        Command::Watch { search, from, to } => {
            let filter = ViewFilter {
                search,
                start_day: from,
                end_day: to,
            };
            app::watch_sessions(&config, filter).await
        }
    }
}
