use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcp_control::server;
use mcp_control::server::settings::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about = "MCP instance control plane and gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the control plane: reconciler, gateway and API listener
    Server,
    /// Check the configuration for errors and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server => {
            let settings = Settings::new()?;
            server::run_server(settings).await
        }
        Commands::CheckConfig => match Settings::new() {
            Ok(_) => {
                println!("Configuration is valid");
                Ok(())
            }
            Err(err) => {
                eprintln!("Configuration error: {}", err);
                std::process::exit(1);
            }
        },
    }
}
