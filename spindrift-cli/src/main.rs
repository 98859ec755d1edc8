//! Spindrift CLI - command-line entry point
//!
//! Boots tracing and runs the streaming gateway.

use clap::Parser;
use spindrift_core::config::SpindriftConfig;
use spindrift_core::logging::LogLevel;
use spindrift_core::init_tracing;

#[derive(Parser)]
#[command(name = "spindrift")]
#[command(about = "An on-demand magnet-to-HLS streaming gateway")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Console log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: LogLevel,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start the streaming gateway
    Serve {
        /// Listen port; overrides PORT from the environment
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let debug_capture = init_tracing(cli.log_level, None)?;

    match cli.command {
        Commands::Serve { port } => {
            let mut config = SpindriftConfig::from_env();
            if let Some(port) = port {
                config.http.port = port;
            }

            tracing::info!(
                "Starting gateway: port={}, temp_root={}, debug_log={}",
                config.http.port,
                config.paths.temp_root.display(),
                debug_capture.display()
            );
            spindrift_web::run_server(config).await?;
        }
    }

    Ok(())
}
