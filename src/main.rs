use clap::Parser;
use membox::config::MemoryConfig;
use membox::manager::Manager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "membox", about = "Memory server for a conversational toy assistant")]
struct Args {
    /// Path to a JSON config file. Overrides --preset.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Named preset: minimal, balanced or full_featured.
    #[arg(long, default_value = "balanced")]
    preset: String,

    /// Listen address.
    #[arg(long, default_value = "127.0.0.1:7680")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "membox=info,warp=warn".into()),
        )
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    let manager = match Manager::from_config(config).await {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    membox::server::serve(manager, args.listen).await;
    ExitCode::SUCCESS
}

fn load_config(args: &Args) -> membox::Result<MemoryConfig> {
    match &args.config {
        Some(path) => MemoryConfig::load(path),
        None => {
            let config = MemoryConfig::preset(&args.preset)?;
            config.validate()?;
            Ok(config)
        }
    }
}
