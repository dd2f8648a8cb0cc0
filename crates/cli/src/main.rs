mod commands;

use clap::Parser;
use mlconsole_config::Settings;
use mlconsole_services::Session;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commands::Command;

#[derive(Debug, Parser)]
#[command(name = "mlconsole", version, about = "Platform admin console: API calls and background task tracking")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (silently ignore if missing)
    dotenvy::dotenv().ok();

    // Logs go to stderr so command output on stdout stays machine-readable
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "mlconsole=info,mlconsole_services=debug,mlconsole_client=debug".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let settings = Settings::load()?;
    info!(base_url = %settings.api.base_url, "Starting mlconsole");

    let session = Session::from_settings(&settings).await?;

    let result = commands::run_until(&session, cli.command, tokio::signal::ctrl_c()).await;

    session.logout().await;
    result
}
