use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ospm")]
#[command(about = "OpenSource Programs Mentor service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API and run the reminder scheduler.
    Serve,
    /// Run one reminder cycle and exit.
    Remind,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "starting ospm");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => ospm_web::serve_from_env().await?,
        Commands::Remind => {
            let summary = ospm_notify::run_reminder_once_from_env().await?;
            println!(
                "reminders complete: run_id={} urgent={} subscribers={} notified={} programs={}",
                summary.run_id,
                summary.urgent_programs,
                summary.subscribers,
                summary.notified_subscribers,
                summary.dispatched_programs
            );
        }
    }

    Ok(())
}
