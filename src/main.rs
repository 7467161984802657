use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mailroom::engine::Engine;
use mailroom::error::MailroomError;
use mailroom::Settings;

#[derive(Parser)]
#[command(
    name = "mailroom",
    version,
    about = "Coordination server for fleets of autonomous coding agents"
)]
struct Cli {
    /// Verbose logging (mailroom=debug).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the MCP streamable-HTTP endpoint.
    ServeHttp {
        /// Override HTTP_HOST.
        #[arg(long)]
        host: Option<String>,
        /// Override HTTP_PORT.
        #[arg(long)]
        port: Option<u16>,
        /// Override HTTP_PATH.
        #[arg(long)]
        path: Option<String>,
    },
    /// Reconstruct the SQLite index from the git archives.
    RebuildIndex,
    /// Sweep expired file reservations across all projects.
    GcExpiredClaims,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err @ MailroomError::Config(_)) => {
            eprintln!("configuration error: {err}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "mailroom=debug"
    } else {
        "mailroom=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> mailroom::Result<()> {
    let mut settings = Settings::from_env()?;

    match cli.command {
        Commands::ServeHttp { host, port, path } => {
            if let Some(host) = host {
                settings.http.host = host;
            }
            if let Some(port) = port {
                settings.http.port = port;
            }
            if let Some(path) = path {
                settings.http.path = path;
            }
            settings.validate()?;

            let engine = Arc::new(Engine::new(settings)?);
            let report = engine.startup_reconcile()?;
            if report.messages > 0 {
                tracing::info!(recovered = report.messages, "recovered orphaned archive state");
            }
            mailroom::server::serve(engine).await
        }
        Commands::RebuildIndex => {
            let engine = Engine::new(settings)?;
            let report = engine.rebuild_index()?;
            println!(
                "rebuilt index: {} project(s), {} agent(s), {} message(s), {} claim(s)",
                report.projects, report.agents, report.messages, report.claims
            );
            Ok(())
        }
        Commands::GcExpiredClaims => {
            let engine = Engine::new(settings)?;
            let swept = engine.gc_expired_claims().await?;
            println!("swept {swept} expired claim(s)");
            Ok(())
        }
    }
}
