use clap::{Parser, Subcommand};

use meetscribe::config::Settings;
use meetscribe::engine::{AppContext, Engine};
use meetscribe::readiness::{self, Severity};

#[derive(Parser, Debug)]
#[command(name = "meetscribe", version, about = "Meeting analytics backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Validate configuration and print the readiness report.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let report = readiness::evaluate(&settings);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Check => {
            if report.issues.is_empty() {
                println!("readiness: ok");
                return Ok(());
            }
            for issue in &report.issues {
                println!("[{:?}] {}: {}", issue.severity, issue.code, issue.message);
            }
            if report.has_errors() {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Serve => {
            for issue in &report.issues {
                match issue.severity {
                    Severity::Error => {
                        tracing::error!(code = issue.code, "readiness: {}", issue.message)
                    }
                    Severity::Warning => {
                        tracing::warn!(code = issue.code, "readiness: {}", issue.message)
                    }
                }
            }
            if settings.env.is_production() && settings.fail_fast && report.has_errors() {
                tracing::error!("readiness gate failed in production; refusing to start");
                std::process::exit(1);
            }

            let ctx = AppContext::build(settings).await?;
            let engine = Engine::start(ctx).await?;
            engine.run_until_shutdown().await
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,meetscribe=debug"));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
