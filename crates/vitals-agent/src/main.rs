mod cmd;

use std::fmt;
use std::path::Path;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use vitals_agent::AgentResult;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let hours = total_secs / 3600;
        let mins = (total_secs / 60) % 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{hours:02}:{mins:02}:{secs:02}.{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "vitals-agent", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingest, upload and ping loops until SIGINT/SIGTERM
    Run(cmd::RunArgs),
    /// Validate the configuration and print the effective values
    CheckConfig(cmd::ConfigArgs),
    /// Show the health and backlog last reported by the running agent
    Status(cmd::ConfigArgs),
    /// Append a manual reading to the inbox
    Record(cmd::RecordArgs),
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing with a tee writer (stderr + rolling log file).
///
/// Returns the [`tracing_appender::non_blocking::WorkerGuard`] that must be
/// held alive until the process exits so buffered logs are flushed.
fn init_tracing_with_file(
    log_dir: &Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir).map_err(|e| format!("create {}: {e}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("vitals-agent")
        .filename_suffix("log")
        .max_log_files(7)
        .build(log_dir)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let writer = std::io::stderr.and(non_blocking);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(Elapsed(Instant::now()))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(command: Command) -> AgentResult<ExitCode> {
    match command {
        Command::Run(args) => {
            let config = args.config.load()?;
            let _guard = match init_tracing_with_file(&config.paths().logs_dir()) {
                Ok(guard) => Some(guard),
                Err(e) => {
                    init_tracing_stderr();
                    tracing::warn!("file logging unavailable, using stderr only: {e}");
                    None
                }
            };
            cmd::run_agent(config).await.map(|()| ExitCode::SUCCESS)
        }
        Command::CheckConfig(args) => {
            init_tracing_stderr();
            let config = args.load()?;
            cmd::run_check_config(&config).map(|()| ExitCode::SUCCESS)
        }
        Command::Status(args) => {
            init_tracing_stderr();
            let config = args.load()?;
            cmd::run_status(&config)
        }
        Command::Record(args) => {
            init_tracing_stderr();
            let config = args.config.load()?;
            cmd::run_record(&config, &args).map(|()| ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
