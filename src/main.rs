use clap::{Parser, Subcommand};
use procfeed::cli::ingest::IngestOptions;
use procfeed::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "procfeed")]
#[command(about = "Streams job data to native analytics processes", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload data files (or stdin) to a job
    Ingest {
        job: String,
        files: Vec<PathBuf>,
        /// Flush the job after the upload and wait for the acknowledgement
        #[arg(long)]
        flush: bool,
        /// Ask for interim results before flushing
        #[arg(long)]
        calc_interim: bool,
        /// Reset buckets from this epoch second before the upload
        #[arg(long)]
        reset_start: Option<i64>,
        #[arg(long, requires = "reset_start")]
        reset_end: Option<i64>,
    },
    /// Print a job's launch command without starting it
    Args {
        job: String,
        /// Keep the generated config files
        #[arg(long)]
        keep_files: bool,
    },
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "procfeed=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Commands::Ingest {
            job,
            files,
            flush,
            calc_interim,
            reset_start,
            reset_end,
        } => {
            let config = procfeed::cli::load(config_path.as_deref())?;
            let options = IngestOptions {
                job_id: job,
                files,
                flush,
                calc_interim,
                reset_start,
                reset_end,
            };
            procfeed::cli::ingest::ingest(config, options).await?;
        }
        Commands::Args { job, keep_files } => {
            let config = procfeed::cli::load(config_path.as_deref())?;
            procfeed::cli::args::print_args(&config, &job, keep_files, &mut std::io::stdout())?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Init { stdout } => {
                procfeed::cli::config::init(stdout)?;
            }
        },
    }

    Ok(())
}
