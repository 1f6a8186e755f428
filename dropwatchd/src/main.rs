use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use dropwatch_config::ConfigSource;
use dropwatch_core::{
    DropwatchConfig, ExtractionStatus, ExtractorRegistry, FirmwareRegistry, ImportService,
    NoFirmware, StaticFirmwareList,
};
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "dropwatchd")]
#[command(about = "Watch an import directory, extract dropped archives and publish the payload")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as TOML and exit
    PrintConfig,
}

#[derive(ClapArgs, Debug, Clone)]
struct RunArgs {
    /// Config file (TOML or JSON). Overrides DROPWATCH_CONFIG_PATH lookup
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to watch (overrides config)
    #[arg(short, long, env = "DROPWATCH_DIR")]
    dir: Option<PathBuf>,

    /// Also import from sub-directories (overrides config)
    #[arg(short, long)]
    recursive: bool,

    /// Firmware file names to claim instead of importing (repeatable)
    #[arg(long = "firmware", value_name = "FILE_NAME")]
    firmware: Vec<String>,
}

fn load_config(args: &RunArgs) -> anyhow::Result<(DropwatchConfig, ConfigSource)> {
    let (mut config, source) = match &args.config {
        Some(path) => (
            dropwatch_config::load_from_file(path)?,
            ConfigSource::File(path.clone()),
        ),
        None => dropwatch_config::load_from_env()?,
    };

    if let Some(dir) = &args.dir {
        config.watch.directory = dir.clone();
    }
    if args.recursive {
        config.watch.recursive = true;
    }
    Ok((config, source))
}

fn log_status(status: &ExtractionStatus) {
    match status {
        ExtractionStatus::Idle => info!("all extractions finished"),
        ExtractionStatus::Started { source, kind, .. } => {
            info!(source = %source.display(), %kind, "extracting")
        }
        ExtractionStatus::ItemExtracted { path, progress, .. } => {
            info!(path = %path.display(), progress = f64::from(*progress), "extracted")
        }
        ExtractionStatus::Completed { source, paths, .. } => {
            info!(source = %source.display(), files = paths.len(), "archive imported")
        }
        ExtractionStatus::Failed {
            source,
            kind,
            message,
            ..
        } => warn!(source = %source.display(), ?kind, %message, "import failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dropwatch_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, source) = load_config(&cli.run).context("failed to load configuration")?;

    if let Some(Command::PrintConfig) = cli.command {
        println!("{}", dropwatch_config::render_toml(&config)?);
        return Ok(());
    }

    match &source {
        ConfigSource::Default => info!("no config file found, using defaults"),
        ConfigSource::EnvInline => info!("config loaded from inline environment json"),
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "config loaded from file")
        }
    }
    info!(
        watch.directory = %config.watch.directory.display(),
        watch.recursive = config.watch.recursive,
        stability.poll_interval_ms = config.stability.poll_interval_ms,
        stability.max_checks = config.stability.max_checks,
        "configuration in effect"
    );

    let firmware: Arc<dyn FirmwareRegistry> = if cli.run.firmware.is_empty() {
        Arc::new(NoFirmware)
    } else {
        Arc::new(StaticFirmwareList::new(&cli.run.firmware))
    };

    let service = ImportService::start_with(config, ExtractorRegistry::default(), firmware)
        .context("failed to start import service")?;

    let mut statuses = service.status_updates();
    let mut batches = service.completed_batches();
    let mut firmware_files = service.firmware_files();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                if let Err(err) = signal {
                    error!(error = %err, "failed to listen for ctrl-c");
                }
                break;
            }
            Some(status) = statuses.next() => log_status(&status),
            Some(batch) = batches.next() => {
                info!(
                    source = %batch.source.display(),
                    files = ?batch.paths,
                    "batch ready for import"
                );
            }
            Some(found) = firmware_files.next() => {
                info!(path = %found.path.display(), "firmware file available");
            }
        }
    }

    info!("shutting down");
    service.stop().await;
    Ok(())
}
