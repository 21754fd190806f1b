use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use image_compressor::compress::{estimate_dir, ImageScanner, ProgressChannel, ProgressConsumer, ReportEvent};
use image_compressor::error::RunError;
use image_compressor::utils::config::compressed_dir_for;
use image_compressor::utils::logging::init_tracing;
use image_compressor::utils::run_log::RunLog;
use image_compressor::{CompressorConfig, JobScheduler, OutputFormat};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "image-compressor", version)]
#[command(about = "Batch-compress a folder of images and optionally hand them to an uploader", long_about = None)]
struct Cli {
    /// Folder holding the images (overrides COMPRESSOR_SOURCE_DIR)
    #[arg(short, long, global = true)]
    source: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compress every image in the folder into <folder>/compressed
    Compress(CompressArgs),
    /// Estimate the size of the compressed output without writing anything
    Estimate {
        /// JPEG quality (0-90)
        #[arg(long)]
        quality: Option<u8>,
        /// PNG compression level (0-9)
        #[arg(long)]
        png_level: Option<u8>,
    },
    /// Count the images that would be compressed
    Count,
    /// Print the compressor.log of the folder
    Log,
}

#[derive(Args, Debug)]
struct CompressArgs {
    /// Output format: jpeg or png
    #[arg(short, long)]
    format: Option<OutputFormat>,

    /// JPEG quality (0-90)
    #[arg(short, long)]
    quality: Option<u8>,

    /// PNG compression level (0-9)
    #[arg(long)]
    png_level: Option<u8>,

    /// Upload the compressed folder when the run completes
    #[arg(long)]
    upload: bool,

    /// Server address handed to the uploader
    #[arg(long)]
    server: Option<String>,

    /// API key handed to the uploader
    #[arg(long)]
    api_key: Option<String>,

    /// Attempts per file
    #[arg(long)]
    max_retries: Option<u32>,

    /// Worker pool size (0 = one per core, at most 32)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = CompressorConfig::from_env().context("invalid COMPRESSOR_* environment")?;
    if let Some(source) = cli.source {
        config.source_dir = source;
    }
    if config.source_dir.as_os_str().is_empty() {
        bail!("no source folder given; pass --source or set COMPRESSOR_SOURCE_DIR");
    }

    match cli.command {
        Commands::Compress(args) => compress(config, args).await,
        Commands::Estimate { quality, png_level } => {
            if let Some(quality) = quality {
                config.jpeg_quality = quality;
            }
            if let Some(level) = png_level {
                config.png_compression = level;
            }
            let estimator = config.estimator()?;
            let estimate = estimate_dir(&ImageScanner::from_config(&config), &estimator).await?;
            println!("{}", estimate);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Count => {
            let count = ImageScanner::from_config(&config).count().await?;
            println!("{} IMAGE FILE FOUND.", count);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Log => {
            let dir = compressed_dir_for(&config.source_dir);
            match RunLog::read_log(&dir).with_context(|| format!("failed to read log in {}", dir.display()))? {
                Some(content) => print!("{}", content),
                None => println!("No log file found."),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn compress(mut config: CompressorConfig, args: CompressArgs) -> Result<ExitCode> {
    if let Some(format) = args.format {
        config.output_format = format;
    }
    if let Some(quality) = args.quality {
        config.jpeg_quality = quality;
    }
    if let Some(level) = args.png_level {
        config.png_compression = level;
    }
    if args.upload {
        config.upload = true;
    }
    if let Some(server) = args.server {
        config.server_address = server;
    }
    if let Some(key) = args.api_key {
        config.api_key = key;
    }
    if let Some(retries) = args.max_retries {
        config.max_retries = retries;
    }
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    config.validate()?;

    info!(
        "Compressing {} as {} with {} workers",
        config.source_dir.display(),
        config.output_format,
        config.worker_count()
    );

    let (tx, rx) = ProgressChannel::open();
    let consumer = ProgressConsumer::new(rx, print_event)
        .spawn()
        .context("failed to start progress consumer")?;

    let handle = JobScheduler::new(config, tx).spawn();
    let canceler = handle.canceler();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing dispatched files");
            canceler.cancel();
        }
    });

    let result = handle.join().await;
    if let Err(RunError::Join(e)) = &result {
        // The run never reported completion, so the consumer would wait forever.
        bail!("compression run aborted: {}", e);
    }

    match tokio::task::spawn_blocking(move || consumer.join()).await? {
        Ok(Ok(tally)) => info!("Reported {} outcomes", tally.outcomes()),
        Ok(Err(e)) => warn!("{}", e),
        Err(_) => warn!("progress consumer panicked"),
    }

    let summary = match result {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(ExitCode::FAILURE);
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(if summary.is_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_event(event: ReportEvent) {
    match event {
        ReportEvent::Message { text, success: true } => println!("{}", text),
        ReportEvent::Message { text, success: false } => eprintln!("{}", text),
        ReportEvent::Done(tally) => println!("Done: {} succeeded, {} failed", tally.succeeded, tally.failed),
        ReportEvent::NothingToDo(text) => println!("{}", text),
    }
}
