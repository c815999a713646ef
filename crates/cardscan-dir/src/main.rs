use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cardscan_core::prelude::*;
use cardscan_dir::{DirectoryStorage, ImageParser, VideoParser};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

const IMAGE_TYPES: [&str; 5] = ["image/jpeg", "image/png", "image/gif", "image/webp", "image/bmp"];
const VIDEO_TYPES: [&str; 6] = [
    "video/mp4",
    "video/3gpp",
    "video/webm",
    "video/ogg",
    "video/x-matroska",
    "video/quicktime",
];

#[derive(Parser, Debug)]
#[command(name = "cardscan")]
#[command(about = "cardscan - media index for a removable card", long_about = None)]
struct Args {
    /// Directory standing in for the card
    #[arg(short, long)]
    root: PathBuf,

    /// Scanner name, selects the index directory on the card
    #[arg(short, long, default_value = "gallery")]
    name: String,

    /// Reconcile with a full merge-join instead of an incremental scan
    #[arg(long)]
    full: bool,

    /// Simulated card capacity in bytes
    #[arg(long, default_value_t = 4 * 1024 * 1024 * 1024)]
    capacity: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the index up to date with the card
    Scan,
    /// Print indexed files, newest first
    List,
    /// Write the thumbnail of NAME to OUT
    Thumbnail { name: String, out: PathBuf },
    /// Copy FILE onto the card as media of KIND
    Import { kind: String, file: PathBuf },
}

fn print_event(event: ScannerEvent) {
    match serde_json::to_string(&event) {
        Ok(line) => println!("{line}"),
        Err(err) => error!("failed to encode event: {}", err),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mode = if args.full {
        ScanMode::Full
    } else {
        ScanMode::Incremental
    };
    let config = ScannerConfig::new(args.name.clone(), 1).with_scan_mode(mode);
    config.validate()?;

    let storage = Arc::new(DirectoryStorage::new(&args.root, args.capacity));
    let sources = vec![
        MediaSource::new(
            "pictures",
            KindConfig::default().with_mime_types(IMAGE_TYPES),
            storage.clone(),
            Arc::new(ImageParser),
        ),
        MediaSource::new(
            "videos",
            KindConfig::default().with_mime_types(VIDEO_TYPES),
            storage.clone(),
            Arc::new(VideoParser),
        ),
    ];

    let scanner = Scanner::open(config, sources).await?;
    info!("card at {:?} is {}", args.root, scanner.state());
    if scanner.state() != CardState::Ready {
        return Err(anyhow::anyhow!("card is not available: {}", scanner.state()));
    }

    match args.command {
        Command::Scan => {
            scanner.set_callback(print_event);
            scanner.scan().await?;
            info!("{} files indexed", scanner.len());
        }
        Command::List => {
            for record in scanner.files() {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Thumbnail { name, out } => {
            let Some(thumbnail) = scanner.thumbnail(&name).await else {
                return Err(anyhow::anyhow!("no thumbnail for {name}"));
            };
            tokio::fs::write(&out, &thumbnail).await?;
            info!("wrote {} bytes to {:?}", thumbnail.len(), out);
        }
        Command::Import { kind, file } => {
            let name = file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| anyhow::anyhow!("cannot import {:?}", file))?
                .to_owned();
            let data = tokio::fs::read(&file).await?;
            scanner.set_callback(print_event);
            scanner.add_file(kind.as_str(), &name, data).await?;

            let indexed = tokio::time::timeout(Duration::from_secs(10), async {
                while scanner.record(&name).is_none() {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await;
            if indexed.is_err() {
                warn!("{} was written but not indexed; is it a supported {}?", name, kind);
            }
            scanner.save().await?;
        }
    }

    Ok(())
}
