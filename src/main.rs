use blob_ingest::infrastructure::{scanner, storage};
use blob_ingest::services::digester;
use blob_ingest::{IngestConfig, IngestionPipeline, MediaTypeClassifier, UploadSource};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store files in the blob store, printing one JSON descriptor per file
    Ingest {
        /// Files to ingest; `-` reads standard input
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Name hint for MIME classification, used when the input has no file name
        #[arg(short, long)]
        name: Option<String>,

        /// Scan content before storing it
        #[arg(short, long)]
        scan: bool,
    },
    /// Print the checksum of a file
    Digest { path: PathBuf },
    /// Print the detected MIME type of a file
    Classify {
        path: PathBuf,

        /// Fallback name hint when the path has no file name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Check that the configured scanner is reachable
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blob_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = IngestConfig::from_env()?;
    info!(
        "🛡️  Ingest Config: Root={}, Digest={}, Virus Scan={}, Scanner={}",
        config.storage_root.display(),
        config.digest_algorithm,
        config.enable_virus_scan,
        config.virus_scanner_type
    );

    match args.command {
        Command::Ingest { paths, name, scan } => {
            let store = storage::setup_storage(&config).await?;
            let scanner = scanner::setup_scanner(&config).await?;
            let classifier = Arc::new(MediaTypeClassifier::from_config(&config).await?);
            let pipeline = IngestionPipeline::new(
                store,
                classifier,
                scanner,
                config.digest_algorithm,
                config.chunk_size,
            );

            let mut failures = 0;
            for path in paths {
                let source = if path.as_os_str() == "-" {
                    UploadSource::stream(tokio::io::stdin())
                } else {
                    UploadSource::path(&path)
                };
                match pipeline.ingest(source, name.as_deref(), scan).await {
                    Ok(descriptor) => println!("{}", serde_json::to_string(&descriptor)?),
                    Err(e) => {
                        error!("❌ {}: {}", path.display(), e);
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{} upload(s) failed", failures);
            }
        }
        Command::Digest { path } => {
            let file = tokio::fs::File::open(&path).await?;
            let digest =
                digester::digest(file, config.digest_algorithm, config.chunk_size).await?;
            println!("{}  {}", digest.checksum, path.display());
        }
        Command::Classify { path, name } => {
            let classifier = MediaTypeClassifier::from_config(&config).await?;
            let hint = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .or(name);
            let file = tokio::fs::File::open(&path).await?;
            println!("{}", classifier.classify(hint.as_deref(), file).await?);
        }
        Command::Health => {
            let scanner = blob_ingest::services::scanner::create_scanner(&config)?;
            if scanner.health_check().await {
                info!("✅ Scanner is reachable");
            } else {
                anyhow::bail!("scanner '{}' is unreachable", config.virus_scanner_type);
            }
        }
    }

    Ok(())
}
