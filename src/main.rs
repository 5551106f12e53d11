use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sluice::{Broker, Config, ConsumerOptions, Context, HandlerError, Registry, Store};

const SCAN_DIR: &str = "scan-dir";
const ALBUM_FOUND: &str = "album-found";

#[derive(Debug, Serialize, Deserialize)]
struct Directory {
    path: PathBuf,
    #[serde(default)]
    images: u64,
    #[serde(default)]
    size: u64,
}

fn is_jpeg(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// Publishes a scan for every subdirectory, and an album for this directory if it holds JPEGs.
async fn scan_dir(ctx: Context, dir: Directory) -> Result<(), HandlerError> {
    let mut entries = tokio::fs::read_dir(&dir.path).await?;

    let mut images = 0;
    let mut size = 0;

    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let path = entry.path();

        if file_type.is_dir() {
            ctx.broker()
                .publish(
                    SCAN_DIR,
                    &Directory {
                        path,
                        images: 0,
                        size: 0,
                    },
                )
                .await?;
        } else if is_jpeg(&path) {
            images += 1;
            size += entry.metadata().await?.len();
        }
    }

    if images > 0 {
        ctx.broker()
            .publish(
                ALBUM_FOUND,
                &Directory {
                    path: dir.path,
                    images,
                    size,
                },
            )
            .await?;
    }

    Ok(())
}

async fn album_found(_: Context, dir: Directory) -> Result<(), HandlerError> {
    tracing::info!(
        path = %dir.path.display(),
        images = dir.images,
        size = dir.size,
        "album found"
    );

    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    sluice::init_tracing()?;

    let config = Config::load()?;
    let store = Store::connect_with(&config).await?;

    let registry = Registry::new()
        .with_consumer(
            SCAN_DIR,
            scan_dir,
            ConsumerOptions::builder().concurrency(4).build(),
        )?
        .with_consumer(ALBUM_FOUND, album_found, ConsumerOptions::default())?;

    let broker = Broker::builder()
        .store(store)
        .registry(registry)
        .poll_interval(config.poll_interval())
        .start();

    for path in std::env::args_os().skip(1) {
        let id = broker
            .publish(
                SCAN_DIR,
                &Directory {
                    path: path.into(),
                    images: 0,
                    size: 0,
                },
            )
            .await?;

        tracing::info!(id, "scan queued");
    }

    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    broker.shutdown().await;

    Ok(())
}
