use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use library::{config_path_from_env, load_or_create_config, FsMediaIndex, Library};
use tracing::info;
use tracing_subscriber::EnvFilter;

const ENRICH_BATCH: usize = 200;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(config_path_from_env);

    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    }
    let config = config.resolved(&config_path);

    let index = Arc::new(FsMediaIndex::new(
        vec![PathBuf::from(&music_root)],
        &config.audio_extensions,
    ));
    let library = Library::open(config, index)?;

    let mut progress = library.subscribe_progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            if let Some(update) = progress.borrow_and_update().clone() {
                info!("{} ({}/{})", update.message, update.current, update.total);
            }
        }
    });

    let interrupt = library.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel_import();
        }
    });

    let outcome = library.initialize().await?;
    if outcome.instant_songs > 0 {
        info!("Loaded {} songs from cache", outcome.instant_songs);
    }
    let summary = outcome.import.await??;
    if summary.cancelled {
        info!("Import cancelled after {} songs", summary.songs);
    }

    loop {
        if library.enrich_pending(ENRICH_BATCH).await? == 0 {
            break;
        }
    }
    library.refresh_derived().await?;

    let status = library.sync_status().await?;
    println!(
        "Indexed: {} songs ({} processed of {})",
        library.songs().len(),
        status.processed,
        status.total
    );

    Ok(())
}
