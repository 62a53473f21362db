use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{classify_folder, parse_filename, PlayStats, ScanStatus, Song, TrackRecord};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LibraryConfig;
use crate::device::{DeviceAsset, DeviceError, MediaIndex, PageRequest};
use crate::settings::{SettingsStore, PLAY_STATS_KEY};
use crate::store::{StoreError, TrackStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImportPhase {
    Idle,
    Scanning,
    LoadingCache,
    Complete,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub phase: ImportPhase,
    pub current: usize,
    pub total: usize,
    pub message: String,
    pub songs_loaded: usize,
}

impl ImportProgress {
    fn new(phase: ImportPhase, current: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            phase,
            current,
            total,
            message: message.into(),
            songs_loaded: current,
        }
    }
}

#[derive(Debug)]
pub enum ImportEvent {
    Progress(ImportProgress),
    SongsUpdated(Vec<Song>),
    Complete {
        songs: Vec<Song>,
        persistence: PersistTicket,
    },
    Error(ImportError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Folder labels to keep. Empty means every asset.
    pub folders: Vec<String>,
}

pub type ImportEvents = UnboundedReceiverStream<ImportEvent>;

/// Store writes scheduled by one import. Await it before treating the
/// imported batch as durable.
#[derive(Debug, Default)]
pub struct PersistTicket {
    handles: Vec<JoinHandle<Result<usize, StoreError>>>,
}

impl PersistTicket {
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every scheduled write. Returns the rows written, or the
    /// first failure once all writes have finished.
    pub async fn wait(self) -> Result<usize, StoreError> {
        let mut written = 0usize;
        let mut first_error = None;
        for handle in self.handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(err) => Err(StoreError::from(err)),
            };
            match outcome {
                Ok(count) => written += count,
                Err(err) => {
                    warn!("Import batch was not persisted: {}", err);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
}

/// Turns device assets into songs, reusing whatever the store already knows
/// about each one. One import at a time; a second `start` is refused.
#[derive(Clone)]
pub struct ImportOrchestrator {
    index: Arc<dyn MediaIndex>,
    store: TrackStore,
    settings: SettingsStore,
    page_size: usize,
    max_pages: usize,
    yield_every: usize,
    in_progress: Arc<AtomicBool>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

struct RunGuard {
    in_progress: Arc<AtomicBool>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.cancel.lock().take();
        self.in_progress.store(false, Ordering::SeqCst);
    }
}

impl ImportOrchestrator {
    pub fn new(
        index: Arc<dyn MediaIndex>,
        store: TrackStore,
        settings: SettingsStore,
        config: &LibraryConfig,
    ) -> Self {
        Self {
            index,
            store,
            settings,
            page_size: config.page_size.max(1),
            max_pages: config.max_pages.max(1),
            yield_every: config.yield_every.max(1),
            in_progress: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Requests cancellation of the running import. Returns false when
    /// nothing is running.
    pub fn cancel(&self) -> bool {
        match self.cancel.lock().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Starts an import in the background and returns its event stream.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, options: ImportOptions) -> ImportEvents {
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Import requested while another is running");
            let _ = tx.send(ImportEvent::Error(ImportError::AlreadyInProgress));
            return UnboundedReceiverStream::new(rx);
        }

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        let guard = RunGuard {
            in_progress: Arc::clone(&self.in_progress),
            cancel: Arc::clone(&self.cancel),
        };
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run(options, token, &tx).await;
            drop(guard);
            drop(tx);
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn run(
        &self,
        options: ImportOptions,
        token: CancellationToken,
        tx: &UnboundedSender<ImportEvent>,
    ) {
        let emit = |event: ImportEvent| {
            let _ = tx.send(event);
        };

        info!("Import started");
        emit(ImportEvent::Progress(ImportProgress::new(
            ImportPhase::Scanning,
            0,
            0,
            "Scanning device media",
        )));

        let assets = match self.enumerate(&token).await {
            Ok(assets) => assets,
            Err(err) => {
                warn!("Media enumeration failed: {}", err);
                emit(ImportEvent::Error(ImportError::Enumeration(err.to_string())));
                return;
            }
        };
        if token.is_cancelled() {
            info!("Import cancelled after enumeration");
            emit(ImportEvent::Progress(ImportProgress::new(
                ImportPhase::Cancelled,
                0,
                assets.len(),
                "Import cancelled",
            )));
            return;
        }

        let scope: HashSet<&str> = options.folders.iter().map(String::as_str).collect();
        let assets: Vec<(DeviceAsset, Option<String>)> = assets
            .into_iter()
            .map(|asset| {
                let folder = classify_folder(&asset.uri);
                (asset, folder)
            })
            .filter(|(_, folder)| in_scope(&scope, folder.as_deref()))
            .collect();
        let total = assets.len();

        emit(ImportEvent::Progress(ImportProgress::new(
            ImportPhase::LoadingCache,
            0,
            total,
            format!("Found {} songs", total),
        )));

        let cached: HashMap<String, TrackRecord> = match self.store.get_all().await {
            Ok(records) => records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            Err(err) => {
                warn!("Track cache unavailable, starting fresh: {}", err);
                HashMap::new()
            }
        };
        let stats: HashMap<String, PlayStats> = self.settings.load_map(PLAY_STATS_KEY).await;

        let mut songs: Vec<Song> = Vec::with_capacity(total);
        let mut ticket = PersistTicket::default();

        for chunk in assets.chunks(self.yield_every) {
            if token.is_cancelled() {
                if let Err(err) = ticket.wait().await {
                    warn!("Partial import not fully persisted: {}", err);
                }
                info!("Import cancelled after {} of {} songs", songs.len(), total);
                emit(ImportEvent::Progress(ImportProgress::new(
                    ImportPhase::Cancelled,
                    songs.len(),
                    total,
                    "Import cancelled",
                )));
                return;
            }

            let mut records = Vec::with_capacity(chunk.len());
            let mut batch = Vec::with_capacity(chunk.len());
            for (asset, folder) in chunk {
                let record = build_record(asset, folder.clone(), cached.get(&asset.id));
                let mut song = Song::from_record(record.clone());
                if let Some(entry) = stats.get(&song.id) {
                    entry.apply_to(&mut song);
                }
                records.push(record);
                batch.push(song);
            }

            let store = self.store.clone();
            ticket
                .handles
                .push(tokio::spawn(async move { store.upsert_many(records).await }));

            songs.extend(batch.iter().cloned());
            emit(ImportEvent::SongsUpdated(batch));
            emit(ImportEvent::Progress(ImportProgress::new(
                ImportPhase::LoadingCache,
                songs.len(),
                total,
                format!("Loaded {} of {} songs", songs.len(), total),
            )));
            debug!("Import batch done: {}/{}", songs.len(), total);

            tokio::task::yield_now().await;
        }

        info!("Import complete: {} songs", songs.len());
        emit(ImportEvent::Progress(ImportProgress::new(
            ImportPhase::Complete,
            songs.len(),
            total,
            format!("Loaded {} songs", songs.len()),
        )));
        emit(ImportEvent::Complete {
            songs,
            persistence: ticket,
        });
    }

    /// Pages through the index until it runs dry or the page cap is hit.
    /// Duplicate ids across pages keep their first occurrence.
    async fn enumerate(&self, token: &CancellationToken) -> Result<Vec<DeviceAsset>, DeviceError> {
        let mut assets = Vec::new();
        let mut seen = HashSet::new();
        let mut offset = 0usize;
        for page_no in 0..self.max_pages {
            if token.is_cancelled() {
                break;
            }
            let index = Arc::clone(&self.index);
            let request = PageRequest {
                offset,
                limit: self.page_size,
            };
            let page = tokio::task::spawn_blocking(move || index.page(request))
                .await
                .map_err(|err| DeviceError::Unavailable(err.to_string()))??;
            let fetched = page.assets.len();
            for asset in page.assets {
                if !asset.id.is_empty() && seen.insert(asset.id.clone()) {
                    assets.push(asset);
                }
            }
            if !page.has_next_page || fetched == 0 {
                return Ok(assets);
            }
            offset += fetched;
            if page_no + 1 == self.max_pages {
                warn!(
                    "Stopped enumerating after {} pages ({} assets)",
                    self.max_pages,
                    assets.len()
                );
            }
        }
        Ok(assets)
    }
}

fn in_scope(scope: &HashSet<&str>, folder: Option<&str>) -> bool {
    if scope.is_empty() {
        return true;
    }
    match folder {
        Some(folder) => scope.contains(folder),
        None => false,
    }
}

/// Fresh device facts plus whatever enrichment the store already holds.
fn build_record(
    asset: &DeviceAsset,
    folder: Option<String>,
    cached: Option<&TrackRecord>,
) -> TrackRecord {
    let parsed = parse_filename(&asset.filename);
    let mut record = TrackRecord {
        id: asset.id.clone(),
        filename: asset.filename.clone(),
        uri: asset.uri.clone(),
        duration_ms: asset.duration_ms,
        date_added: asset.modification_time,
        title: parsed.title,
        artist: parsed.artist,
        album: None,
        year: None,
        genre: None,
        album_id: None,
        cover_image: None,
        scan_status: ScanStatus::Pending,
        folder,
    };
    if let Some(cached) = cached {
        if !cached.title.trim().is_empty() {
            record.title = cached.title.clone();
        }
        if !cached.artist.trim().is_empty() {
            record.artist = cached.artist.clone();
        }
        if record.duration_ms == 0 {
            record.duration_ms = cached.duration_ms;
        }
        record.album = cached.album.clone();
        record.year = cached.year;
        record.genre = cached.genre.clone();
        record.album_id = cached.album_id.clone();
        record.cover_image = cached.cover_image.clone();
        record.scan_status = cached.scan_status;
    }
    record
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportError {
    AlreadyInProgress,
    Enumeration(String),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::AlreadyInProgress => write!(f, "import already in progress"),
            ImportError::Enumeration(reason) => write!(f, "media enumeration failed: {}", reason),
        }
    }
}

impl std::error::Error for ImportError {}
