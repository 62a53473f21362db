use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{PlayStats, Playlist, PlaylistSong, ScanStatus, Song, TrackOverlay};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LibraryConfig;
use crate::derived::{compute_derived, ArtistPlays, DerivedLimits, DerivedStats};
use crate::device::MediaIndex;
use crate::enrich::{EnrichmentCache, MetadataService};
use crate::import::{ImportEvent, ImportOptions, ImportOrchestrator, ImportPhase, ImportProgress};
use crate::merge::merge_song_data;
use crate::settings::{
    SettingsError, SettingsStore, FAVORITE_ALBUMS_KEY, FAVORITE_ARTISTS_KEY, FOLDERS_KEY,
    LIKED_SONGS_KEY, NEVER_PLAYED_KEY, OVERRIDES_KEY, PLAYLISTS_KEY, PLAY_STATS_KEY,
    RECENTLY_ADDED_KEY, RECENTLY_PLAYED_KEY, TOP_ARTISTS_KEY,
};
use crate::store::{SyncStatus, TrackPatch, TrackStore};
use crate::{now_ms, LibraryError};

/// The merged, in-memory music library plus everything that keeps it in
/// sync with disk: the track store, user edits, play stats, user lists and
/// derived stats.
#[derive(Clone)]
pub struct Library {
    inner: Arc<LibraryInner>,
}

struct LibraryInner {
    config: LibraryConfig,
    store: TrackStore,
    settings: SettingsStore,
    importer: ImportOrchestrator,
    enrichment: MetadataService,
    view: RwLock<LibraryView>,
    overlay: Mutex<HashMap<String, TrackOverlay>>,
    stats: Mutex<HashMap<String, PlayStats>>,
    overlay_write: tokio::sync::Mutex<()>,
    stats_write: tokio::sync::Mutex<()>,
    user_write: tokio::sync::Mutex<()>,
    import_gate: tokio::sync::RwLock<()>,
    derived_generation: AtomicU64,
    derived_last_run: Mutex<Option<Instant>>,
    art_queue: Mutex<HashSet<String>>,
    art_generation: AtomicU64,
    progress: watch::Sender<Option<ImportProgress>>,
}

#[derive(Default)]
struct LibraryView {
    songs: Vec<Song>,
    liked_songs: Vec<Song>,
    playlists: Vec<Playlist>,
    favorite_artists: Vec<String>,
    favorite_albums: Vec<String>,
    folder_scope: Vec<String>,
    derived: DerivedStats,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub songs: usize,
    pub cancelled: bool,
    pub persisted: usize,
}

#[derive(Debug)]
pub struct InitOutcome {
    /// Songs shown from disk before any scan ran.
    pub instant_songs: usize,
    /// True when the follow-up scan is a silent reconciliation.
    pub quiet: bool,
    pub import: JoinHandle<Result<ImportSummary, LibraryError>>,
}

impl Library {
    pub fn open(config: LibraryConfig, index: Arc<dyn MediaIndex>) -> Result<Self, LibraryError> {
        let store = TrackStore::open(Path::new(&config.index_path))?;
        let settings = SettingsStore::new(store.db());
        settings.init_tables()?;
        let importer =
            ImportOrchestrator::new(Arc::clone(&index), store.clone(), settings.clone(), &config);
        let enrichment =
            MetadataService::from_config(index, Arc::new(EnrichmentCache::default()), &config);
        let (progress, _) = watch::channel(None);
        info!("Library opened at {}", config.index_path);

        Ok(Self {
            inner: Arc::new(LibraryInner {
                config,
                store,
                settings,
                importer,
                enrichment,
                view: RwLock::new(LibraryView::default()),
                overlay: Mutex::new(HashMap::new()),
                stats: Mutex::new(HashMap::new()),
                overlay_write: tokio::sync::Mutex::new(()),
                stats_write: tokio::sync::Mutex::new(()),
                user_write: tokio::sync::Mutex::new(()),
                import_gate: tokio::sync::RwLock::new(()),
                derived_generation: AtomicU64::new(0),
                derived_last_run: Mutex::new(None),
                art_queue: Mutex::new(HashSet::new()),
                art_generation: AtomicU64::new(0),
                progress,
            }),
        })
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &TrackStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    /// Loads every persisted layer at once, shows whatever is available,
    /// then starts a scan in the background. The scan is quiet when a cached
    /// view could already be shown.
    pub async fn initialize(&self) -> Result<InitOutcome, LibraryError> {
        let inner = &self.inner;
        let settings = &inner.settings;
        let (
            records,
            overlay,
            stats,
            recently_played,
            recently_added,
            never_played,
            top_artists,
            liked_songs,
            playlists,
            favorite_artists,
            favorite_albums,
            folder_scope,
        ) = tokio::join!(
            inner.store.get_all(),
            settings.load_map::<TrackOverlay>(OVERRIDES_KEY),
            settings.load_map::<PlayStats>(PLAY_STATS_KEY),
            settings.load::<Vec<Song>>(RECENTLY_PLAYED_KEY),
            settings.load::<Vec<Song>>(RECENTLY_ADDED_KEY),
            settings.load::<Vec<Song>>(NEVER_PLAYED_KEY),
            settings.load::<Vec<ArtistPlays>>(TOP_ARTISTS_KEY),
            settings.load::<Vec<Song>>(LIKED_SONGS_KEY),
            settings.load::<Vec<Playlist>>(PLAYLISTS_KEY),
            settings.load::<Vec<String>>(FAVORITE_ARTISTS_KEY),
            settings.load::<Vec<String>>(FAVORITE_ALBUMS_KEY),
            settings.load::<Vec<String>>(FOLDERS_KEY),
        );
        let records = records.unwrap_or_else(|err| {
            warn!("Track cache unreadable, starting fresh: {}", err);
            Vec::new()
        });

        let songs = merge_song_data(
            records.into_iter().map(Song::from_record).collect(),
            &overlay,
            &stats,
        );
        *inner.overlay.lock() = overlay;
        *inner.stats.lock() = stats;

        let derived = DerivedStats {
            recently_played,
            recently_added,
            never_played,
            top_artists,
        };
        let instant_songs = songs.len();
        let quiet = instant_songs > 0 || !derived.is_empty();
        {
            let mut view = inner.view.write();
            view.songs = songs;
            view.liked_songs = liked_songs;
            view.playlists = playlists;
            view.favorite_artists = favorite_artists;
            view.favorite_albums = favorite_albums;
            view.folder_scope = folder_scope;
            view.derived = derived;
        }
        info!(
            "Library initialized with {} cached songs ({} scan)",
            instant_songs,
            if quiet { "quiet" } else { "full" }
        );

        let library = self.clone();
        let import = tokio::spawn(async move { library.import(quiet).await });
        Ok(InitOutcome {
            instant_songs,
            quiet,
            import,
        })
    }

    /// Runs one scan over the current folder scope and folds its results
    /// into the merged view. Progress is published unless `quiet`.
    pub async fn import(&self, quiet: bool) -> Result<ImportSummary, LibraryError> {
        let inner = &self.inner;
        // held until every batch is applied and persisted; clearing waits on it
        let _running = inner.import_gate.read().await;
        let options = ImportOptions {
            folders: self.folder_scope(),
        };
        let mut events = inner.importer.start(options);
        let mut summary = ImportSummary::default();

        while let Some(event) = events.next().await {
            match event {
                ImportEvent::Progress(progress) => {
                    if progress.phase == ImportPhase::Cancelled {
                        summary.cancelled = true;
                        summary.songs = progress.songs_loaded;
                    }
                    if !quiet {
                        inner.progress.send_replace(Some(progress));
                    }
                }
                ImportEvent::SongsUpdated(batch) => {
                    let merged = self.merge_overlays(batch);
                    self.apply_batch(merged);
                }
                ImportEvent::Complete { songs, persistence } => {
                    let merged = self.merge_overlays(songs);
                    summary.songs = merged.len();
                    self.replace_songs(merged);
                    summary.persisted = persistence.wait().await?;
                    self.schedule_derived_refresh();
                }
                ImportEvent::Error(err) => return Err(err.into()),
            }
        }
        Ok(summary)
    }

    /// Persists a new folder scope. An empty scope clears the library and
    /// the store; anything else triggers a visible rescan.
    pub async fn load_from_folders(
        &self,
        folders: Vec<String>,
    ) -> Result<ImportSummary, LibraryError> {
        {
            let _queued = self.inner.user_write.lock().await;
            self.inner.settings.save(FOLDERS_KEY, &folders).await?;
            self.inner.view.write().folder_scope = folders.clone();
        }
        if folders.is_empty() {
            self.clear_library().await?;
            return Ok(ImportSummary::default());
        }
        self.import(false).await
    }

    /// Stops any running import and waits for it to settle before wiping,
    /// so no batch or write from that run lands after the clear.
    async fn clear_library(&self) -> Result<(), LibraryError> {
        let inner = &self.inner;
        if inner.importer.cancel() {
            info!("Cancelling running import before clearing library");
        }
        let _settled = inner.import_gate.write().await;
        let _queued = inner.user_write.lock().await;
        {
            let mut view = inner.view.write();
            view.songs.clear();
            view.liked_songs.clear();
            view.favorite_artists.clear();
            view.favorite_albums.clear();
            view.derived = DerivedStats::default();
        }
        let no_songs: Vec<Song> = Vec::new();
        let no_names: Vec<String> = Vec::new();
        let no_artists: Vec<ArtistPlays> = Vec::new();
        let settings = &inner.settings;
        tokio::try_join!(
            settings.save(LIKED_SONGS_KEY, &no_songs),
            settings.save(FAVORITE_ARTISTS_KEY, &no_names),
            settings.save(FAVORITE_ALBUMS_KEY, &no_names),
            settings.save(RECENTLY_PLAYED_KEY, &no_songs),
            settings.save(RECENTLY_ADDED_KEY, &no_songs),
            settings.save(NEVER_PLAYED_KEY, &no_songs),
            settings.save(TOP_ARTISTS_KEY, &no_artists),
        )?;
        inner.store.reset().await?;
        info!("Library cleared: no folders selected");
        Ok(())
    }

    /// Records a user edit, persists it and patches every in-memory copy of
    /// the track without waiting for a rescan.
    pub async fn update_metadata(&self, id: &str, updates: TrackOverlay) -> Result<(), LibraryError> {
        if updates.is_empty() {
            return Ok(());
        }
        let inner = &self.inner;
        {
            let _queued = inner.overlay_write.lock().await;
            let bytes = {
                let mut overlay = inner.overlay.lock();
                overlay
                    .entry(id.to_string())
                    .or_default()
                    .merge(updates.clone());
                encode(&*overlay)?
            };
            inner.settings.set_raw(OVERRIDES_KEY, bytes).await?;
        }
        let copies_touched = self.patch_everywhere(id, |song| updates.apply_to(song));
        if copies_touched {
            self.persist_user_lists().await?;
        }
        debug!("Updated metadata for {}", id);
        Ok(())
    }

    /// Appends a play to the track's history and persists the stats layer.
    /// Calls are serialized so rapid plays never lose updates.
    pub async fn increment_play_count(&self, id: &str) -> Result<PlayStats, LibraryError> {
        let inner = &self.inner;
        let entry = {
            let _queued = inner.stats_write.lock().await;
            let (entry, bytes) = {
                let mut stats = inner.stats.lock();
                let entry = {
                    let entry = stats.entry(id.to_string()).or_default();
                    entry.record_play(now_ms());
                    entry.clone()
                };
                (entry, encode(&*stats)?)
            };
            inner.settings.set_raw(PLAY_STATS_KEY, bytes).await?;
            entry
        };
        self.patch_everywhere(id, |song| entry.apply_to(song));
        self.schedule_derived_refresh();
        Ok(entry)
    }

    /// Reads deep tags for one track and folds any field that differs from
    /// the merged view into the user-edit layer. Returns true when something
    /// changed.
    pub async fn refresh_one(&self, id: &str, force: bool) -> Result<bool, LibraryError> {
        let song = match self.song(id) {
            Some(song) => song,
            None => return Err(LibraryError::UnknownTrack(id.to_string())),
        };
        let fields = self
            .inner
            .enrichment
            .fetch_tags(&song.uri, Some(&song.id), force)
            .await;
        if fields.is_empty() {
            self.advance_status(id, ScanStatus::Failed, None).await?;
            return Ok(false);
        }

        let mut updates = TrackOverlay::default();
        if let Some(title) = fields.title.filter(|title| *title != song.title) {
            updates.title = Some(title);
        }
        if let Some(artist) = fields.artist.filter(|artist| *artist != song.artist) {
            updates.artist = Some(artist);
        }
        if let Some(album) = fields
            .album
            .filter(|album| song.album.as_deref() != Some(album.as_str()))
        {
            updates.album = Some(album);
        }
        if let Some(genre) = fields
            .genre
            .filter(|genre| song.genre.as_deref() != Some(genre.as_str()))
        {
            updates.genre = Some(genre);
        }
        if let Some(year) = fields.year.filter(|year| song.year != Some(*year)) {
            updates.year = Some(year);
        }

        self.advance_status(id, ScanStatus::Enhanced, None).await?;
        if updates.is_empty() {
            return Ok(false);
        }
        self.update_metadata(id, updates).await?;
        Ok(true)
    }

    /// Runs `refresh_one` over tracks whose merged facts still look like
    /// placeholders. Returns how many tracks changed.
    pub async fn refresh_suspicious(&self, limit: usize) -> Result<usize, LibraryError> {
        let candidates: Vec<String> = {
            let view = self.inner.view.read();
            view.songs
                .iter()
                .filter(|song| {
                    !matches!(
                        song.scan_status,
                        ScanStatus::Failed | ScanStatus::Enhanced | ScanStatus::Success
                    ) && song.looks_suspicious()
                })
                .take(limit)
                .map(|song| song.id.clone())
                .collect()
        };
        let mut changed = 0usize;
        for id in candidates {
            match self.refresh_one(&id, false).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(LibraryError::UnknownTrack(_)) => {}
                Err(err) => return Err(err),
            }
            tokio::task::yield_now().await;
        }
        if changed > 0 {
            info!("Refreshed tags for {} suspicious tracks", changed);
        }
        Ok(changed)
    }

    /// Background sweep over pending store rows: resolves artwork and marks
    /// each row cached. Returns the number of rows processed.
    pub async fn enrich_pending(&self, limit: usize) -> Result<usize, LibraryError> {
        let pending = self.inner.store.get_pending(limit).await?;
        let mut processed = 0usize;
        for record in pending {
            let cover = self.inner.enrichment.fetch_artwork(&record.uri).await;
            self.advance_status(&record.id, ScanStatus::Cached, cover)
                .await?;
            processed += 1;
            tokio::task::yield_now().await;
        }
        if processed > 0 {
            info!("Enriched {} pending tracks", processed);
        }
        Ok(processed)
    }

    /// Queues artwork resolution for tracks that lack it. Requests arriving
    /// within the debounce window are resolved together by the last task.
    pub fn request_artwork(&self, ids: &[String]) -> JoinHandle<()> {
        let inner = &self.inner;
        let wanted: Vec<String> = {
            let view = inner.view.read();
            ids.iter()
                .filter(|id| !inner.enrichment.cache().is_in_flight(id))
                .filter(|id| {
                    view.songs
                        .iter()
                        .any(|song| song.id == **id && song.cover_image.is_none())
                })
                .cloned()
                .collect()
        };
        inner.art_queue.lock().extend(wanted);
        let generation = inner.art_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let debounce = inner.config.artwork_debounce();
        let library = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if library.inner.art_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let batch: Vec<String> = library.inner.art_queue.lock().drain().collect();
            library.resolve_artwork(batch).await;
        })
    }

    async fn resolve_artwork(&self, ids: Vec<String>) {
        let cache = Arc::clone(self.inner.enrichment.cache());
        for id in ids {
            if !cache.begin(&id) {
                continue;
            }
            if let Some(song) = self.song(&id) {
                if let Some(cover) = self.inner.enrichment.fetch_artwork(&song.uri).await {
                    if let Err(err) = self
                        .advance_status(&id, ScanStatus::Cached, Some(cover))
                        .await
                    {
                        warn!("Failed to record artwork for {}: {}", id, err);
                    }
                }
            }
            cache.finish(&id);
        }
    }

    /// Recomputes and persists the derived lists right away.
    pub async fn refresh_derived(&self) -> Result<DerivedStats, LibraryError> {
        let inner = &self.inner;
        let limits = DerivedLimits {
            recent: inner.config.recent_limit,
            top_artists: inner.config.top_artists_limit,
        };
        let derived = {
            let view = inner.view.read();
            compute_derived(&view.songs, limits)
        };
        inner.view.write().derived = derived.clone();
        *inner.derived_last_run.lock() = Some(Instant::now());

        let settings = &inner.settings;
        tokio::try_join!(
            settings.save(RECENTLY_PLAYED_KEY, &derived.recently_played),
            settings.save(RECENTLY_ADDED_KEY, &derived.recently_added),
            settings.save(NEVER_PLAYED_KEY, &derived.never_played),
            settings.save(TOP_ARTISTS_KEY, &derived.top_artists),
        )?;
        debug!("Derived stats refreshed");
        Ok(derived)
    }

    /// Debounced and throttled `refresh_derived`. Only the most recent
    /// request in a burst does any work.
    pub fn schedule_derived_refresh(&self) -> JoinHandle<()> {
        let inner = &self.inner;
        let generation = inner.derived_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let debounce = inner.config.derived_debounce();
        let throttle = inner.config.derived_throttle();
        let library = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let current = || library.inner.derived_generation.load(Ordering::SeqCst);
            if current() != generation {
                return;
            }
            let last_run = *library.inner.derived_last_run.lock();
            if let Some(last_run) = last_run {
                let wait = throttle.saturating_sub(last_run.elapsed());
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                    if current() != generation {
                        return;
                    }
                }
            }
            if let Err(err) = library.refresh_derived().await {
                warn!("Derived stats refresh failed: {}", err);
            }
        })
    }

    pub async fn toggle_like(&self, id: &str) -> Result<bool, LibraryError> {
        let inner = &self.inner;
        let _queued = inner.user_write.lock().await;
        let (liked, snapshot) = {
            let mut view = inner.view.write();
            let liked = match view.liked_songs.iter().position(|song| song.id == id) {
                Some(pos) => {
                    view.liked_songs.remove(pos);
                    false
                }
                None => {
                    let song = view
                        .songs
                        .iter()
                        .find(|song| song.id == id)
                        .cloned()
                        .ok_or_else(|| LibraryError::UnknownTrack(id.to_string()))?;
                    view.liked_songs.insert(0, song);
                    true
                }
            };
            (liked, view.liked_songs.clone())
        };
        inner.settings.save(LIKED_SONGS_KEY, &snapshot).await?;
        Ok(liked)
    }

    pub async fn create_playlist(&self, name: &str) -> Result<Playlist, LibraryError> {
        let name = valid_name(name)?;
        let playlist = Playlist {
            id: Uuid::new_v4().to_string(),
            name,
            songs: Vec::new(),
            created_at: now_ms(),
            is_favorite: false,
        };
        let created = playlist.clone();
        self.mutate_playlists(move |playlists| {
            playlists.push(playlist);
            Ok(())
        })
        .await?;
        Ok(created)
    }

    pub async fn rename_playlist(&self, playlist_id: &str, name: &str) -> Result<(), LibraryError> {
        let name = valid_name(name)?;
        self.mutate_playlists(|playlists| {
            find_playlist(playlists, playlist_id)?.name = name;
            Ok(())
        })
        .await
    }

    pub async fn delete_playlist(&self, playlist_id: &str) -> Result<(), LibraryError> {
        self.mutate_playlists(|playlists| {
            let before = playlists.len();
            playlists.retain(|playlist| playlist.id != playlist_id);
            if playlists.len() == before {
                return Err(LibraryError::UnknownPlaylist(playlist_id.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Adds a snapshot of the song. Returns false if it was already there.
    pub async fn add_to_playlist(&self, playlist_id: &str, song_id: &str) -> Result<bool, LibraryError> {
        let song = self
            .song(song_id)
            .ok_or_else(|| LibraryError::UnknownTrack(song_id.to_string()))?;
        self.mutate_playlists(|playlists| {
            let playlist = find_playlist(playlists, playlist_id)?;
            if playlist.songs.iter().any(|entry| entry.song.id == song_id) {
                return Ok(false);
            }
            playlist.songs.push(PlaylistSong {
                song,
                added_at: now_ms(),
            });
            Ok(true)
        })
        .await
    }

    pub async fn remove_from_playlist(
        &self,
        playlist_id: &str,
        song_id: &str,
    ) -> Result<bool, LibraryError> {
        self.mutate_playlists(|playlists| {
            let playlist = find_playlist(playlists, playlist_id)?;
            let before = playlist.songs.len();
            playlist.songs.retain(|entry| entry.song.id != song_id);
            Ok(playlist.songs.len() != before)
        })
        .await
    }

    pub async fn set_playlist_favorite(
        &self,
        playlist_id: &str,
        favorite: bool,
    ) -> Result<(), LibraryError> {
        self.mutate_playlists(|playlists| {
            find_playlist(playlists, playlist_id)?.is_favorite = favorite;
            Ok(())
        })
        .await
    }

    pub async fn toggle_favorite_artist(&self, name: &str) -> Result<bool, LibraryError> {
        self.toggle_favorite(FAVORITE_ARTISTS_KEY, name, |view| &mut view.favorite_artists)
            .await
    }

    pub async fn toggle_favorite_album(&self, name: &str) -> Result<bool, LibraryError> {
        self.toggle_favorite(FAVORITE_ALBUMS_KEY, name, |view| &mut view.favorite_albums)
            .await
    }

    pub fn songs(&self) -> Vec<Song> {
        self.inner.view.read().songs.clone()
    }

    pub fn song(&self, id: &str) -> Option<Song> {
        self.inner
            .view
            .read()
            .songs
            .iter()
            .find(|song| song.id == id)
            .cloned()
    }

    pub fn liked_songs(&self) -> Vec<Song> {
        self.inner.view.read().liked_songs.clone()
    }

    pub fn playlists(&self) -> Vec<Playlist> {
        self.inner.view.read().playlists.clone()
    }

    pub fn favorite_artists(&self) -> Vec<String> {
        self.inner.view.read().favorite_artists.clone()
    }

    pub fn favorite_albums(&self) -> Vec<String> {
        self.inner.view.read().favorite_albums.clone()
    }

    pub fn folder_scope(&self) -> Vec<String> {
        self.inner.view.read().folder_scope.clone()
    }

    pub fn derived(&self) -> DerivedStats {
        self.inner.view.read().derived.clone()
    }

    pub fn overlay(&self, id: &str) -> Option<TrackOverlay> {
        self.inner.overlay.lock().get(id).cloned()
    }

    pub fn play_stats(&self, id: &str) -> Option<PlayStats> {
        self.inner.stats.lock().get(id).cloned()
    }

    pub async fn sync_status(&self) -> Result<SyncStatus, LibraryError> {
        Ok(self.inner.store.sync_status().await?)
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Option<ImportProgress>> {
        self.inner.progress.subscribe()
    }

    pub fn cancel_import(&self) -> bool {
        self.inner.importer.cancel()
    }

    pub fn is_importing(&self) -> bool {
        self.inner.importer.is_in_progress()
    }

    pub fn clear_enrichment_cache(&self) {
        self.inner.enrichment.cache().clear();
        self.inner.art_queue.lock().clear();
    }

    fn merge_overlays(&self, songs: Vec<Song>) -> Vec<Song> {
        let overlay = self.inner.overlay.lock();
        let stats = self.inner.stats.lock();
        merge_song_data(songs, &overlay, &stats)
    }

    /// Upserts a partial import batch into the view. A song already shown
    /// keeps any status or artwork it gained in the meantime.
    fn apply_batch(&self, batch: Vec<Song>) {
        let mut view = self.inner.view.write();
        let positions: HashMap<String, usize> = view
            .songs
            .iter()
            .enumerate()
            .map(|(pos, song)| (song.id.clone(), pos))
            .collect();
        let mut appended = false;
        for mut song in batch {
            match positions.get(&song.id) {
                Some(&pos) => {
                    keep_progress(&view.songs[pos], &mut song);
                    view.songs[pos] = song;
                }
                None => {
                    view.songs.push(song);
                    appended = true;
                }
            }
        }
        if appended {
            view.songs.sort_by(|a, b| {
                b.date_added
                    .cmp(&a.date_added)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }
    }

    fn replace_songs(&self, mut songs: Vec<Song>) {
        let mut view = self.inner.view.write();
        let previous: HashMap<&str, &Song> = view
            .songs
            .iter()
            .map(|song| (song.id.as_str(), song))
            .collect();
        for song in songs.iter_mut() {
            if let Some(existing) = previous.get(song.id.as_str()) {
                keep_progress(existing, song);
            }
        }
        drop(previous);
        view.songs = songs;
    }

    /// Applies `update` to the main list, liked songs, playlist entries and
    /// derived lists. Returns true if a persisted user list was touched.
    fn patch_everywhere(&self, id: &str, update: impl Fn(&mut Song)) -> bool {
        let mut view = self.inner.view.write();
        for song in view.songs.iter_mut().filter(|song| song.id == id) {
            update(song);
        }
        let mut touched = false;
        for song in view.liked_songs.iter_mut().filter(|song| song.id == id) {
            update(song);
            touched = true;
        }
        for playlist in view.playlists.iter_mut() {
            for entry in playlist.songs.iter_mut().filter(|entry| entry.song.id == id) {
                update(&mut entry.song);
                touched = true;
            }
        }
        view.derived.patch_song(id, &update);
        touched
    }

    async fn advance_status(
        &self,
        id: &str,
        status: ScanStatus,
        cover: Option<String>,
    ) -> Result<(), LibraryError> {
        let patch = TrackPatch {
            cover_image: cover.clone(),
            scan_status: Some(status),
            ..TrackPatch::default()
        };
        self.inner.store.update_partial(id, patch).await?;
        self.patch_everywhere(id, |song| {
            song.scan_status = song.scan_status.advance(status);
            if cover.is_some() && song.cover_image.is_none() {
                song.cover_image = cover.clone();
            }
        });
        Ok(())
    }

    async fn persist_user_lists(&self) -> Result<(), LibraryError> {
        let _queued = self.inner.user_write.lock().await;
        let (liked, playlists) = {
            let view = self.inner.view.read();
            (view.liked_songs.clone(), view.playlists.clone())
        };
        let settings = &self.inner.settings;
        tokio::try_join!(
            settings.save(LIKED_SONGS_KEY, &liked),
            settings.save(PLAYLISTS_KEY, &playlists),
        )?;
        Ok(())
    }

    async fn mutate_playlists<R>(
        &self,
        change: impl FnOnce(&mut Vec<Playlist>) -> Result<R, LibraryError>,
    ) -> Result<R, LibraryError> {
        let _queued = self.inner.user_write.lock().await;
        let (result, snapshot) = {
            let mut view = self.inner.view.write();
            let result = change(&mut view.playlists)?;
            (result, view.playlists.clone())
        };
        self.inner.settings.save(PLAYLISTS_KEY, &snapshot).await?;
        Ok(result)
    }

    async fn toggle_favorite(
        &self,
        key: &str,
        name: &str,
        list: impl FnOnce(&mut LibraryView) -> &mut Vec<String>,
    ) -> Result<bool, LibraryError> {
        let name = valid_name(name)?;
        let _queued = self.inner.user_write.lock().await;
        let (added, snapshot) = {
            let mut view = self.inner.view.write();
            let names = list(&mut *view);
            let added = match names.iter().position(|existing| *existing == name) {
                Some(pos) => {
                    names.remove(pos);
                    false
                }
                None => {
                    names.push(name);
                    true
                }
            };
            (added, names.clone())
        };
        self.inner.settings.save(key, &snapshot).await?;
        Ok(added)
    }
}

/// Carries status and artwork from the shown copy of a song into a fresher
/// one so neither moves backwards.
fn keep_progress(existing: &Song, song: &mut Song) {
    song.scan_status = existing.scan_status.advance(song.scan_status);
    if song.cover_image.is_none() {
        song.cover_image = existing.cover_image.clone();
    }
}

fn find_playlist<'a>(
    playlists: &'a mut [Playlist],
    playlist_id: &str,
) -> Result<&'a mut Playlist, LibraryError> {
    playlists
        .iter_mut()
        .find(|playlist| playlist.id == playlist_id)
        .ok_or_else(|| LibraryError::UnknownPlaylist(playlist_id.to_string()))
}

fn valid_name(name: &str) -> Result<String, LibraryError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(LibraryError::InvalidInput("name is empty".to_string()));
    }
    Ok(trimmed.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SettingsError> {
    Ok(serde_json::to_vec(value)?)
}
