use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::stable_id;
use metadata::{CoverArt, MetadataError, TagInfo};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::LibraryConfig;
use crate::device::MediaIndex;

/// Fields a deep tag read can contribute to a track.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagFields {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<i32>,
}

impl TagFields {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.genre.is_none()
            && self.year.is_none()
    }
}

impl From<TagInfo> for TagFields {
    fn from(info: TagInfo) -> Self {
        Self {
            title: info.title,
            artist: info.artist,
            album: info.album,
            genre: info.genre,
            year: info.year,
        }
    }
}

/// Shared enrichment results plus the set of ids whose artwork is being
/// resolved right now. Owned by whoever composes the enrichment paths.
#[derive(Default)]
pub struct EnrichmentCache {
    tags: Mutex<HashMap<String, TagFields>>,
    artwork: Mutex<HashMap<String, Option<String>>>,
    in_flight: Mutex<HashSet<String>>,
}

impl EnrichmentCache {
    pub fn tags(&self, uri: &str) -> Option<TagFields> {
        self.tags.lock().get(uri).cloned()
    }

    /// `Some(None)` means the artwork was looked for and not found.
    pub fn artwork(&self, uri: &str) -> Option<Option<String>> {
        self.artwork.lock().get(uri).cloned()
    }

    /// Marks `id` as in flight. Returns false if it already was.
    pub fn begin(&self, id: &str) -> bool {
        self.in_flight.lock().insert(id.to_string())
    }

    pub fn finish(&self, id: &str) {
        self.in_flight.lock().remove(id);
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().contains(id)
    }

    pub fn clear(&self) {
        self.tags.lock().clear();
        self.artwork.lock().clear();
        self.in_flight.lock().clear();
    }

    fn store_tags(&self, uri: &str, fields: TagFields) {
        self.tags.lock().insert(uri.to_string(), fields);
    }

    fn store_artwork(&self, uri: &str, path: Option<String>) {
        self.artwork.lock().insert(uri.to_string(), path);
    }
}

/// Per-track deep reads. Nothing here returns an error: every failure is
/// logged and reported as "no data".
#[derive(Clone)]
pub struct MetadataService {
    index: Arc<dyn MediaIndex>,
    cache: Arc<EnrichmentCache>,
    artwork_dir: PathBuf,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl MetadataService {
    pub fn new(
        index: Arc<dyn MediaIndex>,
        cache: Arc<EnrichmentCache>,
        artwork_dir: PathBuf,
        scratch_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            cache,
            artwork_dir,
            scratch_dir,
            timeout,
        }
    }

    pub fn from_config(
        index: Arc<dyn MediaIndex>,
        cache: Arc<EnrichmentCache>,
        config: &LibraryConfig,
    ) -> Self {
        Self::new(
            index,
            cache,
            PathBuf::from(&config.artwork_path),
            PathBuf::from(&config.scratch_path),
            config.tag_read_timeout(),
        )
    }

    pub fn cache(&self) -> &Arc<EnrichmentCache> {
        &self.cache
    }

    pub async fn fetch_tags(&self, uri: &str, native_id: Option<&str>, force: bool) -> TagFields {
        if !force {
            if let Some(cached) = self.cache.tags(uri) {
                return cached;
            }
        }
        let fields = match self
            .with_readable(uri, native_id, metadata::read_tags)
            .await
        {
            Some(info) => TagFields::from(info),
            None => TagFields::default(),
        };
        self.cache.store_tags(uri, fields.clone());
        fields
    }

    /// Path of a cached image file holding the track's embedded picture.
    pub async fn fetch_artwork(&self, uri: &str) -> Option<String> {
        if let Some(cached) = self.cache.artwork(uri) {
            return cached;
        }
        let resolved = self.resolve_artwork(uri).await;
        self.cache.store_artwork(uri, resolved.clone());
        resolved
    }

    async fn resolve_artwork(&self, uri: &str) -> Option<String> {
        let key = stable_id(uri);
        for ext in ["jpg", "png"] {
            let existing = self.artwork_dir.join(format!("{}.{}", key, ext));
            if tokio::fs::try_exists(&existing).await.unwrap_or(false) {
                return Some(existing.to_string_lossy().into_owned());
            }
        }

        let cover: CoverArt = self
            .with_readable(uri, None, metadata::read_cover)
            .await
            .flatten()?;

        let target = self
            .artwork_dir
            .join(format!("{}.{}", key, cover.extension()));
        if let Err(err) = tokio::fs::create_dir_all(&self.artwork_dir).await {
            warn!("Cannot create artwork dir {}: {}", self.artwork_dir.display(), err);
            return None;
        }
        if let Err(err) = tokio::fs::write(&target, &cover.data).await {
            warn!("Failed to write artwork {}: {}", target.display(), err);
            return None;
        }
        Some(target.to_string_lossy().into_owned())
    }

    /// Finds a readable file for `uri` and runs `read` on it off the async
    /// threads, bounded by the read timeout. Handles that are not paths are
    /// resolved through the media index, or copied to a scratch file.
    async fn with_readable<T, F>(&self, uri: &str, native_id: Option<&str>, read: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, MetadataError> + Send + 'static,
    {
        if let Some(path) = direct_path(uri) {
            return self.read_bounded(path, read).await;
        }

        if let Some(id) = native_id {
            if let Some(path) = self.lookup_native(id).await {
                return self.read_bounded(path, read).await;
            }
        }

        let scratch = self.copy_to_scratch(uri).await?;
        let result = self.read_bounded(scratch.clone(), read).await;
        if let Err(err) = tokio::fs::remove_file(&scratch).await {
            debug!("Failed to remove scratch copy {}: {}", scratch.display(), err);
        }
        result
    }

    async fn read_bounded<T, F>(&self, path: PathBuf, read: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, MetadataError> + Send + 'static,
    {
        let shown = path.display().to_string();
        let task = tokio::task::spawn_blocking(move || read(&path));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(value))) => Some(value),
            Ok(Ok(Err(err))) => {
                debug!("Tag read failed for {}: {}", shown, err);
                None
            }
            Ok(Err(err)) => {
                warn!("Tag read task failed for {}: {}", shown, err);
                None
            }
            Err(_) => {
                warn!("Tag read timed out for {}", shown);
                None
            }
        }
    }

    async fn lookup_native(&self, id: &str) -> Option<PathBuf> {
        let index = Arc::clone(&self.index);
        let id = id.to_string();
        let asset = match tokio::task::spawn_blocking(move || index.asset(&id)).await {
            Ok(Ok(asset)) => asset?,
            Ok(Err(err)) => {
                debug!("Asset lookup failed: {}", err);
                return None;
            }
            Err(err) => {
                warn!("Asset lookup task failed: {}", err);
                return None;
            }
        };
        direct_path(&asset.uri)
    }

    async fn copy_to_scratch(&self, uri: &str) -> Option<PathBuf> {
        let index = Arc::clone(&self.index);
        let source = uri.to_string();
        let bytes = match tokio::task::spawn_blocking(move || index.read_bytes(&source)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                debug!("No readable content for {}: {}", uri, err);
                return None;
            }
            Err(err) => {
                warn!("Copy task failed for {}: {}", uri, err);
                return None;
            }
        };
        if let Err(err) = tokio::fs::create_dir_all(&self.scratch_dir).await {
            warn!("Cannot create scratch dir {}: {}", self.scratch_dir.display(), err);
            return None;
        }
        let name = match handle_extension(uri) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let target = self.scratch_dir.join(name);
        match tokio::fs::write(&target, bytes).await {
            Ok(()) => Some(target),
            Err(err) => {
                warn!("Failed to write scratch copy {}: {}", target.display(), err);
                None
            }
        }
    }
}

/// A local path for `uri` if it names an existing file directly.
fn direct_path(uri: &str) -> Option<PathBuf> {
    let raw = match uri.strip_prefix("file://") {
        Some(rest) => rest,
        None if uri.contains("://") => return None,
        None => uri,
    };
    let path = PathBuf::from(raw);
    if path.is_file() {
        Some(path)
    } else {
        None
    }
}

fn handle_extension(uri: &str) -> Option<&str> {
    let name = uri.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        None
    } else {
        Some(ext)
    }
}
