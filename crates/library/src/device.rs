use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use common::stable_id;
use parking_lot::RwLock;
use tracing::{debug, info};
use walkdir::WalkDir;

/// One audio asset as reported by the device index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceAsset {
    pub id: String,
    pub filename: String,
    pub uri: String,
    pub duration_ms: u64,
    pub modification_time: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetPage {
    pub assets: Vec<DeviceAsset>,
    pub has_next_page: bool,
    pub total: usize,
}

/// Source of audio assets. Calls may block; async callers run them on the
/// blocking pool.
pub trait MediaIndex: Send + Sync {
    /// Assets ordered newest modification time first.
    fn page(&self, request: PageRequest) -> Result<AssetPage, DeviceError>;

    fn asset(&self, id: &str) -> Result<Option<DeviceAsset>, DeviceError>;

    fn read_bytes(&self, uri: &str) -> Result<Vec<u8>, DeviceError> {
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        Ok(fs::read(path)?)
    }
}

/// Walks local directories for audio files. Every enumeration that starts at
/// offset zero re-walks the roots so rescans see new and removed files.
pub struct FsMediaIndex {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    assets: RwLock<Vec<DeviceAsset>>,
}

impl FsMediaIndex {
    pub fn new(roots: Vec<PathBuf>, extensions: &[String]) -> Self {
        Self {
            roots,
            extensions: extensions
                .iter()
                .map(|ext| ext.to_ascii_lowercase())
                .collect(),
            assets: RwLock::new(Vec::new()),
        }
    }

    pub fn refresh(&self) -> usize {
        let mut assets = Vec::new();
        for root in &self.roots {
            for entry in WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() || !self.is_audio(entry.path()) {
                    continue;
                }
                if let Some(asset) = asset_from_path(entry.path()) {
                    assets.push(asset);
                }
            }
        }
        sort_newest_first(&mut assets);
        let count = assets.len();
        info!("Media index found {} audio files", count);
        *self.assets.write() = assets;
        count
    }

    fn is_audio(&self, path: &Path) -> bool {
        match path.extension() {
            Some(ext) => {
                let ext = ext.to_string_lossy().to_ascii_lowercase();
                self.extensions.iter().any(|known| *known == ext)
            }
            None => false,
        }
    }
}

impl MediaIndex for FsMediaIndex {
    fn page(&self, request: PageRequest) -> Result<AssetPage, DeviceError> {
        for root in &self.roots {
            if !root.is_dir() {
                return Err(DeviceError::Unavailable(format!(
                    "{} is not a directory",
                    root.display()
                )));
            }
        }
        if request.offset == 0 {
            self.refresh();
        }
        Ok(slice_page(&self.assets.read(), request))
    }

    fn asset(&self, id: &str) -> Result<Option<DeviceAsset>, DeviceError> {
        if let Some(asset) = self.assets.read().iter().find(|asset| asset.id == id) {
            return Ok(Some(asset.clone()));
        }
        Ok(None)
    }
}

fn asset_from_path(path: &Path) -> Option<DeviceAsset> {
    let filename = path.file_name()?.to_string_lossy().into_owned();
    let uri = path.to_string_lossy().into_owned();
    let modification_time = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|since| since.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0);
    let duration_ms = match metadata::read_tags(path) {
        Ok(tags) => tags.duration_ms.unwrap_or(0),
        Err(err) => {
            debug!("No duration for {}: {}", uri, err);
            0
        }
    };
    Some(DeviceAsset {
        id: stable_id(&uri),
        filename,
        uri,
        duration_ms,
        modification_time,
    })
}

/// In-memory index for embedding a platform bridge that pushes assets in.
#[derive(Default)]
pub struct MemoryMediaIndex {
    assets: RwLock<Vec<DeviceAsset>>,
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryMediaIndex {
    pub fn new(assets: Vec<DeviceAsset>) -> Self {
        let index = Self::default();
        index.replace(assets);
        index
    }

    pub fn replace(&self, mut assets: Vec<DeviceAsset>) {
        sort_newest_first(&mut assets);
        *self.assets.write() = assets;
    }

    pub fn insert(&self, asset: DeviceAsset) {
        let mut assets = self.assets.write();
        assets.retain(|existing| existing.id != asset.id);
        assets.push(asset);
        sort_newest_first(&mut assets);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut assets = self.assets.write();
        let before = assets.len();
        assets.retain(|asset| asset.id != id);
        assets.len() != before
    }

    /// Registers content for a handle that is not a readable path.
    pub fn set_bytes(&self, uri: &str, bytes: Vec<u8>) {
        self.blobs.write().insert(uri.to_string(), bytes);
    }

    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }
}

impl MediaIndex for MemoryMediaIndex {
    fn page(&self, request: PageRequest) -> Result<AssetPage, DeviceError> {
        Ok(slice_page(&self.assets.read(), request))
    }

    fn asset(&self, id: &str) -> Result<Option<DeviceAsset>, DeviceError> {
        Ok(self.assets.read().iter().find(|asset| asset.id == id).cloned())
    }

    fn read_bytes(&self, uri: &str) -> Result<Vec<u8>, DeviceError> {
        if let Some(bytes) = self.blobs.read().get(uri) {
            return Ok(bytes.clone());
        }
        let path = uri.strip_prefix("file://").unwrap_or(uri);
        Ok(fs::read(path)?)
    }
}

fn slice_page(assets: &[DeviceAsset], request: PageRequest) -> AssetPage {
    let total = assets.len();
    let start = request.offset.min(total);
    let end = start.saturating_add(request.limit).min(total);
    AssetPage {
        assets: assets[start..end].to_vec(),
        has_next_page: end < total,
        total,
    }
}

fn sort_newest_first(assets: &mut [DeviceAsset]) {
    assets.sort_by(|a, b| {
        b.modification_time
            .cmp(&a.modification_time)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[derive(Debug)]
pub enum DeviceError {
    Io(std::io::Error),
    Unavailable(String),
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::Io(err) => write!(f, "io error: {}", err),
            DeviceError::Unavailable(reason) => write!(f, "media index unavailable: {}", reason),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        DeviceError::Io(err)
    }
}
