use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod derived;
pub mod device;
pub mod enrich;
pub mod import;
pub mod merge;
pub mod settings;
pub mod state;
pub mod store;

pub use config::{
    config_path_from_env, load_or_create_config, resolve_path, save_config, ConfigError,
    LibraryConfig,
};
pub use derived::{compute_derived, ArtistPlays, DerivedLimits, DerivedStats};
pub use device::{
    AssetPage, DeviceAsset, DeviceError, FsMediaIndex, MediaIndex, MemoryMediaIndex, PageRequest,
};
pub use enrich::{EnrichmentCache, MetadataService, TagFields};
pub use import::{
    ImportError, ImportEvent, ImportEvents, ImportOptions, ImportOrchestrator, ImportPhase,
    ImportProgress, PersistTicket,
};
pub use merge::{merge_one, merge_song_data};
pub use settings::{SettingsError, SettingsStore};
pub use state::{ImportSummary, InitOutcome, Library};
pub use store::{StoreError, SyncStatus, TrackPatch, TrackStore};

#[derive(Debug)]
pub enum LibraryError {
    Store(StoreError),
    Settings(SettingsError),
    Import(ImportError),
    Config(ConfigError),
    Device(DeviceError),
    UnknownTrack(String),
    UnknownPlaylist(String),
    InvalidInput(String),
}

impl std::fmt::Display for LibraryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LibraryError::Store(err) => write!(f, "store error: {}", err),
            LibraryError::Settings(err) => write!(f, "settings error: {}", err),
            LibraryError::Import(err) => write!(f, "import error: {}", err),
            LibraryError::Config(err) => write!(f, "config error: {}", err),
            LibraryError::Device(err) => write!(f, "device error: {}", err),
            LibraryError::UnknownTrack(id) => write!(f, "unknown track: {}", id),
            LibraryError::UnknownPlaylist(id) => write!(f, "unknown playlist: {}", id),
            LibraryError::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
        }
    }
}

impl std::error::Error for LibraryError {}

impl From<StoreError> for LibraryError {
    fn from(err: StoreError) -> Self {
        LibraryError::Store(err)
    }
}

impl From<SettingsError> for LibraryError {
    fn from(err: SettingsError) -> Self {
        LibraryError::Settings(err)
    }
}

impl From<ImportError> for LibraryError {
    fn from(err: ImportError) -> Self {
        LibraryError::Import(err)
    }
}

impl From<ConfigError> for LibraryError {
    fn from(err: ConfigError) -> Self {
        LibraryError::Config(err)
    }
}

impl From<DeviceError> for LibraryError {
    fn from(err: DeviceError) -> Self {
        LibraryError::Device(err)
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
