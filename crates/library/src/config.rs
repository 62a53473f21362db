use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "aac", "ogg", "opus", "wav"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub version: u32,
    pub index_path: String,
    pub artwork_path: String,
    pub scratch_path: String,
    pub audio_extensions: Vec<String>,
    pub page_size: usize,
    pub max_pages: usize,
    pub yield_every: usize,
    pub artwork_debounce_ms: u64,
    pub derived_debounce_ms: u64,
    pub derived_throttle_ms: u64,
    pub tag_read_timeout_secs: u64,
    pub recent_limit: usize,
    pub top_artists_limit: usize,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            index_path: "library.redb".to_string(),
            artwork_path: "artwork".to_string(),
            scratch_path: "scratch".to_string(),
            audio_extensions: DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect(),
            page_size: 1000,
            max_pages: 100,
            yield_every: 500,
            artwork_debounce_ms: 100,
            derived_debounce_ms: 500,
            derived_throttle_ms: 2000,
            tag_read_timeout_secs: 10,
            recent_limit: 50,
            top_artists_limit: 10,
        }
    }
}

impl LibraryConfig {
    pub fn artwork_debounce(&self) -> Duration {
        Duration::from_millis(self.artwork_debounce_ms)
    }

    pub fn derived_debounce(&self) -> Duration {
        Duration::from_millis(self.derived_debounce_ms)
    }

    pub fn derived_throttle(&self) -> Duration {
        Duration::from_millis(self.derived_throttle_ms)
    }

    pub fn tag_read_timeout(&self) -> Duration {
        Duration::from_secs(self.tag_read_timeout_secs)
    }

    /// Makes paths relative to the config file absolute so the library can be
    /// opened from any working directory.
    pub fn resolved(mut self, config_path: &Path) -> Self {
        self.index_path = resolve_path(config_path, &self.index_path)
            .to_string_lossy()
            .into_owned();
        self.artwork_path = resolve_path(config_path, &self.artwork_path)
            .to_string_lossy()
            .into_owned();
        self.scratch_path = resolve_path(config_path, &self.scratch_path)
            .to_string_lossy()
            .into_owned();
        self
    }

    /// Replaces zero and empty values with defaults.
    fn normalize(&mut self) {
        let defaults = LibraryConfig::default();
        if self.version < CONFIG_VERSION {
            self.version = CONFIG_VERSION;
        }
        if self.index_path.trim().is_empty() {
            self.index_path = defaults.index_path;
        }
        if self.artwork_path.trim().is_empty() {
            self.artwork_path = defaults.artwork_path;
        }
        if self.scratch_path.trim().is_empty() {
            self.scratch_path = defaults.scratch_path;
        }
        self.audio_extensions = self
            .audio_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        if self.audio_extensions.is_empty() {
            self.audio_extensions = defaults.audio_extensions;
        }
        if self.page_size == 0 {
            self.page_size = defaults.page_size;
        }
        if self.max_pages == 0 {
            self.max_pages = defaults.max_pages;
        }
        if self.yield_every == 0 {
            self.yield_every = defaults.yield_every;
        }
        if self.tag_read_timeout_secs == 0 {
            self.tag_read_timeout_secs = defaults.tag_read_timeout_secs;
        }
        if self.recent_limit == 0 {
            self.recent_limit = defaults.recent_limit;
        }
        if self.top_artists_limit == 0 {
            self.top_artists_limit = defaults.top_artists_limit;
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("LIBRARY_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("library.yaml"))
            .unwrap_or_else(|| PathBuf::from("library.yaml")),
        Err(_) => PathBuf::from("library.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(LibraryConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: LibraryConfig = if contents.trim().is_empty() {
            LibraryConfig::default()
        } else {
            serde_yaml::from_str(&contents)?
        };
        config.normalize();
        return Ok((config, false));
    }

    let config = LibraryConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &LibraryConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn first_run_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("library.yaml");
        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.page_size, 1000);

        let (again, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(again.yield_every, config.yield_every);
    }

    #[test]
    fn zero_and_empty_values_are_normalized() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("library.yaml");
        fs::write(
            &path,
            "page_size: 0\nyield_every: 0\nindex_path: \"\"\naudio_extensions: [\" .MP3 \", \"\"]\n",
        )
        .unwrap();
        let (config, _) = load_or_create_config(&path).unwrap();
        assert_eq!(config.page_size, 1000);
        assert_eq!(config.yield_every, 500);
        assert_eq!(config.index_path, "library.redb");
        assert_eq!(config.audio_extensions, vec!["mp3".to_string()]);
        // untouched keys keep their defaults
        assert_eq!(config.artwork_debounce_ms, 100);
    }

    #[test]
    fn relative_paths_resolve_next_to_config() {
        let config_path = Path::new("/etc/music/library.yaml");
        assert_eq!(
            resolve_path(config_path, "library.redb"),
            PathBuf::from("/etc/music/library.redb")
        );
        assert_eq!(resolve_path(config_path, "/var/art"), PathBuf::from("/var/art"));
        assert_eq!(
            resolve_path(Path::new("library.yaml"), "art"),
            PathBuf::from("./art")
        );

        let resolved = LibraryConfig::default().resolved(config_path);
        assert_eq!(resolved.artwork_path, "/etc/music/artwork");
    }
}
