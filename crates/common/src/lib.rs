use serde::{Deserialize, Serialize};

mod filename;
mod folder;

pub use filename::{filename_stem, parse_filename, ParsedFilename};
pub use folder::classify_folder;

pub const UNKNOWN_ARTIST: &str = "Unknown Artist";
pub const UNKNOWN_ALBUM: &str = "Unknown Album";
pub const UNKNOWN_GENRE: &str = "Unknown Genre";

/// How far a track has progressed through enrichment.
///
/// Variants are ordered; a stored status only ever moves to a greater one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    #[default]
    Pending,
    Failed,
    Cached,
    Enhanced,
    Success,
}

impl ScanStatus {
    pub fn advance(self, next: ScanStatus) -> ScanStatus {
        self.max(next)
    }

    pub fn is_pending(self) -> bool {
        self == ScanStatus::Pending
    }
}

/// Scanned facts for one device asset, as kept in the track store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackRecord {
    pub id: String,
    pub filename: String,
    pub uri: String,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub date_added: i64,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub album_id: Option<String>,
    pub cover_image: Option<String>,
    pub scan_status: ScanStatus,
    pub folder: Option<String>,
}

/// Fields a user explicitly changed for one track.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackOverlay {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image: Option<String>,
}

impl TrackOverlay {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.genre.is_none()
            && self.year.is_none()
            && self.cover_image.is_none()
    }

    /// Folds `updates` into this overlay; fields set in `updates` win.
    pub fn merge(&mut self, updates: TrackOverlay) {
        if updates.title.is_some() {
            self.title = updates.title;
        }
        if updates.artist.is_some() {
            self.artist = updates.artist;
        }
        if updates.album.is_some() {
            self.album = updates.album;
        }
        if updates.genre.is_some() {
            self.genre = updates.genre;
        }
        if updates.year.is_some() {
            self.year = updates.year;
        }
        if updates.cover_image.is_some() {
            self.cover_image = updates.cover_image;
        }
    }

    pub fn apply_to(&self, song: &mut Song) {
        if let Some(title) = &self.title {
            song.title = title.clone();
        }
        if let Some(artist) = &self.artist {
            song.artist = artist.clone();
        }
        if let Some(album) = &self.album {
            song.album = Some(album.clone());
        }
        if let Some(genre) = &self.genre {
            song.genre = Some(genre.clone());
        }
        if let Some(year) = self.year {
            song.year = Some(year);
        }
        if let Some(cover) = &self.cover_image {
            song.cover_image = Some(cover.clone());
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayStats {
    pub play_count: u32,
    pub last_played: Option<i64>,
    pub play_history: Vec<i64>,
}

impl PlayStats {
    /// Appends a play at `now_ms`. History stays non-decreasing even if the
    /// clock steps backwards, and `play_count` always equals its length.
    pub fn record_play(&mut self, now_ms: i64) -> i64 {
        let at = match self.play_history.last() {
            Some(last) if *last > now_ms => *last,
            _ => now_ms,
        };
        self.play_history.push(at);
        self.play_count = self.play_history.len().min(u32::MAX as usize) as u32;
        self.last_played = Some(at);
        at
    }

    pub fn apply_to(&self, song: &mut Song) {
        song.play_count = self.play_count;
        song.last_played = self.last_played;
        song.play_history = self.play_history.clone();
    }
}

/// Merged view of a track: scanned facts with user edits and play stats
/// layered on top.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub id: String,
    pub filename: String,
    pub uri: String,
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub date_added: i64,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub album_id: Option<String>,
    #[serde(default)]
    pub cover_image: Option<String>,
    #[serde(default)]
    pub scan_status: ScanStatus,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub play_count: u32,
    #[serde(default)]
    pub last_played: Option<i64>,
    #[serde(default)]
    pub play_history: Vec<i64>,
}

impl Song {
    pub fn from_record(record: TrackRecord) -> Self {
        Self {
            id: record.id,
            filename: record.filename,
            uri: record.uri,
            duration_ms: record.duration_ms,
            date_added: record.date_added,
            title: record.title,
            artist: record.artist,
            album: record.album,
            year: record.year,
            genre: record.genre,
            album_id: record.album_id,
            cover_image: record.cover_image,
            scan_status: record.scan_status,
            folder: record.folder,
            play_count: 0,
            last_played: None,
            play_history: Vec::new(),
        }
    }

    pub fn to_record(&self) -> TrackRecord {
        TrackRecord {
            id: self.id.clone(),
            filename: self.filename.clone(),
            uri: self.uri.clone(),
            duration_ms: self.duration_ms,
            date_added: self.date_added,
            title: self.title.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
            year: self.year,
            genre: self.genre.clone(),
            album_id: self.album_id.clone(),
            cover_image: self.cover_image.clone(),
            scan_status: self.scan_status,
            folder: self.folder.clone(),
        }
    }

    /// True when the merged facts still carry placeholders or the title is
    /// just the filename, i.e. a deep tag read is likely to improve them.
    pub fn looks_suspicious(&self) -> bool {
        let placeholder = |value: Option<&str>, sentinel: &str| match value {
            Some(value) => {
                let trimmed = value.trim();
                trimmed.is_empty() || trimmed.eq_ignore_ascii_case(sentinel)
            }
            None => true,
        };
        placeholder(Some(self.artist.as_str()), UNKNOWN_ARTIST)
            || placeholder(self.album.as_deref(), UNKNOWN_ALBUM)
            || placeholder(self.genre.as_deref(), UNKNOWN_GENRE)
            || self.title == self.filename
            || self.title == filename_stem(&self.filename)
    }
}

/// A song copied into a playlist at the moment it was added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistSong {
    #[serde(flatten)]
    pub song: Song,
    pub added_at: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playlist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub songs: Vec<PlaylistSong>,
    pub created_at: i64,
    #[serde(default)]
    pub is_favorite: bool,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> TrackRecord {
        TrackRecord {
            id: id.to_string(),
            filename: "01 - Band - Song.mp3".to_string(),
            uri: format!("/storage/emulated/0/Music/{}.mp3", id),
            duration_ms: 180_000,
            date_added: 1_700_000_000_000,
            title: "Song".to_string(),
            artist: "Band".to_string(),
            album: Some("Record".to_string()),
            year: Some(2001),
            genre: Some("Rock".to_string()),
            album_id: None,
            cover_image: None,
            scan_status: ScanStatus::Pending,
            folder: Some("Internal > Music".to_string()),
        }
    }

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("/storage/emulated/0/Music/Track.mp3");
        let second = stable_id("/storage/emulated/0/Music/Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("/storage/emulated/0/Music/Track2.mp3"));
    }

    #[test]
    fn status_only_advances() {
        assert_eq!(ScanStatus::Pending.advance(ScanStatus::Cached), ScanStatus::Cached);
        assert_eq!(ScanStatus::Enhanced.advance(ScanStatus::Cached), ScanStatus::Enhanced);
        assert_eq!(ScanStatus::Enhanced.advance(ScanStatus::Pending), ScanStatus::Enhanced);
        assert!(ScanStatus::Failed > ScanStatus::Pending);
        assert!(ScanStatus::Cached > ScanStatus::Failed);
    }

    #[test]
    fn record_play_keeps_count_in_sync() {
        let mut stats = PlayStats::default();
        stats.record_play(100);
        stats.record_play(50);
        stats.record_play(200);
        assert_eq!(stats.play_count, 3);
        assert_eq!(stats.play_history, vec![100, 100, 200]);
        assert_eq!(stats.last_played, Some(200));
    }

    #[test]
    fn overlay_merge_keeps_untouched_fields() {
        let mut overlay = TrackOverlay {
            title: Some("Custom".to_string()),
            ..TrackOverlay::default()
        };
        overlay.merge(TrackOverlay {
            genre: Some("Jazz".to_string()),
            ..TrackOverlay::default()
        });
        assert_eq!(overlay.title.as_deref(), Some("Custom"));
        assert_eq!(overlay.genre.as_deref(), Some("Jazz"));
        assert!(overlay.artist.is_none());
    }

    #[test]
    fn song_record_conversion_drops_stats_only() {
        let original = record("a");
        let mut song = Song::from_record(original.clone());
        song.play_count = 4;
        assert_eq!(song.to_record(), original);
    }

    #[test]
    fn suspicious_detection() {
        let song = Song::from_record(record("a"));
        assert!(!song.looks_suspicious());

        let mut placeholder = song.clone();
        placeholder.artist = UNKNOWN_ARTIST.to_string();
        assert!(placeholder.looks_suspicious());

        let mut no_album = song.clone();
        no_album.album = None;
        assert!(no_album.looks_suspicious());

        let mut filename_title = song;
        filename_title.title = "01 - Band - Song".to_string();
        assert!(filename_title.looks_suspicious());
    }

    #[test]
    fn json_uses_camel_case_keys() {
        let mut stats = PlayStats::default();
        stats.record_play(10);
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["playCount"], 1);
        assert_eq!(value["playHistory"][0], 10);

        let overlay = TrackOverlay {
            cover_image: Some("/art.jpg".to_string()),
            ..TrackOverlay::default()
        };
        let value = serde_json::to_value(&overlay).unwrap();
        assert_eq!(value["coverImage"], "/art.jpg");
        assert!(value.get("title").is_none());
    }

    #[test]
    fn playlist_song_flattens_snapshot() {
        let entry = PlaylistSong {
            song: Song::from_record(record("a")),
            added_at: 42,
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["addedAt"], 42);
        let back: PlaylistSong = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }
}
