use std::collections::HashMap;

use common::{PlayStats, Song, TrackOverlay};

/// Layers play stats and then user edits over scanned songs. Entries without
/// an id are dropped; ids missing from either map are left untouched.
pub fn merge_song_data(
    raw: Vec<Song>,
    overlay: &HashMap<String, TrackOverlay>,
    stats: &HashMap<String, PlayStats>,
) -> Vec<Song> {
    raw.into_iter()
        .filter(|song| !song.id.is_empty())
        .map(|song| merge_one(song, overlay, stats))
        .collect()
}

pub fn merge_one(
    mut song: Song,
    overlay: &HashMap<String, TrackOverlay>,
    stats: &HashMap<String, PlayStats>,
) -> Song {
    if let Some(entry) = stats.get(&song.id) {
        entry.apply_to(&mut song);
    }
    if let Some(entry) = overlay.get(&song.id) {
        entry.apply_to(&mut song);
    }
    song
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ScanStatus, TrackRecord};

    fn song(id: &str) -> Song {
        Song::from_record(TrackRecord {
            id: id.to_string(),
            filename: format!("{}.mp3", id),
            uri: format!("/music/{}.mp3", id),
            duration_ms: 1000,
            date_added: 1,
            title: "Scanned".to_string(),
            artist: "Scanned Artist".to_string(),
            album: Some("Scanned Album".to_string()),
            year: Some(1999),
            genre: None,
            album_id: None,
            cover_image: None,
            scan_status: ScanStatus::Pending,
            folder: None,
        })
    }

    #[test]
    fn overlay_fields_win_and_absent_fields_fall_through() {
        let mut overlay = HashMap::new();
        overlay.insert(
            "a".to_string(),
            TrackOverlay {
                title: Some("Custom".to_string()),
                genre: Some("Jazz".to_string()),
                ..TrackOverlay::default()
            },
        );
        let merged = merge_song_data(vec![song("a")], &overlay, &HashMap::new());
        assert_eq!(merged[0].title, "Custom");
        assert_eq!(merged[0].genre.as_deref(), Some("Jazz"));
        assert_eq!(merged[0].artist, "Scanned Artist");
        assert_eq!(merged[0].year, Some(1999));
    }

    #[test]
    fn stats_are_applied() {
        let mut stats = HashMap::new();
        let mut entry = PlayStats::default();
        entry.record_play(10);
        entry.record_play(20);
        stats.insert("a".to_string(), entry);

        let merged = merge_song_data(vec![song("a"), song("b")], &HashMap::new(), &stats);
        assert_eq!(merged[0].play_count, 2);
        assert_eq!(merged[0].last_played, Some(20));
        assert_eq!(merged[1].play_count, 0);
    }

    #[test]
    fn entries_without_id_are_dropped() {
        let merged = merge_song_data(vec![song(""), song("a")], &HashMap::new(), &HashMap::new());
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, "a");
    }

    #[test]
    fn empty_overlay_entry_is_identity() {
        let mut overlay = HashMap::new();
        overlay.insert("a".to_string(), TrackOverlay::default());
        let merged = merge_song_data(vec![song("a")], &overlay, &HashMap::new());
        assert_eq!(merged[0], song("a"));
    }
}
