use std::collections::HashMap;

use common::{Song, UNKNOWN_ARTIST};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtistPlays {
    pub name: String,
    pub play_count: u64,
    pub song_count: usize,
}

/// Lists recomputed from the merged song list and cached for instant display
/// on the next launch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DerivedStats {
    pub recently_played: Vec<Song>,
    pub recently_added: Vec<Song>,
    pub never_played: Vec<Song>,
    pub top_artists: Vec<ArtistPlays>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DerivedLimits {
    pub recent: usize,
    pub top_artists: usize,
}

impl DerivedStats {
    pub fn is_empty(&self) -> bool {
        self.recently_played.is_empty()
            && self.recently_added.is_empty()
            && self.never_played.is_empty()
            && self.top_artists.is_empty()
    }

    /// Applies `update` to every cached copy of `id`.
    pub fn patch_song(&mut self, id: &str, update: impl Fn(&mut Song)) {
        for list in [
            &mut self.recently_played,
            &mut self.recently_added,
            &mut self.never_played,
        ] {
            for song in list.iter_mut().filter(|song| song.id == id) {
                update(song);
            }
        }
    }
}

pub fn compute_derived(songs: &[Song], limits: DerivedLimits) -> DerivedStats {
    let mut recently_played: Vec<Song> = songs
        .iter()
        .filter(|song| song.last_played.is_some())
        .cloned()
        .collect();
    recently_played.sort_by(|a, b| {
        b.last_played
            .cmp(&a.last_played)
            .then_with(|| a.id.cmp(&b.id))
    });
    recently_played.truncate(limits.recent);

    let mut recently_added: Vec<Song> = songs.to_vec();
    sort_by_date_added(&mut recently_added);
    recently_added.truncate(limits.recent);

    let mut never_played: Vec<Song> = songs
        .iter()
        .filter(|song| song.play_count == 0)
        .cloned()
        .collect();
    sort_by_date_added(&mut never_played);
    never_played.truncate(limits.recent);

    DerivedStats {
        recently_played,
        recently_added,
        never_played,
        top_artists: top_artists(songs, limits.top_artists),
    }
}

fn top_artists(songs: &[Song], limit: usize) -> Vec<ArtistPlays> {
    let mut by_artist: HashMap<&str, ArtistPlays> = HashMap::new();
    for song in songs {
        let name = song.artist.trim();
        if name.is_empty() || name.eq_ignore_ascii_case(UNKNOWN_ARTIST) {
            continue;
        }
        let entry = by_artist.entry(name).or_insert_with(|| ArtistPlays {
            name: name.to_string(),
            play_count: 0,
            song_count: 0,
        });
        entry.play_count += u64::from(song.play_count);
        entry.song_count += 1;
    }
    let mut artists: Vec<ArtistPlays> = by_artist
        .into_values()
        .filter(|artist| artist.play_count > 0)
        .collect();
    artists.sort_by(|a, b| {
        b.play_count
            .cmp(&a.play_count)
            .then_with(|| b.song_count.cmp(&a.song_count))
            .then_with(|| a.name.cmp(&b.name))
    });
    artists.truncate(limit);
    artists
}

fn sort_by_date_added(songs: &mut [Song]) {
    songs.sort_by(|a, b| {
        b.date_added
            .cmp(&a.date_added)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ScanStatus, TrackRecord};

    fn song(id: &str, artist: &str, date_added: i64, plays: &[i64]) -> Song {
        let mut song = Song::from_record(TrackRecord {
            id: id.to_string(),
            filename: format!("{}.mp3", id),
            uri: format!("/music/{}.mp3", id),
            duration_ms: 1000,
            date_added,
            title: id.to_string(),
            artist: artist.to_string(),
            album: None,
            year: None,
            genre: None,
            album_id: None,
            cover_image: None,
            scan_status: ScanStatus::Pending,
            folder: None,
        });
        song.play_history = plays.to_vec();
        song.play_count = plays.len() as u32;
        song.last_played = plays.last().copied();
        song
    }

    const LIMITS: DerivedLimits = DerivedLimits {
        recent: 2,
        top_artists: 5,
    };

    #[test]
    fn recent_lists_are_ordered_and_capped() {
        let songs = vec![
            song("a", "X", 10, &[5]),
            song("b", "X", 30, &[]),
            song("c", "Y", 20, &[1, 9]),
            song("d", "Y", 40, &[]),
        ];
        let derived = compute_derived(&songs, LIMITS);
        let ids = |list: &[Song]| list.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&derived.recently_played), vec!["c", "a"]);
        assert_eq!(ids(&derived.recently_added), vec!["d", "b"]);
        assert_eq!(ids(&derived.never_played), vec!["d", "b"]);
    }

    #[test]
    fn top_artists_sum_plays_and_skip_placeholders() {
        let songs = vec![
            song("a", "X", 1, &[1]),
            song("b", "X", 2, &[2]),
            song("c", "Y", 3, &[1, 2, 3]),
            song("d", UNKNOWN_ARTIST, 4, &[1, 2, 3, 4]),
            song("e", "Z", 5, &[]),
        ];
        let derived = compute_derived(&songs, LIMITS);
        assert_eq!(
            derived.top_artists,
            vec![
                ArtistPlays {
                    name: "Y".to_string(),
                    play_count: 3,
                    song_count: 1
                },
                ArtistPlays {
                    name: "X".to_string(),
                    play_count: 2,
                    song_count: 2
                },
            ]
        );
    }

    #[test]
    fn empty_library_yields_empty_stats() {
        assert!(compute_derived(&[], LIMITS).is_empty());
    }

    #[test]
    fn patch_song_touches_every_copy() {
        let songs = vec![song("a", "X", 1, &[])];
        let mut derived = compute_derived(&songs, LIMITS);
        derived.patch_song("a", |song| song.title = "Custom".to_string());
        assert_eq!(derived.recently_added[0].title, "Custom");
        assert_eq!(derived.never_played[0].title, "Custom");
    }
}
