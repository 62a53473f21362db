/// Coarse storage location label for a device path, e.g.
/// `"Internal > Music"` or `"SD Card > Podcasts"`.
///
/// Returns `None` when the path is too short to say anything useful.
pub fn classify_folder(uri: &str) -> Option<String> {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    let parts: Vec<&str> = path.split('/').collect();
    let last = parts.len().checked_sub(1)?;

    let Some(storage_idx) = parts.iter().position(|part| *part == "storage") else {
        if last == 0 {
            return None;
        }
        let parent = parts[last - 1];
        if parent.is_empty() {
            return None;
        }
        return Some(format!("Unknown > {}", parent));
    };

    let (volume, folder_idx) = if parts.get(storage_idx + 1) == Some(&"emulated") {
        ("Internal", storage_idx + 3)
    } else {
        ("SD Card", storage_idx + 2)
    };

    if folder_idx > last {
        return None;
    }
    if folder_idx == last {
        return Some(format!("{} > Root", volume));
    }
    Some(format!("{} > {}", volume, parts[folder_idx]))
}

#[cfg(test)]
mod tests {
    use super::classify_folder;

    #[test]
    fn internal_storage() {
        assert_eq!(
            classify_folder("/storage/emulated/0/Music/song.mp3").as_deref(),
            Some("Internal > Music")
        );
        assert_eq!(
            classify_folder("/storage/emulated/0/Download/sub/song.mp3").as_deref(),
            Some("Internal > Download")
        );
    }

    #[test]
    fn internal_root_file() {
        assert_eq!(
            classify_folder("/storage/emulated/0/song.mp3").as_deref(),
            Some("Internal > Root")
        );
    }

    #[test]
    fn sd_card() {
        assert_eq!(
            classify_folder("/storage/1234-ABCD/Music/song.mp3").as_deref(),
            Some("SD Card > Music")
        );
        assert_eq!(
            classify_folder("file:///storage/1234-ABCD/Podcasts/ep.mp3").as_deref(),
            Some("SD Card > Podcasts")
        );
    }

    #[test]
    fn unknown_volume_uses_parent() {
        assert_eq!(
            classify_folder("/home/me/Albums/song.flac").as_deref(),
            Some("Unknown > Albums")
        );
    }

    #[test]
    fn too_short_paths() {
        assert_eq!(classify_folder("song.mp3"), None);
        assert_eq!(classify_folder("/song.mp3"), None);
        assert_eq!(classify_folder("/storage/emulated"), None);
    }

    #[test]
    fn deterministic() {
        let uri = "/storage/emulated/0/Music/song.mp3";
        assert_eq!(classify_folder(uri), classify_folder(uri));
    }
}
