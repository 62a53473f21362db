use crate::UNKNOWN_ARTIST;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFilename {
    pub title: String,
    pub artist: String,
}

/// Best-guess title and artist from a raw filename such as
/// `"03 - Artist - Title.mp3"`. Never fails; unknown parts fall back to
/// placeholders.
pub fn parse_filename(filename: &str) -> ParsedFilename {
    let cleaned = filename_stem(filename);
    let name = strip_track_number(cleaned).trim();

    let split = name
        .split_once(" - ")
        .or_else(|| name.split_once('-'))
        .or_else(|| name.split_once('_'));

    let (artist, title) = match split {
        Some((artist, title)) => (artist.trim(), title.trim()),
        None => ("", name),
    };

    let title = if title.is_empty() {
        cleaned.trim().to_string()
    } else {
        title.to_string()
    };
    let artist = if artist.is_empty() {
        UNKNOWN_ARTIST.to_string()
    } else {
        artist.to_string()
    };

    ParsedFilename { title, artist }
}

/// Filename without its final extension.
pub fn filename_stem(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(idx) => {
            let ext = &filename[idx + 1..];
            if ext.is_empty() || ext.contains('/') {
                filename
            } else {
                &filename[..idx]
            }
        }
        None => filename,
    }
}

/// Drops a leading `\d+[.\-\s_]+` prefix.
fn strip_track_number(name: &str) -> &str {
    let digits = name.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return name;
    }
    let rest = &name[digits..];
    let separators = rest
        .chars()
        .take_while(|c| matches!(c, '.' | '-' | '_') || c.is_whitespace())
        .map(char::len_utf8)
        .sum::<usize>();
    if separators == 0 {
        return name;
    }
    &rest[separators..]
}

#[cfg(test)]
mod tests {
    use super::{filename_stem, parse_filename};
    use crate::UNKNOWN_ARTIST;

    #[test]
    fn numbered_artist_title() {
        let parsed = parse_filename("01 - Artist - Title.mp3");
        assert_eq!(parsed.artist, "Artist");
        assert_eq!(parsed.title, "Title");
    }

    #[test]
    fn no_separator_uses_placeholder_artist() {
        let parsed = parse_filename("NoSeparatorTrack.mp3");
        assert_eq!(parsed.title, "NoSeparatorTrack");
        assert_eq!(parsed.artist, UNKNOWN_ARTIST);
    }

    #[test]
    fn falls_back_to_dash_then_underscore() {
        let parsed = parse_filename("Artist-Title.flac");
        assert_eq!(parsed.artist, "Artist");
        assert_eq!(parsed.title, "Title");

        let parsed = parse_filename("Artist_Some Title.ogg");
        assert_eq!(parsed.artist, "Artist");
        assert_eq!(parsed.title, "Some Title");
    }

    #[test]
    fn spaced_dash_wins_over_inner_dash() {
        let parsed = parse_filename("Jay-Z - Song.mp3");
        assert_eq!(parsed.artist, "Jay-Z");
        assert_eq!(parsed.title, "Song");
    }

    #[test]
    fn track_number_prefix_variants() {
        assert_eq!(parse_filename("07. Title.mp3").title, "Title");
        assert_eq!(parse_filename("12_Title.mp3").title, "Title");
        // digits without a separator are part of the name
        assert_eq!(parse_filename("1999.mp3").title, "1999");
    }

    #[test]
    fn empty_title_falls_back_to_cleaned_name() {
        let parsed = parse_filename("Artist - .mp3");
        assert_eq!(parsed.artist, "Artist");
        assert_eq!(parsed.title, "Artist -");
    }

    #[test]
    fn stem_only_strips_final_extension() {
        assert_eq!(filename_stem("a.b.mp3"), "a.b");
        assert_eq!(filename_stem("noext"), "noext");
        assert_eq!(filename_stem("trailing."), "trailing.");
    }
}
