//! Sequence counter recovery from thumbnail artifacts

use std::path::Path;

use tracing::{debug, warn};

/// Highest sequence number among thumbnails next to `example`.
///
/// Thumbnails are named `<anything>.<type><digits>.th.jpg`; only type letters contained in
/// `type_chars` are considered. A missing or unreadable directory counts as no matches. The
/// caller adds one to obtain the next value.
pub fn recover_count(example: &Path, type_chars: &str) -> u32 {
    let dir = match example.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan {:?} for existing artifacts: {}", dir, e);
            return 0;
        }
    };

    let mut max = 0;
    for entry in entries.flatten() {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some((kind, n)) = parse_thumbnail_name(name) {
            if type_chars.contains(kind) {
                max = max.max(n);
            }
        }
    }

    debug!("Recovered count {} for types {:?} in {:?}", max, type_chars, dir);
    max
}

/// Split `<anything>.<type><digits>.th.jpg` into its type letter and number.
fn parse_thumbnail_name(name: &str) -> Option<(char, u32)> {
    let stem = name.strip_suffix(".th.jpg")?;
    let (_, tag) = stem.rsplit_once('.')?;
    let mut chars = tag.chars();
    let kind = chars.next()?;
    if !matches!(kind, 't' | 'i' | 'v') {
        return None;
    }
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((kind, digits.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_recover_max_over_allowed_types() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "foo.i3.th.jpg");
        touch(dir.path(), "foo.i9.th.jpg");
        touch(dir.path(), "foo.t2.th.jpg");
        touch(dir.path(), "bar.v14.th.jpg");

        let example = dir.path().join("im_1.jpg");
        assert_eq!(recover_count(&example, "it"), 9);
        assert_eq!(recover_count(&example, "t"), 2);
        assert_eq!(recover_count(&example, "v"), 14);
    }

    #[test]
    fn test_recover_ignores_non_matching_names() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "foo.i.th.jpg");
        touch(dir.path(), "foo.x5.th.jpg");
        touch(dir.path(), "foo.i5.jpg");
        touch(dir.path(), "foo.i5a.th.jpg");
        fs::create_dir(dir.path().join("dir.i99.th.jpg")).unwrap();

        assert_eq!(recover_count(&dir.path().join("im.jpg"), "it"), 0);
    }

    #[test]
    fn test_missing_directory_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let example = dir.path().join("missing").join("im.jpg");
        assert_eq!(recover_count(&example, "itv"), 0);
    }

    #[test]
    fn test_parse_thumbnail_name() {
        assert_eq!(parse_thumbnail_name("a.b.v7.th.jpg"), Some(('v', 7)));
        assert_eq!(parse_thumbnail_name("v7.th.jpg"), None);
    }
}
