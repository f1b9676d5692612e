use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Fallback name for artifacts whose advertised file name sanitises away
/// to nothing.
const FALLBACK_NAME: &str = "received.bin";

/// Strips a peer-supplied file name down to something safe to create in
/// the receive directory: no path separators, no parent-directory
/// components, no control characters, no leading dots.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(name);

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim_start_matches('.')
        .trim()
        .to_string();

    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Picks a path in `dir` for `name` that does not collide with an
/// existing file, appending ` (1)`, ` (2)`, … before the extension.
async fn unique_target(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    };

    for n in 1u32.. {
        let renamed = match &ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(renamed);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
    }
    unreachable!("u32 collision counter exhausted");
}

/// Writes a received artifact into `dir` under (a sanitised form of)
/// `name`, renaming on collision.
///
/// The bytes go to a `.part` temp file first and are renamed into place
/// only once fully written, so a crash mid-write never leaves a
/// plausible-looking partial file.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or the rename
/// fails.
pub async fn write_received(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let safe_name = sanitize_filename(name);
    let target = unique_target(dir, &safe_name).await;

    let part = {
        let mut os = target.clone().into_os_string();
        os.push(".part");
        PathBuf::from(os)
    };
    tokio::fs::write(&part, bytes)
        .await
        .with_context(|| format!("failed to write {}", part.display()))?;
    tokio::fs::rename(&part, &target)
        .await
        .with_context(|| format!("failed to move {} into place", part.display()))?;

    debug!(path = %target.display(), size = bytes.len(), "Artifact written");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Given a plain file name, when sanitised, then it is unchanged.
    #[test]
    fn given_plain_name_when_sanitized_then_unchanged() {
        assert_eq!(sanitize_filename("photo.jpg"), "photo.jpg");
    }

    /// Given a name with path components, when sanitised, then only the final component survives.
    #[test]
    fn given_path_traversal_when_sanitized_then_only_basename_survives() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\foo\\doc.pdf"), "doc.pdf");
    }

    /// Given a hidden-file name, when sanitised, then the leading dots are stripped.
    #[test]
    fn given_dotfile_name_when_sanitized_then_leading_dots_stripped() {
        assert_eq!(sanitize_filename(".bashrc"), "bashrc");
    }

    /// Given a name that sanitises to nothing, when sanitised, then the fallback name is used.
    #[test]
    fn given_empty_name_when_sanitized_then_fallback_used() {
        assert_eq!(sanitize_filename(""), FALLBACK_NAME);
        assert_eq!(sanitize_filename("..."), FALLBACK_NAME);
        assert_eq!(sanitize_filename("a/"), FALLBACK_NAME);
    }

    /// Given an empty directory, when an artifact is written, then the file appears with the right bytes.
    #[tokio::test]
    async fn given_fresh_dir_when_written_then_file_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_received(dir.path(), "data.bin", b"abc123").await.unwrap();
        assert_eq!(path, dir.path().join("data.bin"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"abc123");
    }

    /// Given an existing file of the same name, when written again, then a " (1)" suffix is used.
    #[tokio::test]
    async fn given_existing_file_when_written_then_collision_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_received(dir.path(), "report.pdf", b"one").await.unwrap();
        let second = write_received(dir.path(), "report.pdf", b"two").await.unwrap();
        assert_eq!(first, dir.path().join("report.pdf"));
        assert_eq!(second, dir.path().join("report (1).pdf"));
        assert_eq!(tokio::fs::read(&second).await.unwrap(), b"two");
    }

    /// Given repeated collisions, when written, then the counter keeps incrementing.
    #[tokio::test]
    async fn given_repeated_collisions_when_written_then_counter_increments() {
        let dir = tempfile::tempdir().unwrap();
        write_received(dir.path(), "notes", b"a").await.unwrap();
        write_received(dir.path(), "notes", b"b").await.unwrap();
        let third = write_received(dir.path(), "notes", b"c").await.unwrap();
        assert_eq!(third, dir.path().join("notes (2)"));
    }

    /// Given a write, when it completes, then no .part temp file is left behind.
    #[tokio::test]
    async fn given_completed_write_when_dir_listed_then_no_part_file_remains() {
        let dir = tempfile::tempdir().unwrap();
        write_received(dir.path(), "x.txt", b"done").await.unwrap();
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names, vec!["x.txt"]);
    }
}
