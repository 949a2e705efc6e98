//! Filesystem helpers shared by the read and write paths.
//!
//! The central piece is [`FileSwap`]: a live file is replaced by writing the
//! new bytes to a temp file in the same directory and renaming it into place,
//! with a backup copy of the previous content kept until the caller either
//! commits or rolls back. The live path is never observed missing or
//! half-written.

use anyhow::{Context, Result};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_SUFFIX: &str = "oiwi-tmp";
const BACKUP_SUFFIX: &str = "oiwi-bak";

/// Windows device names that cannot be used as a file stem.
const RESERVED_STEMS: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const INVALID_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Consume a fallible side effect whose failure must not abort the caller.
///
/// The failure is logged at `warn` and turned into `None`.
pub trait BestEffort<T> {
    fn best_effort(self, what: &str) -> Option<T>;
}

impl<T, E: Display> BestEffort<T> for std::result::Result<T, E> {
    fn best_effort(self, what: &str) -> Option<T> {
        match self {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{} failed (ignored): {:#}", what, e);
                None
            }
        }
    }
}

/// Normalise a root-relative path: `/` separators, no empty or `.` segments,
/// no leading slash. `..` segments are kept so that traversal checks still see
/// them.
pub fn normalize_relative_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|seg| !seg.is_empty() && *seg != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a root-relative path onto `root`, refusing anything that could leave
/// it: `..` segments and drive or UNC prefixes. This is a lexical check for
/// paths that may not exist yet; existing files are resolved through
/// canonicalisation by the catalog.
pub fn safe_join(root: &Path, relative: &str) -> Option<PathBuf> {
    let rel = normalize_relative_path(relative);
    if rel.is_empty() || rel.split('/').any(|seg| seg == ".." || seg.contains(':')) {
        return None;
    }
    Some(rel.split('/').fold(root.to_path_buf(), |p, seg| p.join(seg)))
}

/// Case-insensitive comparison of two relative paths after normalisation.
/// Document roots commonly live on Windows shares.
pub fn same_relative_path(a: &str, b: &str) -> bool {
    normalize_relative_path(a).to_lowercase() == normalize_relative_path(b).to_lowercase()
}

/// Reduce a user-supplied file name to a safe single path component.
///
/// Directory parts are dropped, invalid characters removed, the extension is
/// lower-cased. Returns `None` when nothing usable is left.
pub fn sanitize_file_name(original: &str) -> Option<String> {
    let last = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original);

    let cleaned: String = last
        .chars()
        .filter(|c| !INVALID_NAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    let (stem, ext) = match cleaned.rsplit_once('.') {
        Some((stem, ext)) if !ext.trim().is_empty() => (stem, Some(ext.trim())),
        _ => (cleaned.as_str(), None),
    };
    let stem = stem.trim_matches(['.', ' ']);

    if stem.is_empty() {
        return None;
    }

    let stem = if RESERVED_STEMS
        .iter()
        .any(|r| r.eq_ignore_ascii_case(stem))
    {
        format!("_{}", stem)
    } else {
        stem.to_string()
    };

    Some(match ext {
        Some(ext) => format!("{}.{}", stem, ext.to_lowercase()),
        None => stem,
    })
}

/// Pick a name in `dir` that does not collide with an existing entry:
/// `name.pdf`, then `name (1).pdf`, `name (2).pdf`, ...
///
/// `keep` is treated as free even if present (the file being replaced).
pub async fn unique_file_name(dir: &Path, name: &str, keep: Option<&Path>) -> Result<String> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), format!(".{}", e)),
        _ => (name.to_string(), String::new()),
    };

    let mut candidate = name.to_string();
    let mut n = 1u32;
    loop {
        let path = dir.join(&candidate);
        let is_kept = keep.map(|k| k == path).unwrap_or(false);
        if is_kept || !fs::try_exists(&path).await? {
            return Ok(candidate);
        }
        candidate = format!("{} ({}){}", stem, n, ext);
        n += 1;
    }
}

/// True for the temp and backup files [`FileSwap`] leaves next to live files
/// while an operation is in flight.
pub fn is_transient_file(name: &str) -> bool {
    name.ends_with(TEMP_SUFFIX) || name.ends_with(BACKUP_SUFFIX)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{}.{}.{}", name, Uuid::new_v4().simple(), suffix))
}

/// New content for a [`FileSwap`].
pub enum SwapSource<'a> {
    Bytes(&'a [u8]),
    File(&'a Path),
}

/// An applied, not yet committed, replacement of one live file.
#[derive(Debug)]
pub struct FileSwap {
    destination: PathBuf,
    backup: Option<PathBuf>,
}

impl FileSwap {
    /// Replace `destination` with `source`.
    ///
    /// Steps: back up the occupied destination, write the new content to a
    /// temp file beside it, rename the temp file into place. Any failure
    /// restores the backup and removes the temp file before returning the
    /// error, so the destination keeps its previous content.
    pub async fn apply(destination: &Path, source: SwapSource<'_>) -> Result<FileSwap> {
        let dir = destination
            .parent()
            .context("destination has no parent directory")?;
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let backup = if fs::try_exists(destination).await? {
            let backup = sibling_with_suffix(destination, BACKUP_SUFFIX);
            fs::copy(destination, &backup).await.with_context(|| {
                format!("Failed to back up {}", destination.display())
            })?;
            Some(backup)
        } else {
            None
        };

        let swap = FileSwap {
            destination: destination.to_path_buf(),
            backup,
        };

        let temp = sibling_with_suffix(destination, TEMP_SUFFIX);
        let staged = async {
            match source {
                SwapSource::Bytes(bytes) => fs::write(&temp, bytes).await?,
                SwapSource::File(path) => {
                    fs::copy(path, &temp).await?;
                }
            }
            fs::rename(&temp, destination).await
        }
        .await;

        if let Err(e) = staged {
            if fs::try_exists(&temp).await.unwrap_or(false) {
                fs::remove_file(&temp)
                    .await
                    .best_effort("removing temp file");
            }
            swap.restore().await;
            return Err(e)
                .with_context(|| format!("Failed to replace {}", destination.display()));
        }

        debug!("replaced {}", destination.display());
        Ok(swap)
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Keep the new content and drop the backup.
    pub async fn commit(self) {
        if let Some(backup) = &self.backup {
            fs::remove_file(backup).await.best_effort("removing backup");
        }
    }

    /// Put the previous content back (or remove the file if there was none).
    pub async fn rollback(self) {
        self.restore().await;
    }

    async fn restore(&self) {
        match &self.backup {
            Some(backup) => {
                if let Err(e) = fs::rename(backup, &self.destination).await {
                    // The rename can fail across odd share setups; copy instead
                    // and keep the backup if even that fails.
                    warn!(
                        "restoring {} by rename failed: {}",
                        self.destination.display(),
                        e
                    );
                    if fs::copy(backup, &self.destination)
                        .await
                        .best_effort("restoring backup by copy")
                        .is_some()
                    {
                        fs::remove_file(backup).await.best_effort("removing backup");
                    }
                }
            }
            None => {
                if fs::try_exists(&self.destination).await.unwrap_or(false) {
                    fs::remove_file(&self.destination)
                        .await
                        .best_effort("removing newly created file");
                }
            }
        }
    }
}

/// Remove `dir` and then its parents up to (not including) `stop_at`, as long
/// as each is empty.
pub async fn remove_empty_dirs(dir: &Path, stop_at: &Path) {
    let mut current = Some(dir.to_path_buf());
    while let Some(d) = current {
        if d == stop_at || !d.starts_with(stop_at) {
            break;
        }
        if fs::remove_dir(&d).await.is_err() {
            // Not empty (or already gone); stop climbing.
            break;
        }
        debug!("removed empty directory {}", d.display());
        current = d.parent().map(Path::to_path_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_relative_path("\\OI-0001\\current\\a.pdf"), "OI-0001/current/a.pdf");
        assert_eq!(normalize_relative_path("./a//b/./c"), "a/b/c");
        assert_eq!(normalize_relative_path("../x"), "../x");
        assert_eq!(normalize_relative_path(""), "");
    }

    #[test]
    fn test_safe_join() {
        let root = Path::new("/srv/docs");
        assert_eq!(
            safe_join(root, "OI-0001\\current\\a.pdf"),
            Some(PathBuf::from("/srv/docs/OI-0001/current/a.pdf"))
        );
        assert_eq!(safe_join(root, "/a.pdf"), Some(PathBuf::from("/srv/docs/a.pdf")));
        assert_eq!(safe_join(root, "OI-0001/../../etc/passwd"), None);
        assert_eq!(safe_join(root, "C:/Windows/x"), None);
        assert_eq!(safe_join(root, ""), None);
    }

    #[test]
    fn test_same_relative_path() {
        assert!(same_relative_path("OI-0001/Current/A.pdf", "oi-0001\\current\\a.PDF"));
        assert!(!same_relative_path("a.pdf", "b.pdf"));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("Line 3  Press.PDF"), Some("Line 3 Press.pdf".into()));
        assert_eq!(sanitize_file_name("C:\\Users\\x\\doc?.pdf"), Some("doc.pdf".into()));
        assert_eq!(sanitize_file_name("../../etc/passwd"), Some("passwd".into()));
        assert_eq!(sanitize_file_name("con.pdf"), Some("_con.pdf".into()));
        assert_eq!(sanitize_file_name("noext"), Some("noext".into()));
        assert_eq!(sanitize_file_name("..."), None);
        assert_eq!(sanitize_file_name(".pdf"), None);
        assert_eq!(sanitize_file_name("???"), None);
    }

    #[test]
    fn test_is_transient_file() {
        let tmp = sibling_with_suffix(Path::new("/x/a.pdf"), TEMP_SUFFIX);
        let name = tmp.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(".a.pdf."));
        assert!(is_transient_file(&name));
        assert!(!is_transient_file("a.pdf"));
    }

    #[tokio::test]
    async fn test_unique_file_name() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        assert_eq!(unique_file_name(dir, "a.pdf", None).await.unwrap(), "a.pdf");

        std::fs::write(dir.join("a.pdf"), b"1").unwrap();
        assert_eq!(unique_file_name(dir, "a.pdf", None).await.unwrap(), "a (1).pdf");

        std::fs::write(dir.join("a (1).pdf"), b"2").unwrap();
        assert_eq!(unique_file_name(dir, "a.pdf", None).await.unwrap(), "a (2).pdf");

        let keep = dir.join("a.pdf");
        assert_eq!(
            unique_file_name(dir, "a.pdf", Some(&keep)).await.unwrap(),
            "a.pdf"
        );
    }

    #[tokio::test]
    async fn test_swap_commit_replaces_and_drops_backup() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("doc.pdf");
        std::fs::write(&dest, b"old").unwrap();

        let swap = FileSwap::apply(&dest, SwapSource::Bytes(b"new")).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");
        swap.commit().await;

        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["doc.pdf".to_string()]);
    }

    #[tokio::test]
    async fn test_swap_rollback_restores_previous_content() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("doc.pdf");
        std::fs::write(&dest, b"old").unwrap();

        let swap = FileSwap::apply(&dest, SwapSource::Bytes(b"new")).await.unwrap();
        swap.rollback().await;
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_swap_rollback_removes_new_file() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("sub").join("doc.pdf");

        let swap = FileSwap::apply(&dest, SwapSource::Bytes(b"new")).await.unwrap();
        assert!(dest.exists());
        swap.rollback().await;
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_swap_failure_keeps_destination() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("doc.pdf");
        std::fs::write(&dest, b"old").unwrap();

        let missing = tmp.path().join("does-not-exist.pdf");
        let result = FileSwap::apply(&dest, SwapSource::File(&missing)).await;
        assert!(result.is_err());
        assert_eq!(std::fs::read(&dest).unwrap(), b"old");
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_remove_empty_dirs_stops_at_root_and_non_empty() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let deep = root.join("OI-0001").join("current");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::create_dir_all(root.join("OI-0002")).unwrap();

        remove_empty_dirs(&deep, root).await;
        assert!(!root.join("OI-0001").exists());
        assert!(root.join("OI-0002").exists());
        assert!(root.exists());
    }
}
