//! Version history for documents.
//!
//! A [`VersionStore`] keeps full copies of earlier file contents for a
//! logical document path. The bundled [`KeyedVersionStore`] lays them out as
//!
//! ```text
//! {root}/.versions/{base64url(path)}/{version_id}/{file_name}
//! {root}/.versions/{base64url(path)}/{version_id}/version.json
//! ```
//!
//! Version ids are derived from the capture time and sort lexicographically
//! in creation order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::fsops::{normalize_relative_path, BestEffort, FileSwap, SwapSource};

/// Pseudo version id for the live file when no explicit version is active.
pub const CURRENT_VERSION_ID: &str = "current";

/// Directory under the document root that holds the keyed store.
pub const VERSIONS_DIR: &str = ".versions";

const SIDECAR_NAME: &str = "version.json";

/// Metadata of one stored version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    pub version_id: String,
    pub document_path: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Computed on read from the document's active-version pointer.
    #[serde(default, skip_serializing)]
    pub is_active: bool,
}

impl VersionDescriptor {
    pub fn with_active(self, is_active: bool) -> Self {
        Self { is_active, ..self }
    }

    pub fn with_url(self, url: Option<String>) -> Self {
        Self { url, ..self }
    }

    pub fn is_current(&self) -> bool {
        self.version_id == CURRENT_VERSION_ID
    }
}

/// A resolved version: where its bytes live and what they are.
#[derive(Debug, Clone)]
pub struct VersionHandle {
    pub path: PathBuf,
    pub file_name: String,
    pub descriptor: VersionDescriptor,
}

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Copy `physical_file` into a new version of `document_path`.
    async fn snapshot(
        &self,
        document_path: &str,
        physical_file: &Path,
        actor: Option<&str>,
        comment: Option<&str>,
    ) -> Result<VersionDescriptor>;

    /// Stored versions, newest first, at most `limit` (0 = all).
    async fn list(&self, document_path: &str, limit: usize) -> Result<Vec<VersionDescriptor>>;

    async fn try_get(&self, document_path: &str, version_id: &str)
        -> Result<Option<VersionHandle>>;

    /// Copy a stored version back onto `destination`. Returns `false` when
    /// the version does not exist. The pre-restore content is not
    /// snapshotted here.
    async fn restore(
        &self,
        document_path: &str,
        version_id: &str,
        destination: &Path,
        actor: Option<&str>,
        comment: Option<&str>,
    ) -> Result<bool>;

    /// Move the history of `from` so it belongs to `to`. Any history
    /// already stored under `to` is dropped.
    async fn relocate(&self, from: &str, to: &str) -> Result<()>;

    /// Drop all stored versions of `document_path`.
    async fn discard(&self, document_path: &str) -> Result<()>;
}

/// Version store keyed by the base64url encoding of the document path.
pub struct KeyedVersionStore {
    base: PathBuf,
}

impl KeyedVersionStore {
    /// Store rooted at `{document_root}/.versions`.
    pub fn for_root(document_root: &Path) -> Self {
        Self::new(document_root.join(VERSIONS_DIR))
    }

    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn document_dir(&self, document_path: &str) -> PathBuf {
        let key = normalize_relative_path(document_path).to_lowercase();
        self.base.join(URL_SAFE_NO_PAD.encode(key.as_bytes()))
    }

    async fn read_sidecar(dir: &Path) -> Result<VersionDescriptor> {
        let path = dir.join(SIDECAR_NAME);
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Invalid version sidecar {}", path.display()))
    }

    /// Allocate a fresh version directory. Ids collide only when two
    /// snapshots land in the same nanosecond; a counter suffix keeps them
    /// unique and still sortable.
    async fn allocate(&self, doc_dir: &Path, now: DateTime<Utc>) -> Result<(String, PathBuf)> {
        fs::create_dir_all(doc_dir)
            .await
            .with_context(|| format!("Failed to create {}", doc_dir.display()))?;

        let base_id = version_id_for(now);
        let mut id = base_id.clone();
        let mut n = 1u32;
        loop {
            let dir = doc_dir.join(&id);
            match fs::create_dir(&dir).await {
                Ok(()) => return Ok((id, dir)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    id = format!("{}-{:02}", base_id, n);
                    n += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to create {}", dir.display()))
                }
            }
        }
    }
}

async fn remove_history_dir(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
    }
}

/// Time-ordered version id: `YYYYMMDDhhmmss` followed by nanoseconds.
pub fn version_id_for(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S%f").to_string()
}

/// A version id must be a single plain path component.
fn is_valid_version_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl VersionStore for KeyedVersionStore {
    async fn snapshot(
        &self,
        document_path: &str,
        physical_file: &Path,
        actor: Option<&str>,
        comment: Option<&str>,
    ) -> Result<VersionDescriptor> {
        let doc_dir = self.document_dir(document_path);
        let now = Utc::now();
        let (version_id, dir) = self.allocate(&doc_dir, now).await?;

        let file_name = physical_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .context("snapshot source has no file name")?;

        let written = async {
            let size = fs::copy(physical_file, dir.join(&file_name))
                .await
                .with_context(|| format!("Failed to copy {}", physical_file.display()))?;

            let descriptor = VersionDescriptor {
                version_id: version_id.clone(),
                document_path: normalize_relative_path(document_path),
                file_name: file_name.clone(),
                created_at: now,
                actor: actor.map(str::to_string),
                comment: comment.map(str::to_string),
                size,
                url: None,
                is_active: false,
            };
            let json = serde_json::to_vec_pretty(&descriptor)?;
            fs::write(dir.join(SIDECAR_NAME), json).await?;
            anyhow::Ok(descriptor)
        }
        .await;

        match written {
            Ok(descriptor) => {
                debug!(
                    "snapshot {} of {} ({} bytes)",
                    version_id, document_path, descriptor.size
                );
                Ok(descriptor)
            }
            Err(e) => {
                fs::remove_dir_all(&dir)
                    .await
                    .best_effort("removing incomplete snapshot");
                Err(e)
            }
        }
    }

    async fn list(&self, document_path: &str, limit: usize) -> Result<Vec<VersionDescriptor>> {
        let doc_dir = self.document_dir(document_path);
        let mut entries = match fs::read_dir(&doc_dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", doc_dir.display()))
            }
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match Self::read_sidecar(&entry.path()).await {
                Ok(d) => versions.push(d),
                Err(e) => warn!("skipping unreadable version: {:#}", e),
            }
        }

        versions.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.version_id.cmp(&a.version_id))
        });
        if limit > 0 {
            versions.truncate(limit);
        }
        Ok(versions)
    }

    async fn try_get(
        &self,
        document_path: &str,
        version_id: &str,
    ) -> Result<Option<VersionHandle>> {
        if !is_valid_version_id(version_id) {
            return Ok(None);
        }
        let dir = self.document_dir(document_path).join(version_id);
        if !fs::try_exists(dir.join(SIDECAR_NAME)).await? {
            return Ok(None);
        }

        let descriptor = Self::read_sidecar(&dir).await?;
        let path = dir.join(&descriptor.file_name);
        if !fs::try_exists(&path).await? {
            warn!("version {} of {} has no content file", version_id, document_path);
            return Ok(None);
        }

        Ok(Some(VersionHandle {
            path,
            file_name: descriptor.file_name.clone(),
            descriptor,
        }))
    }

    async fn restore(
        &self,
        document_path: &str,
        version_id: &str,
        destination: &Path,
        actor: Option<&str>,
        comment: Option<&str>,
    ) -> Result<bool> {
        let Some(handle) = self.try_get(document_path, version_id).await? else {
            return Ok(false);
        };

        let swap = FileSwap::apply(destination, SwapSource::File(&handle.path)).await?;
        swap.commit().await;

        debug!(
            "restored {} of {} by {} ({})",
            version_id,
            document_path,
            actor.unwrap_or("-"),
            comment.unwrap_or("")
        );
        Ok(true)
    }

    async fn relocate(&self, from: &str, to: &str) -> Result<()> {
        let source = self.document_dir(from);
        let target = self.document_dir(to);
        if source == target || !fs::try_exists(&source).await? {
            return Ok(());
        }

        remove_history_dir(&target).await?;
        fs::rename(&source, &target)
            .await
            .with_context(|| format!("Failed to move {}", source.display()))?;

        let document_path = normalize_relative_path(to);
        let mut entries = fs::read_dir(&target).await?;
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let Ok(mut descriptor) = Self::read_sidecar(&dir).await else {
                continue;
            };
            descriptor.document_path = document_path.clone();
            let json = serde_json::to_vec_pretty(&descriptor)?;
            fs::write(dir.join(SIDECAR_NAME), json)
                .await
                .best_effort("rewriting version sidecar");
        }

        debug!("moved history of {} to {}", from, to);
        Ok(())
    }

    async fn discard(&self, document_path: &str) -> Result<()> {
        let dir = self.document_dir(document_path);
        if fs::try_exists(&dir).await? {
            warn!("dropping stale history of {}", document_path);
        }
        remove_history_dir(&dir).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn setup() -> (TempDir, KeyedVersionStore, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let store = KeyedVersionStore::for_root(tmp.path());
        let live = tmp.path().join("OI-0001").join("current").join("press.pdf");
        std::fs::create_dir_all(live.parent().unwrap()).unwrap();
        (tmp, store, live)
    }

    #[test]
    fn test_version_ids_sort_by_time() {
        let a = version_id_for(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        let b = version_id_for(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 6).unwrap());
        let c = version_id_for(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(a.len(), 23);
        assert!(a < b && b < c);
        assert!(a < format!("{}-01", a) && format!("{}-01", a) < b);
    }

    #[test]
    fn test_version_id_validation() {
        assert!(is_valid_version_id("20240102030405000000000"));
        assert!(is_valid_version_id("20240102030405000000000-01"));
        assert!(!is_valid_version_id(".."));
        assert!(!is_valid_version_id("../x"));
        assert!(!is_valid_version_id(""));
    }

    #[tokio::test]
    async fn test_snapshot_list_get() {
        let (_tmp, store, live) = setup();
        std::fs::write(&live, b"v1").unwrap();
        let first = store
            .snapshot("OI-0001/current/press.pdf", &live, Some("amy"), Some("first"))
            .await
            .unwrap();

        std::fs::write(&live, b"version two").unwrap();
        let second = store
            .snapshot("OI-0001/current/press.pdf", &live, Some("bo"), None)
            .await
            .unwrap();

        assert!(first.version_id < second.version_id);
        assert_eq!(second.size, 11);

        let listed = store.list("oi-0001\\current\\press.pdf", 0).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].version_id, second.version_id);
        assert_eq!(listed[1].actor.as_deref(), Some("amy"));
        assert!(listed.iter().all(|d| !d.is_active));

        let limited = store.list("OI-0001/current/press.pdf", 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let handle = store
            .try_get("OI-0001/current/press.pdf", &first.version_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(&handle.path).unwrap(), b"v1");
        assert_eq!(handle.file_name, "press.pdf");
    }

    #[tokio::test]
    async fn test_list_unknown_document_is_empty() {
        let (_tmp, store, _live) = setup();
        assert!(store.list("nothing.pdf", 10).await.unwrap().is_empty());
        assert!(store
            .try_get("nothing.pdf", "20240101000000000000000")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_try_get_rejects_traversal_ids() {
        let (_tmp, store, live) = setup();
        std::fs::write(&live, b"v1").unwrap();
        store
            .snapshot("OI-0001/current/press.pdf", &live, None, None)
            .await
            .unwrap();
        assert!(store
            .try_get("OI-0001/current/press.pdf", "../..")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let (_tmp, store, live) = setup();
        std::fs::write(&live, b"original bytes").unwrap();
        let snap = store
            .snapshot("OI-0001/current/press.pdf", &live, None, None)
            .await
            .unwrap();

        std::fs::write(&live, b"edited").unwrap();
        let ok = store
            .restore("OI-0001/current/press.pdf", &snap.version_id, &live, Some("amy"), None)
            .await
            .unwrap();
        assert!(ok);
        assert_eq!(std::fs::read(&live).unwrap(), b"original bytes");

        let missing = store
            .restore("OI-0001/current/press.pdf", "19990101000000000000000", &live, None, None)
            .await
            .unwrap();
        assert!(!missing);
        assert_eq!(std::fs::read(&live).unwrap(), b"original bytes");
    }

    #[tokio::test]
    async fn test_relocate_moves_history_and_replaces_stale() {
        let (tmp, store, live) = setup();
        std::fs::write(&live, b"v1").unwrap();
        let moved = store
            .snapshot("OI-0001/current/press.pdf", &live, None, None)
            .await
            .unwrap();
        let other = tmp.path().join("old.pdf");
        std::fs::write(&other, b"stale").unwrap();
        store
            .snapshot("OI-0001/current/renamed.pdf", &other, None, None)
            .await
            .unwrap();

        store
            .relocate("OI-0001/current/press.pdf", "OI-0001/current/renamed.pdf")
            .await
            .unwrap();

        assert!(store.list("OI-0001/current/press.pdf", 0).await.unwrap().is_empty());
        let listed = store.list("OI-0001/current/renamed.pdf", 0).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version_id, moved.version_id);
        assert_eq!(listed[0].document_path, "OI-0001/current/renamed.pdf");

        // Nothing to move is fine.
        store.relocate("ghost.pdf", "other.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_drops_history() {
        let (_tmp, store, live) = setup();
        std::fs::write(&live, b"v1").unwrap();
        store
            .snapshot("OI-0001/current/press.pdf", &live, None, None)
            .await
            .unwrap();

        store.discard("OI-0001/current/press.pdf").await.unwrap();
        assert!(store.list("OI-0001/current/press.pdf", 0).await.unwrap().is_empty());
        store.discard("OI-0001/current/press.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_missing_source_leaves_nothing_behind() {
        let (tmp, store, _live) = setup();
        let missing = tmp.path().join("ghost.pdf");
        assert!(store.snapshot("ghost.pdf", &missing, None, None).await.is_err());
        assert!(store.list("ghost.pdf", 0).await.unwrap().is_empty());
    }

    #[test]
    fn test_descriptor_with_overrides() {
        let d = VersionDescriptor {
            version_id: CURRENT_VERSION_ID.to_string(),
            document_path: "a.pdf".to_string(),
            file_name: "a.pdf".to_string(),
            created_at: Utc::now(),
            actor: None,
            comment: None,
            size: 3,
            url: None,
            is_active: false,
        };
        let d = d.with_active(true).with_url(Some("/files/a.pdf".into()));
        assert!(d.is_active && d.is_current());
        assert_eq!(d.url.as_deref(), Some("/files/a.pdf"));
    }
}
