//! The read path: a merged view of the manifest and the document root.
//!
//! [`DocumentCatalog::load_documents`] always reads the filesystem.
//! [`DocumentCatalog::documents`] goes through a [`CatalogCache`] that keeps
//! one snapshot for a fixed TTL; [`DocumentCatalog::invalidate`] drops it so
//! the next read rebuilds regardless of age.
//!
//! Root resolution order:
//!
//! 1. `documents.root` when it is an existing directory (connecting the
//!    network share first when enabled and the root is a UNC path);
//! 2. `documents.content_root / documents.relative_root`, flagged as a
//!    fallback when an absolute root was configured;
//! 3. no root. Readers then see an empty catalog.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Config, DocumentsConfig};
use crate::manifest::{self, ManifestEntry};
use crate::models::{CatalogRecord, Page, PLACEHOLDER};
use crate::numbering::{format_code, sanitize_code_dir, try_parse_code};
use crate::query::{page_of, PageRequest};
use crate::share::{connector_for, is_unc_path, ShareConnector};
use crate::versions::VERSIONS_DIR;

/// Live file directory inside a document's code directory.
pub const CURRENT_DIR: &str = "current";
/// Per-document history directory. Never listed by the catalog.
pub const HISTORY_DIR: &str = "versions";
const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RootState {
    Primary,
    Fallback,
    Missing,
}

/// Outcome of root resolution, with enough context to explain a failure.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootResolution {
    pub root: Option<PathBuf>,
    pub state: RootState,
    pub configured: Option<PathBuf>,
    pub fallback: Option<PathBuf>,
    pub share_diagnostic: Option<String>,
}

impl RootResolution {
    pub fn describe(&self) -> String {
        let show = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(not set)".to_string())
        };
        match self.state {
            RootState::Primary => format!("using {}", show(&self.root)),
            RootState::Fallback => format!(
                "{} is unavailable, using fallback {}",
                show(&self.configured),
                show(&self.root)
            ),
            RootState::Missing => format!(
                "no document root: tried {} and {}",
                show(&self.configured),
                show(&self.fallback)
            ),
        }
    }
}

/// Directories of one document code under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDirs {
    pub base: PathBuf,
    pub current: PathBuf,
    pub history: PathBuf,
}

pub fn document_dirs(root: &Path, code: &str) -> DocumentDirs {
    let base = root.join(sanitize_code_dir(code));
    DocumentDirs {
        current: base.join(CURRENT_DIR),
        history: base.join(HISTORY_DIR),
        base,
    }
}

/// Build the public link for a root-relative path under `base`.
///
/// `base` may be absolute (`https://host/docs/`) or a path (`/files/`).
/// Each path segment is percent-encoded.
pub fn public_url(base: &str, relative_path: &str) -> String {
    let rel = crate::fsops::normalize_relative_path(relative_path);
    let segments = rel.split('/').filter(|s| !s.is_empty());

    let (mut url, is_absolute) = match url::Url::parse(base) {
        Ok(u) if !u.cannot_be_a_base() => (u, true),
        _ => match url::Url::parse("http://localhost").and_then(|u| u.join(base)) {
            Ok(u) => (u, false),
            Err(_) => return format!("{}{}", base, rel),
        },
    };

    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }

    if is_absolute {
        url.to_string()
    } else {
        url.path().to_string()
    }
}

/// A single cached catalog snapshot.
pub struct CatalogCache {
    ttl: Duration,
    state: RwLock<Option<CacheEntry>>,
    refresh: Mutex<()>,
    generation: AtomicU64,
}

struct CacheEntry {
    records: Arc<Vec<CatalogRecord>>,
    loaded_at: Instant,
    generation: u64,
}

impl CatalogCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(None),
            refresh: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Make the current snapshot stale. A load already in flight when this
    /// is called stores its result as stale too.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn fresh(&self) -> Option<Arc<Vec<CatalogRecord>>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let state = self.state.read().await;
        state
            .as_ref()
            .filter(|e| e.generation == generation && e.loaded_at.elapsed() < self.ttl)
            .map(|e| e.records.clone())
    }

    /// Return the cached snapshot, or run `load` and cache its result.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<Arc<Vec<CatalogRecord>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<CatalogRecord>>>,
    {
        if let Some(records) = self.fresh().await {
            return Ok(records);
        }

        let _guard = self.refresh.lock().await;
        if let Some(records) = self.fresh().await {
            return Ok(records);
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let records = Arc::new(load().await?);
        *self.state.write().await = Some(CacheEntry {
            records: records.clone(),
            loaded_at: Instant::now(),
            generation,
        });
        Ok(records)
    }
}

/// A full read of the document root.
#[derive(Debug, Clone)]
pub struct CatalogScan {
    pub root: RootResolution,
    pub records: Vec<CatalogRecord>,
}

pub struct DocumentCatalog {
    config: DocumentsConfig,
    share_enabled: bool,
    connector: Box<dyn ShareConnector>,
    excludes: GlobSet,
    cache: CatalogCache,
}

impl DocumentCatalog {
    pub fn new(config: &Config) -> Result<Self> {
        let documents = config.documents.clone();

        let mut patterns = vec![
            format!("**/{}", META_FILE),
            documents.manifest_name.clone(),
            format!("{}.tmp", documents.manifest_name),
        ];
        patterns.extend(documents.exclude_globs.iter().cloned());
        let excludes = build_globset(&patterns)?;

        Ok(Self {
            cache: CatalogCache::new(documents.cache_ttl()),
            share_enabled: config.share.enabled,
            connector: connector_for(&config.share),
            config: documents,
            excludes,
        })
    }

    pub fn with_connector(mut self, connector: Box<dyn ShareConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn manifest_name(&self) -> &str {
        &self.config.manifest_name
    }

    pub fn public_url(&self, relative_path: &str) -> String {
        public_url(&self.config.public_base_url, relative_path)
    }

    pub async fn resolve_root(&self) -> RootResolution {
        let configured = self.config.root.clone();
        let fallback = self
            .config
            .relative_root
            .as_ref()
            .map(|r| self.config.content_root.join(r));
        let mut share_diagnostic = None;

        if let Some(abs) = &configured {
            if self.share_enabled && is_unc_path(abs) && !is_dir(abs).await {
                if let Err(e) = self.connector.connect(abs).await {
                    warn!("network share connect failed: {:#}", e);
                    share_diagnostic = Some(format!("{:#}", e));
                }
            }
            if is_dir(abs).await {
                return RootResolution {
                    root: Some(abs.clone()),
                    state: RootState::Primary,
                    configured,
                    fallback,
                    share_diagnostic,
                };
            }
        }

        if let Some(fb) = &fallback {
            if is_dir(fb).await {
                let state = if configured.is_some() {
                    RootState::Fallback
                } else {
                    RootState::Primary
                };
                return RootResolution {
                    root: Some(fb.clone()),
                    state,
                    configured,
                    fallback,
                    share_diagnostic,
                };
            }
        }

        RootResolution {
            root: None,
            state: RootState::Missing,
            configured,
            fallback,
            share_diagnostic,
        }
    }

    /// Read the manifest and walk the root, bypassing the cache.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<CatalogScan> {
        let root = self.resolve_root().await;
        let Some(dir) = root.root.clone() else {
            warn!("{}", root.describe());
            return Ok(CatalogScan {
                root,
                records: Vec::new(),
            });
        };

        let manifest_path = manifest::manifest_path(&dir, &self.config.manifest_name);
        let manifest = manifest::load(&manifest_path).await?;

        let mut records = Vec::with_capacity(manifest.documents.len());
        let mut covered = HashSet::new();
        for entry in &manifest.documents {
            let Some(key) = entry.key() else { continue };
            if key.split('/').any(|seg| seg == "..") {
                warn!("ignoring manifest entry outside the root: {}", key);
                continue;
            }
            let Ok(meta) = fs::metadata(dir.join(&key)).await else {
                continue;
            };
            if !meta.is_file() || !covered.insert(key.to_lowercase()) {
                continue;
            }
            let modified = meta.modified().ok().map(DateTime::<Utc>::from);
            records.push(self.manifest_record(entry, key, modified));
        }

        let walk_root = dir.clone();
        let excludes = self.excludes.clone();
        let token = cancel.clone();
        let found = tokio::task::spawn_blocking(move || walk(&walk_root, &excludes, &covered, &token))
            .await
            .context("catalog walk task failed")??;

        let synthesized = found.len();
        records.extend(
            found
                .into_iter()
                .map(|(rel, modified)| self.placeholder_record(rel, modified)),
        );

        records.sort_by(|a, b| {
            b.updated_at.cmp(&a.updated_at).then_with(|| {
                a.display_name
                    .to_lowercase()
                    .cmp(&b.display_name.to_lowercase())
            })
        });

        debug!(
            "catalog loaded from {}: {} records ({} without manifest entry)",
            dir.display(),
            records.len(),
            synthesized
        );
        Ok(CatalogScan { root, records })
    }

    pub async fn load_documents(&self) -> Result<Vec<CatalogRecord>> {
        Ok(self.scan(&CancellationToken::new()).await?.records)
    }

    /// Cached document list.
    pub async fn documents(&self) -> Result<Arc<Vec<CatalogRecord>>> {
        self.cache.get_or_load(|| self.load_documents()).await
    }

    pub fn invalidate(&self) {
        debug!("catalog cache invalidated");
        self.cache.invalidate();
    }

    pub async fn page(&self, request: &PageRequest) -> Result<Page<CatalogRecord>> {
        let documents = self.documents().await?;
        Ok(page_of(&documents, request))
    }

    /// Physical path of an existing file under the root, or `None` when the
    /// path does not exist or resolves outside the root.
    pub async fn resolve_physical_path(&self, relative_path: &str) -> Option<PathBuf> {
        let root = self.resolve_root().await.root?;
        resolve_under(&root, relative_path).await
    }

    /// Like [`resolve_physical_path`](Self::resolve_physical_path), but only
    /// for files the catalog would list: history folders, hidden and
    /// transient files, the manifest and excluded globs stay private unless
    /// a manifest entry names the file.
    pub async fn resolve_listed_file(&self, relative_path: &str) -> Option<PathBuf> {
        let rel = crate::fsops::normalize_relative_path(relative_path);
        if !is_walkable(&rel, &self.excludes) {
            let documents = self.documents().await.ok()?;
            if !documents
                .iter()
                .any(|r| r.in_manifest && r.relative_path.eq_ignore_ascii_case(&rel))
            {
                info!("refused to serve unlisted path: {}", rel);
                return None;
            }
        }
        self.resolve_physical_path(&rel).await
    }

    fn manifest_record(
        &self,
        entry: &ManifestEntry,
        key: String,
        modified: Option<DateTime<Utc>>,
    ) -> CatalogRecord {
        let file_name = last_segment(&key);
        let text = |v: &Option<String>| v.as_deref().unwrap_or("").trim().to_string();
        let display_name = entry
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| file_stem(&file_name));

        CatalogRecord {
            url: self.public_url(&key),
            file_name,
            display_name,
            line: text(&entry.line),
            station: text(&entry.station),
            model: text(&entry.model),
            machine_name: text(&entry.machine_name),
            uploaded_by: text(&entry.uploaded_by),
            comment: text(&entry.comment),
            document_type: entry.doc_type(),
            sequence_number: entry.sequence_number,
            code: entry.code(),
            version: entry.version,
            active_version_id: entry.active_version_id.clone(),
            updated_at: entry.updated_at.or(modified),
            relative_path: key,
            in_manifest: true,
        }
    }

    fn placeholder_record(&self, key: String, modified: Option<DateTime<Utc>>) -> CatalogRecord {
        let file_name = last_segment(&key);
        let parsed = key
            .split_once('/')
            .and_then(|(top, _)| try_parse_code(top));
        let (document_type, sequence_number, code) = match parsed {
            Some((t, seq)) => (
                t.as_str().to_string(),
                Some(seq as i64),
                format_code(t.as_str(), seq as i64),
            ),
            None => (String::new(), None, None),
        };

        CatalogRecord {
            url: self.public_url(&key),
            display_name: file_stem(&file_name),
            file_name,
            line: PLACEHOLDER.to_string(),
            station: PLACEHOLDER.to_string(),
            model: PLACEHOLDER.to_string(),
            machine_name: PLACEHOLDER.to_string(),
            uploaded_by: PLACEHOLDER.to_string(),
            comment: String::new(),
            document_type,
            sequence_number,
            code,
            version: None,
            active_version_id: None,
            updated_at: modified,
            relative_path: key,
            in_manifest: false,
        }
    }
}

/// Canonicalise `root/relative` and accept it only when it is an existing
/// file still inside the canonical root.
pub async fn resolve_under(root: &Path, relative_path: &str) -> Option<PathBuf> {
    let rel = crate::fsops::normalize_relative_path(relative_path);
    if rel.is_empty() {
        return None;
    }
    let canonical_root = fs::canonicalize(root).await.ok()?;
    let candidate = fs::canonicalize(root.join(&rel)).await.ok()?;
    if !candidate.starts_with(&canonical_root) {
        info!("rejected path outside the document root: {}", relative_path);
        return None;
    }
    let meta = fs::metadata(&candidate).await.ok()?;
    meta.is_file().then_some(candidate)
}

/// Files under `root` that are not excluded and not in `covered`.
fn walk(
    root: &Path,
    excludes: &GlobSet,
    covered: &HashSet<String>,
    cancel: &CancellationToken,
) -> Result<Vec<(String, Option<DateTime<Utc>>)>> {
    let mut found = Vec::new();

    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        e.depth() == 0 || !e.file_type().is_dir() || !is_skipped_dir(&e.file_name().to_string_lossy())
    });

    for entry in walker {
        if cancel.is_cancelled() {
            anyhow::bail!("catalog walk cancelled");
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if is_private_file(&name) {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel = crate::fsops::normalize_relative_path(&relative.to_string_lossy());
        if excludes.is_match(&rel) || covered.contains(&rel.to_lowercase()) {
            continue;
        }

        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);
        found.push((rel, modified));
    }

    Ok(found)
}

fn is_private_file(name: &str) -> bool {
    name.starts_with('.') || crate::fsops::is_transient_file(name)
}

/// Whether the walk in [`walk`] would reach and keep `rel`.
fn is_walkable(rel: &str, excludes: &GlobSet) -> bool {
    let (dirs, name) = rel.rsplit_once('/').unwrap_or(("", rel));
    !rel.is_empty()
        && !dirs.split('/').any(|d| !d.is_empty() && is_skipped_dir(d))
        && !is_private_file(name)
        && !excludes.is_match(rel)
}

fn is_skipped_dir(name: &str) -> bool {
    name.eq_ignore_ascii_case(HISTORY_DIR) || name == VERSIONS_DIR || name.starts_with('.')
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .literal_separator(true)
            .build()
            .with_context(|| format!("invalid exclude glob: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

fn last_segment(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

fn file_stem(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::manifest::Manifest;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn config_for(root: Option<PathBuf>, relative: Option<PathBuf>, content: PathBuf) -> Config {
        Config {
            db: DbConfig {
                path: content.join("index.sqlite"),
            },
            server: Default::default(),
            documents: DocumentsConfig {
                root,
                relative_root: relative,
                content_root: content,
                ..Default::default()
            },
            share: Default::default(),
            indexer: Default::default(),
        }
    }

    fn write(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    fn entry(path: &str, name: &str, seq: i64) -> ManifestEntry {
        ManifestEntry {
            file_name: Some(path.into()),
            display_name: Some(name.into()),
            document_type: Some("OI".into()),
            sequence_number: Some(seq),
            version: Some(1),
            line: Some("L1".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_document_dirs() {
        let dirs = document_dirs(Path::new("/r"), "OI-0007");
        assert_eq!(dirs.current, PathBuf::from("/r/OI-0007/current"));
        assert_eq!(dirs.history, PathBuf::from("/r/OI-0007/versions"));
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("/files/", "OI-0001\\current\\Line 3 #2.pdf"),
            "/files/OI-0001/current/Line%203%20%232.pdf"
        );
        assert_eq!(public_url("/files", "a.pdf"), "/files/a.pdf");
        assert_eq!(
            public_url("https://docs.plant.local/oiwi/", "OI-0001/current/a.pdf"),
            "https://docs.plant.local/oiwi/OI-0001/current/a.pdf"
        );
    }

    #[tokio::test]
    async fn test_root_resolution_states() {
        let tmp = TempDir::new().unwrap();
        let abs = tmp.path().join("share");
        let rel = PathBuf::from("local");
        std::fs::create_dir_all(tmp.path().join("local")).unwrap();

        let cfg = config_for(Some(abs.clone()), Some(rel.clone()), tmp.path().to_path_buf());
        let catalog = DocumentCatalog::new(&cfg).unwrap();
        let r = catalog.resolve_root().await;
        assert_eq!(r.state, RootState::Fallback);
        assert_eq!(r.root, Some(tmp.path().join("local")));

        std::fs::create_dir_all(&abs).unwrap();
        let r = catalog.resolve_root().await;
        assert_eq!(r.state, RootState::Primary);
        assert_eq!(r.root, Some(abs.clone()));

        let cfg = config_for(
            Some(tmp.path().join("nope")),
            Some(PathBuf::from("nope-either")),
            tmp.path().to_path_buf(),
        );
        let r = DocumentCatalog::new(&cfg).unwrap().resolve_root().await;
        assert_eq!(r.state, RootState::Missing);
        let text = r.describe();
        assert!(text.contains("nope") && text.contains("nope-either"));
    }

    #[tokio::test]
    async fn test_missing_root_is_empty_catalog() {
        let tmp = TempDir::new().unwrap();
        let cfg = config_for(Some(tmp.path().join("gone")), None, tmp.path().to_path_buf());
        let catalog = DocumentCatalog::new(&cfg).unwrap();
        assert!(catalog.load_documents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_merges_manifest_and_disk() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("docs");
        write(&root.join("OI-0001/current/press.pdf"), b"a");
        write(&root.join("OI-0001/versions/old.pdf"), b"old");
        write(&root.join("OI-0004/current/loose.pdf"), b"b");
        write(&root.join("misc/meta.json"), b"{}");
        write(&root.join(".versions/abc/1/press.pdf"), b"v");
        write(&root.join("misc/.OI-0001.pdf.123.oiwi-tmp"), b"t");

        let manifest = Manifest {
            documents: vec![
                entry("OI-0001/current/press.pdf", "Press", 1),
                entry("OI-0002/current/deleted.pdf", "Deleted", 2),
            ],
        };
        manifest::persist(&root.join("index.json"), &manifest)
            .await
            .unwrap();

        let cfg = config_for(Some(root.clone()), None, tmp.path().to_path_buf());
        let catalog = DocumentCatalog::new(&cfg).unwrap();
        let docs = catalog.load_documents().await.unwrap();

        let paths: HashSet<_> = docs.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(
            paths,
            HashSet::from(["OI-0001/current/press.pdf", "OI-0004/current/loose.pdf"])
        );

        let press = docs.iter().find(|r| r.in_manifest).unwrap();
        assert_eq!(press.display_name, "Press");
        assert_eq!(press.code.as_deref(), Some("OI-0001"));
        assert_eq!(press.url, "/files/OI-0001/current/press.pdf");

        let loose = docs.iter().find(|r| !r.in_manifest).unwrap();
        assert_eq!(loose.display_name, "loose");
        assert_eq!(loose.line, PLACEHOLDER);
        assert_eq!(loose.code.as_deref(), Some("OI-0004"));
    }

    #[tokio::test]
    async fn test_order_newest_first_then_name() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        for name in ["b.pdf", "A.pdf", "c.pdf"] {
            write(&root.join(name), b"x");
        }
        let mut manifest = Manifest::default();
        for (i, name) in ["b.pdf", "A.pdf", "c.pdf"].iter().enumerate() {
            let mut e = entry(name, &name.replace(".pdf", ""), i as i64 + 1);
            e.updated_at = Some(
                "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
                    + chrono::Duration::days(if *name == "c.pdf" { 1 } else { 0 }),
            );
            manifest.documents.push(e);
        }
        manifest::persist(&root.join("index.json"), &manifest)
            .await
            .unwrap();

        let cfg = config_for(Some(root), None, tmp.path().to_path_buf());
        let docs = DocumentCatalog::new(&cfg)
            .unwrap()
            .load_documents()
            .await
            .unwrap();
        let names: Vec<_> = docs.iter().map(|r| r.display_name.as_str()).collect();
        assert_eq!(names, vec!["c", "A", "b"]);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_an_error() {
        let tmp = TempDir::new().unwrap();
        write(&tmp.path().join("index.json"), b"{ broken");
        let cfg = config_for(Some(tmp.path().to_path_buf()), None, tmp.path().to_path_buf());
        let catalog = DocumentCatalog::new(&cfg).unwrap();
        assert!(catalog.load_documents().await.is_err());
    }

    #[tokio::test]
    async fn test_exclude_globs() {
        let tmp = TempDir::new().unwrap();
        write(&tmp.path().join("keep.pdf"), b"x");
        write(&tmp.path().join("drafts/skip.pdf"), b"x");
        let mut cfg = config_for(Some(tmp.path().to_path_buf()), None, tmp.path().to_path_buf());
        cfg.documents.exclude_globs = vec!["drafts/**".into()];
        let docs = DocumentCatalog::new(&cfg)
            .unwrap()
            .load_documents()
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].relative_path, "keep.pdf");
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let tmp = TempDir::new().unwrap();
        write(&tmp.path().join("one.pdf"), b"x");
        let cfg = config_for(Some(tmp.path().to_path_buf()), None, tmp.path().to_path_buf());
        let catalog = DocumentCatalog::new(&cfg).unwrap();

        assert_eq!(catalog.documents().await.unwrap().len(), 1);
        write(&tmp.path().join("two.pdf"), b"x");
        assert_eq!(catalog.documents().await.unwrap().len(), 1);

        catalog.invalidate();
        assert_eq!(catalog.documents().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cache_loads_once_within_ttl() {
        let cache = CatalogCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_load(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let expired = CatalogCache::new(Duration::ZERO);
        for _ in 0..2 {
            expired
                .get_or_load(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let cache = CatalogCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_load(|| async { Err(anyhow::anyhow!("boom")) })
            .await;
        assert!(err.is_err());
        let ok = cache.get_or_load(|| async { Ok(Vec::new()) }).await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_physical_path_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("docs");
        write(&root.join("OI-0001/current/a.pdf"), b"a");
        write(&tmp.path().join("secret.txt"), b"s");

        for cfg in [
            config_for(Some(root.clone()), None, tmp.path().to_path_buf()),
            config_for(None, Some(PathBuf::from("docs")), tmp.path().to_path_buf()),
        ] {
            let catalog = DocumentCatalog::new(&cfg).unwrap();
            assert!(catalog
                .resolve_physical_path("OI-0001/current/a.pdf")
                .await
                .is_some());
            assert!(catalog.resolve_physical_path("../secret.txt").await.is_none());
            assert!(catalog
                .resolve_physical_path("OI-0001/../../secret.txt")
                .await
                .is_none());
            assert!(catalog.resolve_physical_path("OI-0001").await.is_none());
            assert!(catalog.resolve_physical_path("missing.pdf").await.is_none());
        }
    }

    #[tokio::test]
    async fn test_resolve_listed_file_hides_internal_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        write(&root.join("OI-0001/current/a.pdf"), b"a");
        write(&root.join("OI-0001/versions/old.pdf"), b"old");
        write(&root.join(".versions/abc/1/a.pdf"), b"snap");
        write(&root.join("OI-0001/meta.json"), b"{}");
        write(&root.join("drafts/wip.pdf"), b"wip");
        write(&root.join("index.json"), b"{\"documents\":[]}");

        let mut cfg = config_for(Some(root.clone()), None, root.clone());
        cfg.documents.exclude_globs = vec!["drafts/**".into()];
        let catalog = DocumentCatalog::new(&cfg).unwrap();

        assert!(catalog
            .resolve_listed_file("OI-0001/current/a.pdf")
            .await
            .is_some());
        for private in [
            "index.json",
            ".versions/abc/1/a.pdf",
            "OI-0001/versions/old.pdf",
            "OI-0001/meta.json",
            "drafts/wip.pdf",
        ] {
            assert!(
                catalog.resolve_listed_file(private).await.is_none(),
                "{} should not be served",
                private
            );
            assert!(catalog.resolve_physical_path(private).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_scan_honours_cancellation() {
        let tmp = TempDir::new().unwrap();
        write(&tmp.path().join("a.pdf"), b"x");
        let cfg = config_for(Some(tmp.path().to_path_buf()), None, tmp.path().to_path_buf());
        let catalog = DocumentCatalog::new(&cfg).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(catalog.scan(&token).await.is_err());
    }
}
