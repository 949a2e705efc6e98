//! The write path: upload, update and version activation.
//!
//! Every mutating call holds one global write lock for its whole duration,
//! so the manifest read-modify-write and the file renames never interleave.
//! Within a call the file system changes first and the manifest second; a
//! manifest failure rolls the file back from its backup before the error is
//! returned. The catalog cache is invalidated only after the manifest has
//! been written.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use walkdir::WalkDir;

use crate::catalog::{document_dirs, DocumentCatalog, CURRENT_DIR, HISTORY_DIR};
use crate::error::{ManifestError, WriteError};
use crate::fsops::{
    remove_empty_dirs, safe_join, sanitize_file_name, unique_file_name, BestEffort, FileSwap,
    SwapSource,
};
use crate::manifest::{self, Manifest, ManifestEntry};
use crate::numbering::{
    format_code, is_known_type, next_sequence, normalize_type, sanitize_code_dir, try_parse_code,
    DocumentType,
};
use crate::versions::{
    KeyedVersionStore, VersionDescriptor, VersionHandle, VersionStore, CURRENT_VERSION_ID,
};

/// Free-text metadata of a document. `None` leaves a field unchanged on
/// update; a blank string clears it.
#[derive(Debug, Clone, Default)]
pub struct DocumentMetadata {
    pub display_name: Option<String>,
    pub line: Option<String>,
    pub station: Option<String>,
    pub model: Option<String>,
    pub machine_name: Option<String>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub document_type: String,
    /// Name of the file as supplied by the uploader.
    pub file_name: String,
    pub content: Vec<u8>,
    pub metadata: DocumentMetadata,
    pub uploaded_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub code: String,
    pub sequence_number: u32,
    pub relative_path: String,
}

#[derive(Debug, Clone)]
pub struct NewContent {
    /// Replacement file name; the current name is kept when `None`.
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub relative_path: String,
    /// Must match the stored type when given.
    pub document_type: Option<String>,
    pub metadata: DocumentMetadata,
    pub content: Option<NewContent>,
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub relative_path: String,
    pub version: i64,
}

pub struct DocumentService {
    catalog: Arc<DocumentCatalog>,
    versions: Option<Arc<dyn VersionStore>>,
    write_lock: Mutex<()>,
}

impl DocumentService {
    pub fn new(catalog: Arc<DocumentCatalog>) -> Self {
        Self {
            catalog,
            versions: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Use `store` instead of the keyed store under the document root.
    pub fn with_version_store(mut self, store: Arc<dyn VersionStore>) -> Self {
        self.versions = Some(store);
        self
    }

    pub fn catalog(&self) -> &Arc<DocumentCatalog> {
        &self.catalog
    }

    fn store_for(&self, root: &Path) -> Arc<dyn VersionStore> {
        match &self.versions {
            Some(store) => store.clone(),
            None => Arc::new(KeyedVersionStore::for_root(root)),
        }
    }

    async fn root(&self) -> Result<PathBuf, WriteError> {
        let resolution = self.catalog.resolve_root().await;
        resolution.root.clone().ok_or_else(|| {
            warn!("{}", resolution.describe());
            WriteError::RootUnavailable
        })
    }

    async fn load_manifest(&self, root: &Path) -> Result<(PathBuf, Manifest), WriteError> {
        let path = manifest::manifest_path(root, self.catalog.manifest_name());
        let manifest = manifest::load(&path).await.map_err(manifest_failure)?;
        Ok((path, manifest))
    }

    #[instrument(skip(self, request), fields(doc_type = %request.document_type, file = %request.file_name))]
    pub async fn upload(&self, request: UploadRequest) -> Result<UploadOutcome, WriteError> {
        let doc_type = DocumentType::parse(&request.document_type)
            .ok_or_else(|| WriteError::UnknownDocumentType(request.document_type.trim().to_string()))?;
        if doc_type == DocumentType::Wi && clean(&request.metadata.machine_name).is_none() {
            return Err(WriteError::MachineNameRequired);
        }
        if request.content.is_empty() {
            return Err(WriteError::EmptyFile);
        }
        let file_name =
            sanitize_file_name(&request.file_name).ok_or(WriteError::InvalidFileName)?;

        let _guard = self.write_lock.lock().await;
        let root = self.root().await?;
        let (manifest_path, mut manifest) = self.load_manifest(&root).await?;

        let sequence = sequence_in(&root, &manifest, doc_type.as_str())
            .await
            .map_err(|e| internal("allocating sequence number", e))?;
        let code = format_code(doc_type.as_str(), sequence as i64)
            .ok_or_else(|| internal("formatting document code", format!("sequence {}", sequence)))?;
        let dirs = document_dirs(&root, &code);

        let staged = async {
            fs::create_dir_all(&dirs.current).await?;
            let name = unique_file_name(&dirs.current, &file_name, None).await?;
            let swap =
                FileSwap::apply(&dirs.current.join(&name), SwapSource::Bytes(&request.content))
                    .await?;
            anyhow::Ok((name, swap))
        }
        .await;

        let (name, swap) = match staged {
            Ok(v) => v,
            Err(e) => {
                remove_empty_dirs(&dirs.current, &root).await;
                return Err(internal("writing uploaded file", e));
            }
        };

        let relative_path = format!("{}/{}/{}", sanitize_code_dir(&code), CURRENT_DIR, name);
        let display_name =
            clean(&request.metadata.display_name).unwrap_or_else(|| stem_of(&name));
        let entry = ManifestEntry {
            file_name: Some(relative_path.clone()),
            display_name: Some(display_name),
            line: clean(&request.metadata.line),
            station: clean(&request.metadata.station),
            model: clean(&request.metadata.model),
            machine_name: clean(&request.metadata.machine_name),
            uploaded_by: clean(&request.uploaded_by),
            comment: clean(&request.metadata.comment),
            document_type: Some(doc_type.as_str().to_string()),
            active_version_id: None,
            updated_at: Some(Utc::now()),
            sequence_number: Some(sequence as i64),
            version: Some(1),
        };
        manifest.upsert(entry, None);

        if let Err(e) = manifest::persist(&manifest_path, &manifest).await {
            swap.rollback().await;
            remove_empty_dirs(&dirs.current, &root).await;
            return Err(manifest_failure(e));
        }
        let live = swap.destination().to_path_buf();
        swap.commit().await;

        // A freed code can bring a new document back to an old path; the
        // history left there belongs to the deleted document.
        let store = self.store_for(&root);
        store
            .discard(&relative_path)
            .await
            .best_effort("clearing stale history");
        store
            .snapshot(
                &relative_path,
                &live,
                request.uploaded_by.as_deref(),
                Some("uploaded"),
            )
            .await
            .best_effort("snapshot of uploaded document");

        self.catalog.invalidate();
        info!("uploaded {} as {}", relative_path, code);

        Ok(UploadOutcome {
            code,
            sequence_number: sequence,
            relative_path,
        })
    }

    #[instrument(skip(self, request), fields(path = %request.relative_path))]
    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateOutcome, WriteError> {
        if let Some(content) = &request.content {
            if content.bytes.is_empty() {
                return Err(WriteError::EmptyFile);
            }
        }

        let _guard = self.write_lock.lock().await;
        let root = self.root().await?;
        let (manifest_path, mut manifest) = self.load_manifest(&root).await?;

        let mut entry = manifest
            .find(&request.relative_path)
            .cloned()
            .ok_or(WriteError::DocumentNotFound)?;
        let old_key = entry.key().ok_or(WriteError::DocumentNotFound)?;
        let old_physical = safe_join(&root, &old_key).ok_or(WriteError::DocumentNotFound)?;

        if let Some(requested) = request.document_type.as_deref() {
            let requested = normalize_type(requested);
            if !requested.is_empty() && requested != entry.doc_type() {
                return Err(WriteError::DocumentTypeImmutable);
            }
        }

        apply_metadata(&mut entry, &request.metadata);
        if entry.doc_type() == DocumentType::Wi.as_str() && clean(&entry.machine_name).is_none() {
            return Err(WriteError::MachineNameRequired);
        }
        if let Some(by) = clean(&request.updated_by) {
            entry.uploaded_by = Some(by);
        }
        entry.updated_at = Some(Utc::now());

        let store = self.store_for(&root);
        let mut swap = None;
        let mut new_key = old_key.clone();

        if let Some(content) = &request.content {
            if fs::try_exists(&old_physical).await.unwrap_or(false) {
                store
                    .snapshot(
                        &old_key,
                        &old_physical,
                        request.updated_by.as_deref(),
                        Some("before update"),
                    )
                    .await
                    .best_effort("snapshot before update");
            }

            let destination = match &content.file_name {
                Some(raw) => {
                    let name = sanitize_file_name(raw).ok_or(WriteError::InvalidFileName)?;
                    let dir = old_physical
                        .parent()
                        .ok_or_else(|| internal("resolving document folder", &old_key))?;
                    let name = unique_file_name(dir, &name, Some(&old_physical))
                        .await
                        .map_err(|e| internal("choosing file name", e))?;
                    dir.join(name)
                }
                None => old_physical.clone(),
            };

            let applied = FileSwap::apply(&destination, SwapSource::Bytes(&content.bytes))
                .await
                .map_err(|e| internal("replacing document file", e))?;

            if destination != old_physical {
                let name = applied
                    .destination()
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                new_key = match old_key.rsplit_once('/') {
                    Some((parent, _)) => format!("{}/{}", parent, name),
                    None => name,
                };
            }

            entry.file_name = Some(new_key.clone());
            entry.version = Some(entry.version.unwrap_or(1) + 1);
            entry.active_version_id = None;
            swap = Some(applied);
        }

        let version = entry.version.unwrap_or(1);
        manifest.upsert(entry, Some(&old_key));

        if let Err(e) = manifest::persist(&manifest_path, &manifest).await {
            if let Some(swap) = swap {
                swap.rollback().await;
            }
            return Err(manifest_failure(e));
        }

        if let Some(swap) = swap {
            let moved = swap.destination() != old_physical;
            swap.commit().await;
            if moved {
                fs::remove_file(&old_physical)
                    .await
                    .best_effort("removing replaced file");
                store
                    .relocate(&old_key, &new_key)
                    .await
                    .best_effort("moving version history");
            }
        }

        self.catalog.invalidate();
        info!("updated {} (version {})", new_key, version);

        Ok(UpdateOutcome {
            relative_path: new_key,
            version,
        })
    }

    /// Make a stored version the live content without touching the version
    /// counter.
    #[instrument(skip(self))]
    pub async fn set_active_version(
        &self,
        relative_path: &str,
        version_id: &str,
        actor: Option<&str>,
    ) -> Result<(), WriteError> {
        let _guard = self.write_lock.lock().await;
        let root = self.root().await?;
        let (manifest_path, mut manifest) = self.load_manifest(&root).await?;

        let mut entry = manifest
            .find(relative_path)
            .cloned()
            .ok_or(WriteError::DocumentNotFound)?;
        let key_path = entry.key().ok_or(WriteError::DocumentNotFound)?;
        let physical = safe_join(&root, &key_path).ok_or(WriteError::DocumentNotFound)?;

        if version_id == CURRENT_VERSION_ID {
            return match entry.active_version_id {
                None => Ok(()),
                Some(_) => Err(WriteError::VersionNotFound),
            };
        }

        let store = self.store_for(&root);
        let handle = store
            .try_get(&key_path, version_id)
            .await
            .map_err(|e| internal("looking up version", e))?
            .ok_or(WriteError::VersionNotFound)?;

        if entry.active_version_id.as_deref() == Some(version_id) {
            debug!("version {} already active", version_id);
            return Ok(());
        }

        // Edits made since the last snapshot exist only in the live file.
        if entry.active_version_id.is_none() && fs::try_exists(&physical).await.unwrap_or(false) {
            store
                .snapshot(&key_path, &physical, actor, Some("before activating a version"))
                .await
                .best_effort("snapshot before activation");
        }

        let swap = FileSwap::apply(&physical, SwapSource::File(&handle.path))
            .await
            .map_err(|e| internal("copying version into place", e))?;

        entry.active_version_id = Some(version_id.to_string());
        entry.updated_at = Some(Utc::now());
        manifest.upsert(entry, Some(&key_path));

        if let Err(e) = manifest::persist(&manifest_path, &manifest).await {
            swap.rollback().await;
            return Err(manifest_failure(e));
        }
        swap.commit().await;

        self.catalog.invalidate();
        info!("activated version {} of {}", version_id, key_path);
        Ok(())
    }

    /// Version history, newest first. Without an active-version pointer the
    /// live file is listed first as the `current` pseudo-version.
    pub async fn list_versions(
        &self,
        relative_path: &str,
        limit: usize,
    ) -> Result<Vec<VersionDescriptor>, WriteError> {
        let root = self.root().await?;
        let (_, manifest) = self.load_manifest(&root).await?;
        let key_path = crate::fsops::normalize_relative_path(relative_path);
        let entry = manifest.find(&key_path).cloned();
        let physical = safe_join(&root, &key_path).ok_or(WriteError::DocumentNotFound)?;
        let live = fs::metadata(&physical).await.ok().filter(|m| m.is_file());

        if entry.is_none() && live.is_none() {
            return Err(WriteError::DocumentNotFound);
        }
        let entry = entry.unwrap_or_else(|| ManifestEntry {
            file_name: Some(key_path.clone()),
            ..Default::default()
        });
        let active = entry.active_version_id.clone();

        let stored = self
            .store_for(&root)
            .list(&key_path, limit)
            .await
            .map_err(|e| internal("listing versions", e))?;

        let mut versions = Vec::with_capacity(stored.len() + 1);
        if active.is_none() {
            if let Some(meta) = &live {
                versions.push(current_descriptor(
                    &entry,
                    &key_path,
                    meta.len(),
                    meta.modified().ok().map(DateTime::<Utc>::from),
                    self.catalog.public_url(&key_path),
                ));
            }
        }
        versions.extend(stored.into_iter().map(|d| {
            let is_active = active.as_deref() == Some(d.version_id.as_str());
            d.with_active(is_active)
        }));
        if limit > 0 {
            versions.truncate(limit);
        }
        Ok(versions)
    }

    /// Resolve a version (or `current`) of a document to its bytes on disk.
    pub async fn open_version(
        &self,
        relative_path: &str,
        version_id: &str,
    ) -> Result<VersionHandle, WriteError> {
        let root = self.root().await?;
        let key_path = crate::fsops::normalize_relative_path(relative_path);

        if version_id == CURRENT_VERSION_ID {
            let physical = self
                .catalog
                .resolve_physical_path(&key_path)
                .await
                .ok_or(WriteError::DocumentNotFound)?;
            let meta = fs::metadata(&physical)
                .await
                .map_err(|e| internal("reading live file", e))?;
            let (_, manifest) = self.load_manifest(&root).await?;
            let entry = manifest.find(&key_path).cloned().unwrap_or_default();
            let descriptor = current_descriptor(
                &entry,
                &key_path,
                meta.len(),
                meta.modified().ok().map(DateTime::<Utc>::from),
                self.catalog.public_url(&key_path),
            );
            return Ok(VersionHandle {
                file_name: descriptor.file_name.clone(),
                path: physical,
                descriptor,
            });
        }

        let (_, manifest) = self.load_manifest(&root).await?;
        let entry = manifest.find(&key_path).cloned().unwrap_or_default();
        let active = entry.active_version_id.clone();
        let handle = self
            .store_for(&root)
            .try_get(&key_path, version_id)
            .await
            .map_err(|e| internal("looking up version", e))?
            .ok_or(WriteError::VersionNotFound)?;

        Ok(VersionHandle {
            descriptor: handle
                .descriptor
                .with_active(active.as_deref() == Some(version_id)),
            ..handle
        })
    }

    /// Next free sequence number for `doc_type`, from the manifest and the
    /// code directories under the root.
    pub async fn next_sequence_smart(&self, doc_type: &str) -> Result<u32, WriteError> {
        if !is_known_type(doc_type) {
            return Err(WriteError::UnknownDocumentType(doc_type.trim().to_string()));
        }
        let root = self.root().await?;
        let (_, manifest) = self.load_manifest(&root).await?;
        sequence_in(&root, &manifest, &normalize_type(doc_type))
            .await
            .map_err(|e| internal("allocating sequence number", e))
    }
}

/// Collect the codes of documents that still exist and pick the smallest
/// free sequence for `doc_type`.
///
/// Two sources: manifest entries whose live file is present, and top-level
/// directories named like a code that still hold a file outside their
/// history folder.
async fn sequence_in(root: &Path, manifest: &Manifest, doc_type: &str) -> anyhow::Result<u32> {
    let mut codes = BTreeSet::new();

    for entry in &manifest.documents {
        let (Some(code), Some(key)) = (entry.code(), entry.key()) else {
            continue;
        };
        let Some(path) = safe_join(root, &key) else {
            continue;
        };
        if fs::try_exists(&path).await.unwrap_or(false) {
            codes.insert(code);
        }
    }

    let mut dirs = fs::read_dir(root).await?;
    while let Some(dir) = dirs.next_entry().await? {
        let name = dir.file_name().to_string_lossy().to_string();
        let Some((t, seq)) = try_parse_code(&name) else {
            continue;
        };
        if !dir.file_type().await?.is_dir() {
            continue;
        }
        let code = format_code(t.as_str(), seq as i64).unwrap_or(name);
        if codes.contains(&code) {
            continue;
        }
        let path = dir.path();
        if tokio::task::spawn_blocking(move || holds_live_file(&path)).await? {
            codes.insert(code);
        }
    }

    Ok(next_sequence(codes.iter(), doc_type))
}

fn holds_live_file(dir: &Path) -> bool {
    WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0 || !(e.file_type().is_dir() && e.file_name().eq_ignore_ascii_case(HISTORY_DIR))
        })
        .filter_map(Result::ok)
        .any(|e| e.file_type().is_file())
}

fn current_descriptor(
    entry: &ManifestEntry,
    key_path: &str,
    size: u64,
    modified: Option<DateTime<Utc>>,
    url: String,
) -> VersionDescriptor {
    VersionDescriptor {
        version_id: CURRENT_VERSION_ID.to_string(),
        document_path: key_path.to_string(),
        file_name: key_path.rsplit('/').next().unwrap_or(key_path).to_string(),
        created_at: entry.updated_at.or(modified).unwrap_or_else(Utc::now),
        actor: entry.uploaded_by.clone(),
        comment: entry.comment.clone(),
        size,
        url: Some(url),
        is_active: true,
    }
}

fn apply_metadata(entry: &mut ManifestEntry, metadata: &DocumentMetadata) {
    let fields = [
        (&mut entry.display_name, &metadata.display_name),
        (&mut entry.line, &metadata.line),
        (&mut entry.station, &metadata.station),
        (&mut entry.model, &metadata.model),
        (&mut entry.machine_name, &metadata.machine_name),
        (&mut entry.comment, &metadata.comment),
    ];
    for (slot, value) in fields {
        if value.is_some() {
            *slot = clean(value);
        }
    }
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn stem_of(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => file_name.to_string(),
    }
}

fn internal(what: &str, err: impl Debug) -> WriteError {
    error!("{} failed: {:?}", what, err);
    WriteError::SaveFailed
}

fn manifest_failure(err: ManifestError) -> WriteError {
    error!("manifest operation failed: {:?}", err);
    err.into()
}
