//! The JSON manifest that sits next to the documents.
//!
//! The manifest is hand-editable: the reader accepts `//` and `/* */`
//! comments, trailing commas and property names in any casing. The writer
//! emits indented camelCase JSON without null fields and replaces the file
//! through a temp file so readers never see a partial manifest.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::ManifestError;
use crate::fsops::{normalize_relative_path, same_relative_path, BestEffort};
use crate::numbering::{format_code, normalize_type};

/// Top-level manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub documents: Vec<ManifestEntry>,
}

/// Metadata for one document, keyed by `file_name` (root-relative path).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_version_id: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_lenient_timestamp"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

/// Canonical property names, used to map any casing found in the file.
const ENTRY_FIELDS: &[&str] = &[
    "fileName",
    "displayName",
    "line",
    "station",
    "model",
    "machineName",
    "uploadedBy",
    "comment",
    "documentType",
    "activeVersionId",
    "updatedAt",
    "sequenceNumber",
    "version",
];

impl ManifestEntry {
    /// Normalised root-relative path of the live file.
    pub fn key(&self) -> Option<String> {
        self.file_name
            .as_deref()
            .map(normalize_relative_path)
            .filter(|k| !k.is_empty())
    }

    /// Normalised document type ("" when unclassified).
    pub fn doc_type(&self) -> String {
        normalize_type(self.document_type.as_deref().unwrap_or(""))
    }

    /// `OI-0001` style code, when the entry has a known type and sequence.
    pub fn code(&self) -> Option<String> {
        format_code(&self.doc_type(), self.sequence_number?)
    }
}

impl Manifest {
    pub fn find(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.documents.iter().find(|e| {
            e.file_name
                .as_deref()
                .map(|f| same_relative_path(f, relative_path))
                .unwrap_or(false)
        })
    }

    pub fn find_mut(&mut self, relative_path: &str) -> Option<&mut ManifestEntry> {
        self.documents.iter_mut().find(|e| {
            e.file_name
                .as_deref()
                .map(|f| same_relative_path(f, relative_path))
                .unwrap_or(false)
        })
    }

    /// Insert or replace the entry with the same path, then re-sort.
    ///
    /// `previous_path` names the key the entry was stored under before, for
    /// updates that move the live file.
    pub fn upsert(&mut self, entry: ManifestEntry, previous_path: Option<&str>) {
        let lookup = previous_path
            .map(str::to_string)
            .or_else(|| entry.file_name.clone())
            .unwrap_or_default();

        match self.find_mut(&lookup) {
            Some(existing) => *existing = entry,
            None => self.documents.push(entry),
        }
        self.sort();
    }

    /// Deterministic output order: type, sequence, display name.
    pub fn sort(&mut self) {
        self.documents.sort_by(|a, b| {
            a.doc_type()
                .cmp(&b.doc_type())
                .then(a.sequence_number.cmp(&b.sequence_number))
                .then_with(|| {
                    let an = a.display_name.as_deref().unwrap_or("").to_lowercase();
                    let bn = b.display_name.as_deref().unwrap_or("").to_lowercase();
                    an.cmp(&bn)
                })
        });
    }
}

/// Path of the manifest for a document root.
pub fn manifest_path(root: &Path, manifest_name: &str) -> PathBuf {
    root.join(manifest_name)
}

/// Read the manifest at `path`.
///
/// A missing file is an empty manifest. A file that exists but cannot be
/// read or parsed is an error; callers must not continue with partial data.
pub async fn load(path: &Path) -> Result<Manifest, ManifestError> {
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("no manifest at {}, starting empty", path.display());
            return Ok(Manifest::default());
        }
        Err(e) => {
            return Err(ManifestError::Unreadable {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    let text = String::from_utf8(bytes).map_err(|e| ManifestError::NotUtf8 {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse(&text).map_err(|e| ManifestError::Corrupt {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Parse manifest text, tolerating comments, trailing commas and any casing
/// of property names.
pub fn parse(text: &str) -> Result<Manifest, serde_json::Error> {
    let cleaned = strip_json_extensions(text.trim_start_matches('\u{feff}'));
    if cleaned.trim().is_empty() {
        return Ok(Manifest::default());
    }

    let mut value: Value = serde_json::from_str(&cleaned)?;
    if let Value::Object(top) = &mut value {
        canonicalize_keys(top, &["documents"]);
        if let Some(Value::Array(docs)) = top.get_mut("documents") {
            for doc in docs.iter_mut() {
                if let Value::Object(fields) = doc {
                    canonicalize_keys(fields, ENTRY_FIELDS);
                }
            }
        }
    }
    serde_json::from_value(value)
}

/// Write the manifest so that `path` is either the old or the new content.
///
/// The JSON goes to a temp file beside the manifest, which is then renamed
/// over it. On failure the temp file is removed and the original manifest is
/// left untouched.
pub async fn persist(path: &Path, manifest: &Manifest) -> Result<(), ManifestError> {
    let write_err = |source: std::io::Error| ManifestError::Write {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

    let temp = temp_path(path);
    let result = async {
        fs::write(&temp, &json).await?;
        fs::rename(&temp, path).await
    }
    .await;

    if let Err(e) = result {
        if fs::metadata(&temp).await.map(|m| m.is_file()).unwrap_or(false) {
            fs::remove_file(&temp)
                .await
                .best_effort("removing manifest temp file");
        }
        return Err(write_err(e));
    }

    debug!(
        "manifest written: {} ({} documents)",
        path.display(),
        manifest.documents.len()
    );
    Ok(())
}

/// The temp file used while persisting the manifest at `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn canonicalize_keys(map: &mut Map<String, Value>, canonical: &[&str]) {
    let renames: Vec<(String, &str)> = map
        .keys()
        .filter_map(|k| {
            canonical
                .iter()
                .find(|c| c.eq_ignore_ascii_case(k) && **c != k.as_str())
                .map(|c| (k.clone(), *c))
        })
        .collect();

    for (from, to) in renames {
        if let Some(v) = map.remove(&from) {
            map.entry(to.to_string()).or_insert(v);
        }
    }
}

/// Remove `//` and `/* */` comments and trailing commas outside of strings.
fn strip_json_extensions(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];

        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            ',' => {
                // A comma directly before a closing bracket is dropped. Comments
                // between them were not stripped yet, so look past those too.
                let next = next_significant(&chars, i + 1);
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn next_significant(chars: &[char], mut j: usize) -> Option<char> {
    loop {
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        match (chars.get(j), chars.get(j + 1)) {
            (Some('/'), Some('/')) => {
                while j < chars.len() && chars[j] != '\n' {
                    j += 1;
                }
            }
            (Some('/'), Some('*')) => {
                j += 2;
                while j < chars.len() && !(chars[j] == '*' && chars.get(j + 1) == Some(&'/')) {
                    j += 1;
                }
                j += 2;
            }
            (c, _) => return c.copied(),
        }
    }
}

fn deserialize_lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|n| n.and_utc())
}
