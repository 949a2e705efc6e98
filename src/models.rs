//! Core data models shared by the catalog, indexer and HTTP surface.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Placeholder shown for metadata of files that have no manifest entry.
pub const PLACEHOLDER: &str = "-";

/// One document as seen by the read path: manifest metadata merged with
/// filesystem facts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRecord {
    /// Normalised root-relative path; the record's identity.
    pub relative_path: String,
    pub file_name: String,
    pub display_name: String,
    pub line: String,
    pub station: String,
    pub model: String,
    pub machine_name: String,
    pub uploaded_by: String,
    pub comment: String,
    /// `OI`, `WI`, or empty when unclassified.
    pub document_type: String,
    pub sequence_number: Option<i64>,
    pub code: Option<String>,
    pub version: Option<i64>,
    pub active_version_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub url: String,
    /// False for records synthesised from the directory walk.
    pub in_manifest: bool,
}

/// A row of the relational index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub path: String,
    pub file_name: String,
    pub display_name: String,
    pub document_type: String,
    pub code: Option<String>,
    pub sequence_number: Option<i64>,
    pub line: String,
    pub station: String,
    pub model: String,
    pub machine_name: String,
    pub uploaded_by: String,
    pub comment: String,
    pub version: Option<i64>,
    pub active_version_id: Option<String>,
    pub url: String,
    pub file_size: Option<i64>,
    /// Unix milliseconds of `updated_at`; 0 when unknown.
    pub updated_ticks: i64,
    pub last_indexed_at: i64,
}

impl IndexRow {
    /// Project a catalog record plus probed file facts into a row.
    pub fn from_record(
        record: &CatalogRecord,
        file_size: Option<i64>,
        modified: Option<DateTime<Utc>>,
        indexed_at: i64,
    ) -> Self {
        let updated = record.updated_at.or(modified);
        IndexRow {
            path: record.relative_path.clone(),
            file_name: record.file_name.clone(),
            display_name: record.display_name.clone(),
            document_type: record.document_type.clone(),
            code: record.code.clone(),
            sequence_number: record.sequence_number,
            line: record.line.clone(),
            station: record.station.clone(),
            model: record.model.clone(),
            machine_name: record.machine_name.clone(),
            uploaded_by: record.uploaded_by.clone(),
            comment: record.comment.clone(),
            version: record.version,
            active_version_id: record.active_version_id.clone(),
            url: record.url.clone(),
            file_size,
            updated_ticks: updated.map(|t| t.timestamp_millis()).unwrap_or(0),
            last_indexed_at: indexed_at,
        }
    }

    /// Copy every indexed field that differs from `fresh` into `self`.
    /// Returns whether anything changed; `last_indexed_at` is not compared.
    pub fn apply_changes(&mut self, fresh: &IndexRow) -> bool {
        let mut changed = false;

        macro_rules! sync {
            ($($field:ident),*) => {
                $(
                    if self.$field != fresh.$field {
                        self.$field = fresh.$field.clone();
                        changed = true;
                    }
                )*
            };
        }

        sync!(
            file_name,
            display_name,
            document_type,
            code,
            sequence_number,
            line,
            station,
            model,
            machine_name,
            uploaded_by,
            comment,
            version,
            active_version_id,
            url,
            file_size,
            updated_ticks
        );

        if changed {
            self.last_indexed_at = fresh.last_indexed_at;
        }
        changed
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        if self.updated_ticks == 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.updated_ticks)
    }
}

/// Counts from one indexer run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexReport {
    pub processed: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    /// The run did nothing because the document root was unavailable.
    pub skipped: bool,
    /// Unix milliseconds.
    pub started_at: i64,
    pub duration_ms: u64,
}

impl IndexReport {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// One page of a filtered, sorted sequence.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_count: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        self.total_count.div_ceil(self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> CatalogRecord {
        CatalogRecord {
            relative_path: "OI-0001/current/press.pdf".into(),
            file_name: "press.pdf".into(),
            display_name: "Press".into(),
            line: "L1".into(),
            station: "S1".into(),
            model: "M1".into(),
            machine_name: PLACEHOLDER.into(),
            uploaded_by: "amy".into(),
            comment: String::new(),
            document_type: "OI".into(),
            sequence_number: Some(1),
            code: Some("OI-0001".into()),
            version: Some(1),
            active_version_id: None,
            updated_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()),
            url: "/files/OI-0001/current/press.pdf".into(),
            in_manifest: true,
        }
    }

    #[test]
    fn test_from_record_prefers_manifest_time() {
        let r = record();
        let disk = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let row = IndexRow::from_record(&r, Some(10), Some(disk), 99);
        assert_eq!(row.updated_at(), r.updated_at);

        let mut r2 = r.clone();
        r2.updated_at = None;
        let row = IndexRow::from_record(&r2, None, Some(disk), 99);
        assert_eq!(row.updated_at(), Some(disk));

        let row = IndexRow::from_record(&r2, None, None, 99);
        assert_eq!(row.updated_ticks, 0);
        assert_eq!(row.updated_at(), None);
    }

    #[test]
    fn test_apply_changes_only_marks_real_changes() {
        let r = record();
        let mut existing = IndexRow::from_record(&r, Some(10), None, 1);
        let same = IndexRow::from_record(&r, Some(10), None, 2);
        assert!(!existing.apply_changes(&same));
        assert_eq!(existing.last_indexed_at, 1);

        let mut changed = r.clone();
        changed.display_name = "Press v2".into();
        let fresh = IndexRow::from_record(&changed, Some(12), None, 3);
        assert!(existing.apply_changes(&fresh));
        assert_eq!(existing.display_name, "Press v2");
        assert_eq!(existing.file_size, Some(12));
        assert_eq!(existing.last_indexed_at, 3);
    }

    #[test]
    fn test_total_pages() {
        let p: Page<u8> = Page {
            items: vec![],
            page: 1,
            page_size: 20,
            total_count: 41,
        };
        assert_eq!(p.total_pages(), 3);
    }
}
