//! Paged, filtered and sorted views over catalog records.
//!
//! Search filters travel between the presentation layer and the catalog as an
//! opaque token shaped like a URL query string
//! (`keyword=press&type=OI&line=L3`). [`SearchFilters::encode`] and
//! [`SearchFilters::decode`] round-trip it.

use std::cmp::Ordering;
use url::form_urlencoded;

use crate::models::{CatalogRecord, Page};

/// Page sizes offered to callers; any other request is snapped to one.
pub const ALLOWED_PAGE_SIZES: [usize; 4] = [10, 20, 50, 100];
pub const DEFAULT_PAGE_SIZE: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub keyword: Option<String>,
    pub doc_type: Option<String>,
    pub line: Option<String>,
    pub station: Option<String>,
    pub model: Option<String>,
    pub uploader: Option<String>,
}

impl SearchFilters {
    pub fn encode(&self) -> String {
        let mut out = form_urlencoded::Serializer::new(String::new());
        for (key, value) in self.pairs() {
            out.append_pair(key, value);
        }
        out.finish()
    }

    /// Parse a filter token. Unknown keys and blank values are ignored; keys
    /// are matched case-insensitively.
    pub fn decode(token: &str) -> Self {
        let mut filters = SearchFilters::default();
        for (key, value) in form_urlencoded::parse(token.trim_start_matches('?').as_bytes()) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            let slot = match key.to_ascii_lowercase().as_str() {
                "keyword" | "q" => &mut filters.keyword,
                "type" => &mut filters.doc_type,
                "line" => &mut filters.line,
                "station" => &mut filters.station,
                "model" => &mut filters.model,
                "uploader" => &mut filters.uploader,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
        filters
    }

    pub fn is_empty(&self) -> bool {
        self.pairs().next().is_none()
    }

    fn pairs(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("keyword", &self.keyword),
            ("type", &self.doc_type),
            ("line", &self.line),
            ("station", &self.station),
            ("model", &self.model),
            ("uploader", &self.uploader),
        ]
        .into_iter()
        .filter_map(|(k, v)| {
            v.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| (k, v))
        })
    }

    /// Classification fields match exactly (ignoring case); the keyword
    /// matches as a substring of any display field.
    pub fn matches(&self, record: &CatalogRecord) -> bool {
        let exact = |want: &Option<String>, have: &str| {
            want.as_deref()
                .map(|w| w.trim().eq_ignore_ascii_case(have.trim()))
                .unwrap_or(true)
        };

        if !(exact(&self.doc_type, &record.document_type)
            && exact(&self.line, &record.line)
            && exact(&self.station, &record.station)
            && exact(&self.model, &record.model)
            && exact(&self.uploader, &record.uploaded_by))
        {
            return false;
        }

        match self.keyword.as_deref().map(str::trim) {
            Some(kw) if !kw.is_empty() => {
                let kw = kw.to_lowercase();
                keyword_fields(record).any(|f| f.to_lowercase().contains(&kw))
            }
            _ => true,
        }
    }
}

fn keyword_fields(r: &CatalogRecord) -> impl Iterator<Item = &str> {
    [
        r.display_name.as_str(),
        r.file_name.as_str(),
        r.code.as_deref().unwrap_or(""),
        r.document_type.as_str(),
        r.line.as_str(),
        r.station.as_str(),
        r.model.as_str(),
        r.machine_name.as_str(),
        r.uploaded_by.as_str(),
        r.comment.as_str(),
    ]
    .into_iter()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortColumn {
    #[default]
    Time,
    Name,
    Code,
    Type,
    Line,
    Station,
    Model,
    Machine,
    Uploader,
    Version,
}

impl SortColumn {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim().to_ascii_lowercase().as_str() {
            "time" | "updated" | "updatedat" => SortColumn::Time,
            "name" | "displayname" => SortColumn::Name,
            "code" => SortColumn::Code,
            "type" => SortColumn::Type,
            "line" => SortColumn::Line,
            "station" => SortColumn::Station,
            "model" => SortColumn::Model,
            "machine" | "machinename" => SortColumn::Machine,
            "uploader" | "uploadedby" => SortColumn::Uploader,
            "version" => SortColumn::Version,
            _ => return None,
        })
    }

    /// Parse a request parameter, falling back to [`SortColumn::Time`].
    pub fn from_param(s: Option<&str>) -> Self {
        s.and_then(Self::parse).unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SortColumn::Time => "time",
            SortColumn::Name => "name",
            SortColumn::Code => "code",
            SortColumn::Type => "type",
            SortColumn::Line => "line",
            SortColumn::Station => "station",
            SortColumn::Model => "model",
            SortColumn::Machine => "machine",
            SortColumn::Uploader => "uploader",
            SortColumn::Version => "version",
        }
    }

    fn compare(&self, a: &CatalogRecord, b: &CatalogRecord) -> Ordering {
        let text = |x: &str, y: &str| x.to_lowercase().cmp(&y.to_lowercase());
        match self {
            // `None < Some(_)`: missing times sort as the minimum.
            SortColumn::Time => a.updated_at.cmp(&b.updated_at),
            SortColumn::Name => text(&a.display_name, &b.display_name),
            SortColumn::Code => text(
                a.code.as_deref().unwrap_or(""),
                b.code.as_deref().unwrap_or(""),
            ),
            SortColumn::Type => text(&a.document_type, &b.document_type),
            SortColumn::Line => text(&a.line, &b.line),
            SortColumn::Station => text(&a.station, &b.station),
            SortColumn::Model => text(&a.model, &b.model),
            SortColumn::Machine => text(&a.machine_name, &b.machine_name),
            SortColumn::Uploader => text(&a.uploaded_by, &b.uploaded_by),
            SortColumn::Version => a.version.cmp(&b.version),
        }
    }
}

/// Page numbers start at 1.
pub fn sanitize_page(page: i64) -> usize {
    page.max(1) as usize
}

/// Snap a requested page size to [`ALLOWED_PAGE_SIZES`].
///
/// Sizes outside `[10, 100]` become [`DEFAULT_PAGE_SIZE`]; sizes inside snap
/// to the nearest allowed value, the smaller one on a tie.
pub fn sanitize_page_size(size: i64) -> usize {
    let min = ALLOWED_PAGE_SIZES[0] as i64;
    let max = ALLOWED_PAGE_SIZES[ALLOWED_PAGE_SIZES.len() - 1] as i64;
    if size < min || size > max {
        return DEFAULT_PAGE_SIZE;
    }
    ALLOWED_PAGE_SIZES
        .iter()
        .copied()
        .min_by_key(|&a| ((a as i64 - size).abs(), a))
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

/// A sanitised page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
    pub filters: SearchFilters,
    pub sort: SortColumn,
    pub descending: bool,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            filters: SearchFilters::default(),
            sort: SortColumn::Time,
            descending: true,
        }
    }
}

impl PageRequest {
    pub fn new(
        page: i64,
        page_size: i64,
        filters: SearchFilters,
        sort: SortColumn,
        descending: bool,
    ) -> Self {
        Self {
            page: sanitize_page(page),
            page_size: sanitize_page_size(page_size),
            filters,
            sort,
            descending,
        }
    }

    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.page_size)
    }
}

/// Filter, stably sort and slice `records`.
pub fn page_of(records: &[CatalogRecord], request: &PageRequest) -> Page<CatalogRecord> {
    let mut matched: Vec<&CatalogRecord> = records
        .iter()
        .filter(|r| request.filters.matches(r))
        .collect();

    matched.sort_by(|a, b| {
        let ord = request.sort.compare(a, b);
        if request.descending {
            ord.reverse()
        } else {
            ord
        }
    });

    let total_count = matched.len();
    let items = matched
        .into_iter()
        .skip(request.offset())
        .take(request.page_size)
        .cloned()
        .collect();

    Page {
        items,
        page: request.page,
        page_size: request.page_size,
        total_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PLACEHOLDER;
    use chrono::{TimeZone, Utc};

    fn record(i: usize, line: &str) -> CatalogRecord {
        CatalogRecord {
            relative_path: format!("OI-{:04}/current/doc{}.pdf", i, i),
            file_name: format!("doc{}.pdf", i),
            display_name: format!("Doc {:02}", i),
            line: line.to_string(),
            station: "S1".into(),
            model: "M".into(),
            machine_name: PLACEHOLDER.into(),
            uploaded_by: "amy".into(),
            comment: String::new(),
            document_type: "OI".into(),
            sequence_number: Some(i as i64),
            code: Some(format!("OI-{:04}", i)),
            version: Some(1),
            active_version_id: None,
            updated_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(i as i64)),
            url: String::new(),
            in_manifest: true,
        }
    }

    #[test]
    fn test_filters_round_trip() {
        let f = SearchFilters {
            keyword: Some("press & punch".into()),
            doc_type: Some("WI".into()),
            line: Some("L3".into()),
            ..Default::default()
        };
        let token = f.encode();
        assert!(token.starts_with("keyword=press+%26+punch"));
        assert_eq!(SearchFilters::decode(&token), f);
        assert_eq!(SearchFilters::default().encode(), "");
    }

    #[test]
    fn test_decode_ignores_unknown_and_blank() {
        let f = SearchFilters::decode("?Type=oi&color=red&line=&Uploader=bo");
        assert_eq!(f.doc_type.as_deref(), Some("oi"));
        assert_eq!(f.uploader.as_deref(), Some("bo"));
        assert!(f.line.is_none());
        assert!(SearchFilters::decode("").is_empty());
    }

    #[test]
    fn test_matches() {
        let r = record(7, "Line 3");
        let f = SearchFilters::decode("line=line%203&type=oi");
        assert!(f.matches(&r));
        assert!(!SearchFilters::decode("line=Line").matches(&r));
        assert!(SearchFilters::decode("keyword=0007").matches(&r));
        assert!(SearchFilters::decode("keyword=DOC 07").matches(&r));
        assert!(!SearchFilters::decode("keyword=nothing").matches(&r));
    }

    #[test]
    fn test_sanitize_page_size() {
        assert_eq!(sanitize_page_size(10), 10);
        assert_eq!(sanitize_page_size(20), 20);
        assert_eq!(sanitize_page_size(14), 10);
        assert_eq!(sanitize_page_size(15), 10);
        assert_eq!(sanitize_page_size(16), 20);
        assert_eq!(sanitize_page_size(70), 50);
        assert_eq!(sanitize_page_size(100), 100);
        assert_eq!(sanitize_page_size(0), 20);
        assert_eq!(sanitize_page_size(5000), 20);
        assert_eq!(sanitize_page(-3), 1);
    }

    #[test]
    fn test_sort_column_parse() {
        assert_eq!(SortColumn::from_param(None), SortColumn::Time);
        assert_eq!(SortColumn::from_param(Some("bogus")), SortColumn::Time);
        assert_eq!(SortColumn::from_param(Some("Name")), SortColumn::Name);
        assert_eq!(SortColumn::parse("uploadedBy"), Some(SortColumn::Uploader));
    }

    #[test]
    fn test_page_two_is_records_eleven_to_twenty() {
        let records: Vec<_> = (1..=35).map(|i| record(i, "L1")).collect();
        let req = PageRequest::new(2, 10, SearchFilters::default(), SortColumn::Name, false);
        let page = page_of(&records, &req);
        assert_eq!(page.total_count, 35);
        let names: Vec<_> = page.items.iter().map(|r| r.display_name.clone()).collect();
        let expected: Vec<_> = (11..=20).map(|i| format!("Doc {:02}", i)).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_out_of_range_page_is_empty_with_total() {
        let records: Vec<_> = (1..=5).map(|i| record(i, "L1")).collect();
        let req = PageRequest::new(9, 20, SearchFilters::default(), SortColumn::Time, true);
        let page = page_of(&records, &req);
        assert!(page.items.is_empty());
        assert_eq!(page.total_count, 5);
    }

    #[test]
    fn test_time_sort_puts_missing_last_when_descending() {
        let mut records: Vec<_> = (1..=3).map(|i| record(i, "L1")).collect();
        records[1].updated_at = None;
        let page = page_of(&records, &PageRequest::default());
        let order: Vec<_> = page.items.iter().map(|r| r.sequence_number).collect();
        assert_eq!(order, vec![Some(3), Some(1), Some(2)]);
    }

    #[test]
    fn test_sort_is_stable_for_equal_keys() {
        let records: Vec<_> = (1..=6)
            .map(|i| record(i, if i % 2 == 0 { "B" } else { "a" }))
            .collect();
        let req = PageRequest::new(1, 10, SearchFilters::default(), SortColumn::Line, false);
        let page = page_of(&records, &req);
        let order: Vec<_> = page.items.iter().map(|r| r.sequence_number.unwrap()).collect();
        assert_eq!(order, vec![1, 3, 5, 2, 4, 6]);
    }
}
