//! SQLite persistence of the relational index.
//!
//! Rows are keyed by document path (case-insensitive). Only the indexer
//! writes here; [`IndexStore::page`] serves the same filters, sorting and
//! paging as the in-memory catalog view.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

use crate::models::{IndexReport, IndexRow, Page};
use crate::query::{PageRequest, SearchFilters, SortColumn};

const COLUMNS: &str = "path, file_name, display_name, document_type, code, sequence_number, \
     line, station, model, machine_name, uploaded_by, comment, version, active_version_id, \
     url, file_size, updated_ticks, last_indexed_at";

#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Every row, keyed by lower-cased path.
    pub async fn load_all(&self) -> Result<HashMap<String, IndexRow>> {
        let rows = sqlx::query(&format!("SELECT {} FROM catalog_index", COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(row_to_index)
            .map(|r| (r.path.to_lowercase(), r))
            .collect())
    }

    /// Write one batch of upserts in a single transaction.
    pub async fn upsert_batch(&self, rows: &[IndexRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO catalog_index (path, file_name, display_name, document_type, code,
                    sequence_number, line, station, model, machine_name, uploaded_by, comment,
                    version, active_version_id, url, file_size, updated_ticks, last_indexed_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(path) DO UPDATE SET
                    file_name = excluded.file_name,
                    display_name = excluded.display_name,
                    document_type = excluded.document_type,
                    code = excluded.code,
                    sequence_number = excluded.sequence_number,
                    line = excluded.line,
                    station = excluded.station,
                    model = excluded.model,
                    machine_name = excluded.machine_name,
                    uploaded_by = excluded.uploaded_by,
                    comment = excluded.comment,
                    version = excluded.version,
                    active_version_id = excluded.active_version_id,
                    url = excluded.url,
                    file_size = excluded.file_size,
                    updated_ticks = excluded.updated_ticks,
                    last_indexed_at = excluded.last_indexed_at
                "#,
            )
            .bind(&row.path)
            .bind(&row.file_name)
            .bind(&row.display_name)
            .bind(&row.document_type)
            .bind(&row.code)
            .bind(row.sequence_number)
            .bind(&row.line)
            .bind(&row.station)
            .bind(&row.model)
            .bind(&row.machine_name)
            .bind(&row.uploaded_by)
            .bind(&row.comment)
            .bind(row.version)
            .bind(&row.active_version_id)
            .bind(&row.url)
            .bind(row.file_size)
            .bind(row.updated_ticks)
            .bind(row.last_indexed_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for path in paths {
            sqlx::query("DELETE FROM catalog_index WHERE path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM catalog_index")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn page(&self, request: &PageRequest) -> Result<Page<IndexRow>> {
        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM catalog_index WHERE 1 = 1");
        push_filters(&mut count, &request.filters);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM catalog_index WHERE 1 = 1", COLUMNS));
        push_filters(&mut select, &request.filters);
        let direction = if request.descending { "DESC" } else { "ASC" };
        select.push(format!(
            " ORDER BY {} {}, path COLLATE NOCASE ASC LIMIT ",
            order_expr(request.sort),
            direction
        ));
        select.push_bind(request.page_size as i64);
        select.push(" OFFSET ");
        select.push_bind(request.offset() as i64);

        let rows = select.build().fetch_all(&self.pool).await?;
        Ok(Page {
            items: rows.iter().map(row_to_index).collect(),
            page: request.page,
            page_size: request.page_size,
            total_count: total.max(0) as usize,
        })
    }

    pub async fn record_run(&self, report: &IndexReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO index_runs (started_at, duration_ms, processed, added, updated, removed) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(report.started_at)
        .bind(report.duration_ms as i64)
        .bind(report.processed as i64)
        .bind(report.added as i64)
        .bind(report.updated as i64)
        .bind(report.removed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_run(&self) -> Result<Option<IndexReport>> {
        let row = sqlx::query(
            "SELECT started_at, duration_ms, processed, added, updated, removed \
             FROM index_runs ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| IndexReport {
            started_at: r.get("started_at"),
            duration_ms: r.get::<i64, _>("duration_ms").max(0) as u64,
            processed: r.get::<i64, _>("processed").max(0) as usize,
            added: r.get::<i64, _>("added").max(0) as usize,
            updated: r.get::<i64, _>("updated").max(0) as usize,
            removed: r.get::<i64, _>("removed").max(0) as usize,
            skipped: false,
        }))
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &SearchFilters) {
    let exact = [
        ("document_type", &filters.doc_type),
        ("line", &filters.line),
        ("station", &filters.station),
        ("model", &filters.model),
        ("uploaded_by", &filters.uploader),
    ];
    for (column, value) in exact {
        if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            qb.push(format!(" AND TRIM({}) = ", column));
            qb.push_bind(v.to_string());
            qb.push(" COLLATE NOCASE");
        }
    }

    if let Some(kw) = filters
        .keyword
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        let pattern = format!("%{}%", escape_like(kw));
        qb.push(" AND (");
        let fields = [
            "display_name",
            "file_name",
            "COALESCE(code, '')",
            "document_type",
            "line",
            "station",
            "model",
            "machine_name",
            "uploaded_by",
            "comment",
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push(format!("{} LIKE ", field));
            qb.push_bind(pattern.clone());
            qb.push(" ESCAPE '\\'");
        }
        qb.push(")");
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn order_expr(column: SortColumn) -> &'static str {
    match column {
        SortColumn::Time => "updated_ticks",
        SortColumn::Name => "display_name COLLATE NOCASE",
        SortColumn::Code => "COALESCE(code, '') COLLATE NOCASE",
        SortColumn::Type => "document_type COLLATE NOCASE",
        SortColumn::Line => "line COLLATE NOCASE",
        SortColumn::Station => "station COLLATE NOCASE",
        SortColumn::Model => "model COLLATE NOCASE",
        SortColumn::Machine => "machine_name COLLATE NOCASE",
        SortColumn::Uploader => "uploaded_by COLLATE NOCASE",
        SortColumn::Version => "COALESCE(version, 0)",
    }
}

fn row_to_index(row: &SqliteRow) -> IndexRow {
    IndexRow {
        path: row.get("path"),
        file_name: row.get("file_name"),
        display_name: row.get("display_name"),
        document_type: row.get("document_type"),
        code: row.get("code"),
        sequence_number: row.get("sequence_number"),
        line: row.get("line"),
        station: row.get("station"),
        model: row.get("model"),
        machine_name: row.get("machine_name"),
        uploaded_by: row.get("uploaded_by"),
        comment: row.get("comment"),
        version: row.get("version"),
        active_version_id: row.get("active_version_id"),
        url: row.get("url"),
        file_size: row.get("file_size"),
        updated_ticks: row.get("updated_ticks"),
        last_indexed_at: row.get("last_indexed_at"),
    }
}
