//! Periodic reconciliation of the catalog into the relational index.
//!
//! A run reads the catalog's uncached source of truth, probes file sizes and
//! modification times with bounded concurrency, then walks the documents in
//! path order and writes only rows that are new or actually changed. Rows
//! whose path was not seen are deleted.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::DocumentCatalog;
use crate::config::LiveConfig;
use crate::fsops::{safe_join, BestEffort};
use crate::index_store::IndexStore;
use crate::models::{CatalogRecord, IndexReport, IndexRow};

pub struct Indexer {
    catalog: Arc<DocumentCatalog>,
    store: IndexStore,
    config: Arc<LiveConfig>,
}

struct Probed {
    record: CatalogRecord,
    size: Option<i64>,
    modified: Option<DateTime<Utc>>,
}

impl Indexer {
    pub fn new(catalog: Arc<DocumentCatalog>, store: IndexStore, config: Arc<LiveConfig>) -> Self {
        Self {
            catalog,
            store,
            config,
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    #[instrument(skip_all)]
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<IndexReport> {
        let started = Instant::now();
        let started_at = Utc::now().timestamp_millis();
        let config = self.config.current();
        let settings = &config.indexer;

        let scan = self.catalog.scan(cancel).await?;
        let Some(root) = scan.root.root.clone() else {
            warn!("index run skipped: {}", scan.root.describe());
            return Ok(IndexReport {
                skipped: true,
                started_at,
                ..Default::default()
            });
        };

        let documents: Vec<CatalogRecord> = scan
            .records
            .into_iter()
            .filter(|r| settings.allows_extension(&r.file_name))
            .collect();

        let mut existing = self.store.load_all().await?;

        let mut probed: Vec<Probed> = stream::iter(documents)
            .map(|record| probe(root.clone(), record))
            .buffer_unordered(settings.effective_parallelism())
            .collect()
            .await;
        probed.sort_by_cached_key(|p| p.record.relative_path.to_lowercase());

        let batch_size = settings.effective_batch_size();
        let mut report = IndexReport {
            processed: probed.len(),
            started_at,
            ..Default::default()
        };
        let mut seen = HashSet::with_capacity(probed.len());
        let mut pending = Vec::new();

        for p in &probed {
            if cancel.is_cancelled() {
                bail!("index run cancelled");
            }

            let key = p.record.relative_path.to_lowercase();
            let fresh = IndexRow::from_record(&p.record, p.size, p.modified, started_at);
            seen.insert(key.clone());

            match existing.get_mut(&key) {
                Some(row) => {
                    if row.apply_changes(&fresh) {
                        report.updated += 1;
                        pending.push(row.clone());
                    }
                }
                None => {
                    report.added += 1;
                    pending.push(fresh);
                }
            }

            if pending.len() >= batch_size {
                self.store.upsert_batch(&pending).await?;
                debug!("committed batch of {} rows", pending.len());
                pending.clear();
            }
        }
        self.store.upsert_batch(&pending).await?;

        let gone: Vec<String> = existing
            .iter()
            .filter(|(key, _)| !seen.contains(*key))
            .map(|(_, row)| row.path.clone())
            .collect();
        report.removed = gone.len();
        self.store.delete_paths(&gone).await?;

        if report.changed() {
            self.catalog.invalidate();
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.store.record_run(&report).await.best_effort("recording index run");

        info!(
            "index run: processed={} added={} updated={} removed={} in {}ms",
            report.processed, report.added, report.updated, report.removed, report.duration_ms
        );
        Ok(report)
    }

    /// Run until `cancel` fires, sleeping the configured interval between
    /// runs. The enabled flag and interval are re-read every iteration.
    pub async fn run_loop(&self, cancel: CancellationToken) {
        info!("indexer loop started");
        loop {
            let config = self.config.current();
            if config.indexer.enabled {
                if let Err(e) = self.run_once(&cancel).await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    error!("index run failed: {:#}", e);
                }
            } else {
                debug!("indexer disabled, skipping run");
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.indexer.interval()) => {}
            }
        }
        info!("indexer loop stopped");
    }
}

async fn probe(root: PathBuf, record: CatalogRecord) -> Probed {
    let meta = match safe_join(&root, &record.relative_path) {
        Some(path) => tokio::fs::metadata(&path).await.ok(),
        None => None,
    };
    if meta.is_none() {
        debug!("could not stat {}", record.relative_path);
    }
    Probed {
        size: meta.as_ref().map(|m| m.len() as i64),
        modified: meta
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from),
        record,
    }
}
