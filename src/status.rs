//! Health of the document root, manifest and index.

use serde::Serialize;
use std::path::PathBuf;

use crate::catalog::{DocumentCatalog, RootResolution, RootState};
use crate::config::Config;
use crate::index_store::IndexStore;
use crate::manifest;
use crate::models::IndexReport;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestStatus {
    pub path: Option<PathBuf>,
    pub documents: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub version: &'static str,
    pub root: RootResolution,
    pub manifest: ManifestStatus,
    pub indexer_enabled: bool,
    pub indexed_rows: Option<i64>,
    pub last_run: Option<IndexReport>,
}

impl StatusReport {
    pub fn healthy(&self) -> bool {
        self.root.state != RootState::Missing && self.manifest.error.is_none()
    }
}

/// Gather the status report. Nothing here fails: problems become fields.
pub async fn collect_status(
    config: &Config,
    catalog: &DocumentCatalog,
    store: Option<&IndexStore>,
) -> StatusReport {
    let root = catalog.resolve_root().await;

    let manifest = match &root.root {
        Some(dir) => {
            let path = manifest::manifest_path(dir, catalog.manifest_name());
            match manifest::load(&path).await {
                Ok(m) => ManifestStatus {
                    path: Some(path),
                    documents: Some(m.documents.len()),
                    error: None,
                },
                Err(e) => ManifestStatus {
                    path: Some(path),
                    documents: None,
                    error: Some(format!("{:#}", anyhow::Error::from(e))),
                },
            }
        }
        None => ManifestStatus {
            path: None,
            documents: None,
            error: None,
        },
    };

    let (indexed_rows, last_run) = match store {
        Some(store) => (
            store.count().await.ok(),
            store.last_run().await.ok().flatten(),
        ),
        None => (None, None),
    };

    StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        root,
        manifest,
        indexer_enabled: config.indexer.enabled,
        indexed_rows,
        last_run,
    }
}

pub fn print_status(report: &StatusReport) {
    let state = match report.root.state {
        RootState::Primary => "OK",
        RootState::Fallback => "FALLBACK",
        RootState::Missing => "MISSING",
    };

    println!("{:<16} {:<10} DETAIL", "COMPONENT", "STATUS");
    println!("{:<16} {:<10} {}", "root", state, report.root.describe());
    if let Some(diag) = &report.root.share_diagnostic {
        println!("{:<16} {:<10} {}", "share", "ERROR", diag);
    }

    match (&report.manifest.documents, &report.manifest.error) {
        (_, Some(err)) => println!("{:<16} {:<10} {}", "manifest", "ERROR", err),
        (Some(n), None) => println!("{:<16} {:<10} {} documents", "manifest", "OK", n),
        (None, None) => println!("{:<16} {:<10} -", "manifest", "UNKNOWN"),
    }

    let indexer = if report.indexer_enabled { "ENABLED" } else { "DISABLED" };
    let rows = report
        .indexed_rows
        .map(|n| format!("{} rows", n))
        .unwrap_or_else(|| "index not initialised".to_string());
    println!("{:<16} {:<10} {}", "indexer", indexer, rows);

    if let Some(run) = &report.last_run {
        println!(
            "{:<16} {:<10} processed={} added={} updated={} removed={}",
            "last run", "", run.processed, run.added, run.updated, run.removed
        );
    }
}
