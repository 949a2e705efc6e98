//! # OI/WI Catalog CLI (`oiwi`)
//!
//! ## Usage
//!
//! ```bash
//! oiwi --config ./config/oiwi.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `oiwi init` | Create the index database and run schema migrations |
//! | `oiwi status` | Show root, manifest and index health |
//! | `oiwi index` | Reconcile the catalog into the index once (or `--watch`) |
//! | `oiwi list` | Print one page of the catalog |
//! | `oiwi upload <file> --type OI` | Add a new document |
//! | `oiwi update <path>` | Replace content and/or metadata |
//! | `oiwi versions <path>` | Show version history |
//! | `oiwi activate <path> <id>` | Make a stored version live |
//! | `oiwi next-code <type>` | Show the code the next upload would get |
//! | `oiwi serve` | Start the HTTP server and background indexer |

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use oiwi_catalog::catalog::DocumentCatalog;
use oiwi_catalog::config::{load_config, LiveConfig};
use oiwi_catalog::db;
use oiwi_catalog::error::WriteError;
use oiwi_catalog::index_store::IndexStore;
use oiwi_catalog::indexer::Indexer;
use oiwi_catalog::migrate::{migrate_pool, run_migrations};
use oiwi_catalog::numbering::{format_code, normalize_type};
use oiwi_catalog::query::{PageRequest, SearchFilters, SortColumn, DEFAULT_PAGE_SIZE};
use oiwi_catalog::server::run_server;
use oiwi_catalog::service::{DocumentMetadata, DocumentService, NewContent, UpdateRequest, UploadRequest};
use oiwi_catalog::status::{collect_status, print_status};

/// OI/WI document catalog: upload, version and index instruction documents.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(name = "oiwi", version, about = "OI/WI document catalog")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/oiwi.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Free-text metadata flags shared by `upload` and `update`.
#[derive(clap::Args, Default)]
struct MetadataArgs {
    /// Title shown in listings.
    #[arg(long)]
    display_name: Option<String>,
    #[arg(long)]
    line: Option<String>,
    #[arg(long)]
    station: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Required for WI uploads.
    #[arg(long)]
    machine_name: Option<String>,
    #[arg(long)]
    comment: Option<String>,
}

impl From<MetadataArgs> for DocumentMetadata {
    fn from(args: MetadataArgs) -> Self {
        DocumentMetadata {
            display_name: args.display_name,
            line: args.line,
            station: args.station,
            model: args.model,
            machine_name: args.machine_name,
            comment: args.comment,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index database schema. Safe to run repeatedly.
    Init,

    /// Show document root, manifest and index status.
    Status,

    /// Reconcile the catalog into the index.
    Index {
        /// Keep running on the configured interval until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },

    /// Print one page of the catalog.
    List {
        #[arg(long, default_value_t = 1)]
        page: i64,

        /// One of 10, 20, 50 or 100.
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE as i64)]
        page_size: i64,

        /// Substring matched against names, code and metadata.
        #[arg(long)]
        keyword: Option<String>,

        /// `OI` or `WI`.
        #[arg(long = "type")]
        doc_type: Option<String>,

        #[arg(long)]
        line: Option<String>,

        #[arg(long)]
        station: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        uploader: Option<String>,

        /// Sort column: time, name, code, type, line, station, model,
        /// machine, uploader, version.
        #[arg(long)]
        sort: Option<String>,

        /// Sort ascending instead of descending.
        #[arg(long)]
        asc: bool,

        /// Read from the SQLite index instead of the live catalog.
        #[arg(long)]
        from_index: bool,
    },

    /// Upload a new document and allocate its code.
    Upload {
        /// Local file to upload.
        file: PathBuf,

        /// Document type, `OI` or `WI`.
        #[arg(long = "type")]
        doc_type: String,

        /// Stored file name; defaults to the local file name.
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        by: Option<String>,

        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Update a document's metadata and optionally replace its content.
    Update {
        /// Root-relative path of the document.
        path: String,

        /// Replacement content.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Must match the stored type when given.
        #[arg(long = "type")]
        doc_type: Option<String>,

        #[arg(long)]
        by: Option<String>,

        #[command(flatten)]
        metadata: MetadataArgs,
    },

    /// Show the version history of a document.
    Versions {
        path: String,

        /// Maximum entries; 0 lists everything.
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Make a stored version the live content.
    Activate {
        path: String,
        version_id: String,

        #[arg(long)]
        by: Option<String>,
    },

    /// Print the code the next upload of a type would receive.
    NextCode {
        /// `OI` or `WI`.
        doc_type: String,
    },

    /// Start the HTTP server and the background indexer.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            let cfg = load_config(&cli.config)?;
            run_migrations(&cfg).await?;
            println!("Database initialized at {}", cfg.db.path.display());
        }
        Commands::Status => {
            let cfg = load_config(&cli.config)?;
            let catalog = DocumentCatalog::new(&cfg)?;
            let store = match db::connect(&cfg).await {
                Ok(pool) => match migrate_pool(&pool).await {
                    Ok(()) => Some(IndexStore::new(pool)),
                    Err(_) => None,
                },
                Err(_) => None,
            };
            let report = collect_status(&cfg, &catalog, store.as_ref()).await;
            print_status(&report);
            if !report.healthy() {
                std::process::exit(1);
            }
        }
        Commands::Index { watch } => {
            let live = Arc::new(LiveConfig::from_file(&cli.config)?);
            let cfg = live.current();
            let pool = db::connect(&cfg).await?;
            migrate_pool(&pool).await?;
            let catalog = Arc::new(DocumentCatalog::new(&cfg)?);
            let indexer = Indexer::new(catalog, IndexStore::new(pool), live);
            let cancel = shutdown_token();

            if watch {
                indexer.run_loop(cancel).await;
            } else {
                let report = indexer.run_once(&cancel).await?;
                if report.skipped {
                    println!("Index run skipped: document root unavailable");
                } else {
                    println!(
                        "Indexed {} documents: {} added, {} updated, {} removed ({}ms)",
                        report.processed,
                        report.added,
                        report.updated,
                        report.removed,
                        report.duration_ms
                    );
                }
            }
        }
        Commands::List {
            page,
            page_size,
            keyword,
            doc_type,
            line,
            station,
            model,
            uploader,
            sort,
            asc,
            from_index,
        } => {
            let cfg = load_config(&cli.config)?;
            let request = PageRequest::new(
                page,
                page_size,
                SearchFilters {
                    keyword,
                    doc_type,
                    line,
                    station,
                    model,
                    uploader,
                },
                SortColumn::from_param(sort.as_deref()),
                !asc,
            );

            if from_index {
                let pool = db::connect(&cfg).await?;
                migrate_pool(&pool).await?;
                let result = IndexStore::new(pool).page(&request).await?;
                print_header();
                for row in &result.items {
                    print_row(
                        row.code.as_deref(),
                        &row.document_type,
                        row.version,
                        &row.display_name,
                        &row.path,
                    );
                }
                print_footer(result.page, result.total_pages(), result.total_count);
            } else {
                let catalog = DocumentCatalog::new(&cfg)?;
                let result = catalog.page(&request).await?;
                print_header();
                for rec in &result.items {
                    print_row(
                        rec.code.as_deref(),
                        &rec.document_type,
                        rec.version,
                        &rec.display_name,
                        &rec.relative_path,
                    );
                }
                print_footer(result.page, result.total_pages(), result.total_count);
            }
        }
        Commands::Upload {
            file,
            doc_type,
            name,
            by,
            metadata,
        } => {
            let service = service_for(&cli.config)?;
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let file_name = match name {
                Some(n) => n,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
            };
            let outcome = service
                .upload(UploadRequest {
                    document_type: doc_type,
                    file_name,
                    content,
                    metadata: metadata.into(),
                    uploaded_by: by,
                })
                .await
                .map_err(write_failed)?;
            println!("Uploaded {} -> {}", outcome.code, outcome.relative_path);
        }
        Commands::Update {
            path,
            file,
            doc_type,
            by,
            metadata,
        } => {
            let service = service_for(&cli.config)?;
            let content = match file {
                Some(file) => Some(NewContent {
                    file_name: file.file_name().map(|n| n.to_string_lossy().to_string()),
                    bytes: tokio::fs::read(&file)
                        .await
                        .with_context(|| format!("Failed to read {}", file.display()))?,
                }),
                None => None,
            };
            let outcome = service
                .update(UpdateRequest {
                    relative_path: path,
                    document_type: doc_type,
                    metadata: metadata.into(),
                    content,
                    updated_by: by,
                })
                .await
                .map_err(write_failed)?;
            println!("Updated {} (version {})", outcome.relative_path, outcome.version);
        }
        Commands::Versions { path, limit } => {
            let service = service_for(&cli.config)?;
            let versions = service
                .list_versions(&path, limit)
                .await
                .map_err(write_failed)?;
            println!("{:<24} {:<6} {:<20} {:<12} COMMENT", "VERSION", "ACTIVE", "CREATED", "BY");
            for v in &versions {
                println!(
                    "{:<24} {:<6} {:<20} {:<12} {}",
                    v.version_id,
                    if v.is_active { "*" } else { "" },
                    v.created_at.format("%Y-%m-%d %H:%M:%S"),
                    v.actor.as_deref().unwrap_or("-"),
                    v.comment.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Activate {
            path,
            version_id,
            by,
        } => {
            let service = service_for(&cli.config)?;
            service
                .set_active_version(&path, &version_id, by.as_deref())
                .await
                .map_err(write_failed)?;
            println!("Activated version {} of {}", version_id, path);
        }
        Commands::NextCode { doc_type } => {
            let service = service_for(&cli.config)?;
            let seq = service
                .next_sequence_smart(&doc_type)
                .await
                .map_err(write_failed)?;
            match format_code(&normalize_type(&doc_type), seq as i64) {
                Some(code) => println!("{}", code),
                None => bail!("unknown document type: {}", doc_type),
            }
        }
        Commands::Serve => {
            let live = Arc::new(LiveConfig::from_file(&cli.config)?);
            run_server(live, shutdown_token()).await?;
        }
    }

    Ok(())
}

fn service_for(config_path: &std::path::Path) -> anyhow::Result<DocumentService> {
    let cfg = load_config(config_path)?;
    let catalog = Arc::new(DocumentCatalog::new(&cfg)?);
    Ok(DocumentService::new(catalog))
}

fn write_failed(err: WriteError) -> anyhow::Error {
    anyhow::anyhow!("{} ({})", err, err.code())
}

/// A token cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            trigger.cancel();
        }
    });
    token
}

fn print_header() {
    println!("{:<10} {:<4} {:<4} {:<32} PATH", "CODE", "TYPE", "VER", "NAME");
}

fn print_row(code: Option<&str>, doc_type: &str, version: Option<i64>, name: &str, path: &str) {
    println!(
        "{:<10} {:<4} {:<4} {:<32} {}",
        code.unwrap_or("-"),
        if doc_type.is_empty() { "-" } else { doc_type },
        version.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
        name,
        path
    );
}

fn print_footer(page: usize, total_pages: usize, total: usize) {
    println!("page {}/{} ({} documents)", page, total_pages.max(1), total);
}
