//! # OI/WI Catalog
//!
//! Document catalog, versioning and indexing for factory operation
//! instructions (OI) and work instructions (WI).
//!
//! Documents live in a shared directory tree described by a JSON manifest.
//! The read path merges the manifest with a directory walk and serves paged,
//! filtered listings from a short-lived cache. The write path allocates
//! codes, stores files under their code directory, snapshots history, and
//! keeps the manifest consistent with the files on disk. A background
//! indexer mirrors the catalog into SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Document root│──▶│   Catalog    │──▶│ Indexer  │──▶ SQLite
//! │ files + JSON │   │ merge+cache  │   │diff+batch│
//! └──────▲───────┘   └──────┬───────┘   └──────────┘
//!        │                  │
//!   ┌────┴─────┐      ┌─────┴────┐
//!   │ Service  │◀─────│ CLI/HTTP │
//!   │ (writes) │      │ (oiwi)   │
//!   └──────────┘      └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with live reload |
//! | [`numbering`] | Document types, codes and sequence allocation |
//! | [`manifest`] | JSON manifest load and atomic persist |
//! | [`fsops`] | Path hygiene and rollback-capable file replacement |
//! | [`versions`] | Keyed version store |
//! | [`share`] | Network share connection |
//! | [`catalog`] | Root resolution, merged listing and cache |
//! | [`query`] | Filters, sorting and paging |
//! | [`service`] | Upload, update and version activation |
//! | [`index_store`] | SQLite index table access |
//! | [`indexer`] | Periodic catalog to index reconciliation |
//! | [`status`] | Root, manifest and index health |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod fsops;
pub mod index_store;
pub mod indexer;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod numbering;
pub mod query;
pub mod server;
pub mod service;
pub mod share;
pub mod status;
pub mod versions;
