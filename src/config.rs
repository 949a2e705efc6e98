use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Lower bound on the indexer interval.
pub const MIN_INDEX_INTERVAL_SECS: u64 = 30;
pub const MIN_BATCH_SIZE: usize = 50;
pub const MAX_BATCH_SIZE: usize = 2000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub documents: DocumentsConfig,
    #[serde(default)]
    pub share: ShareConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Wall-clock limit for "refresh index + fetch page".
    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            page_timeout_secs: default_page_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_page_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentsConfig {
    /// Preferred document root. May be a UNC path when `[share]` is enabled.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Fallback root, resolved under `content_root`.
    #[serde(default)]
    pub relative_root: Option<PathBuf>,
    #[serde(default = "default_content_root")]
    pub content_root: PathBuf,
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    /// Prefix for public document links.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Extra root-relative globs hidden from the catalog.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: None,
            relative_root: None,
            content_root: default_content_root(),
            manifest_name: default_manifest_name(),
            public_base_url: default_public_base_url(),
            cache_ttl_secs: default_cache_ttl_secs(),
            exclude_globs: Vec::new(),
        }
    }
}

impl DocumentsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_content_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_manifest_name() -> String {
    "index.json".to_string()
}
fn default_public_base_url() -> String {
    "/files/".to_string()
}
fn default_cache_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ShareConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    /// Extensions (without dot, case-insensitive) that are indexed. Empty
    /// means every file.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_parallelism: default_max_parallelism(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl IndexerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(MIN_INDEX_INTERVAL_SECS))
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
    }

    /// Parallelism for file probes, bounded by the available processors.
    pub fn effective_parallelism(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.max_parallelism.clamp(1, cpus.max(1))
    }

    pub fn allows_extension(&self, file_name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        let ext = match file_name.rsplit_once('.') {
            Some((_, ext)) => ext,
            None => return false,
        };
        self.allowed_extensions
            .iter()
            .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

fn default_true() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    300
}
fn default_batch_size() -> usize {
    200
}
fn default_max_parallelism() -> usize {
    4
}
fn default_allowed_extensions() -> Vec<String> {
    vec!["pdf".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.documents.root.is_none() && config.documents.relative_root.is_none() {
        anyhow::bail!("documents.root or documents.relative_root must be set");
    }

    if config.documents.manifest_name.trim().is_empty()
        || config.documents.manifest_name.contains(['/', '\\'])
    {
        anyhow::bail!("documents.manifest_name must be a plain file name");
    }

    if config.server.page_timeout_secs == 0 {
        anyhow::bail!("server.page_timeout_secs must be > 0");
    }

    if config.indexer.interval_secs < MIN_INDEX_INTERVAL_SECS {
        warn!(
            "indexer.interval_secs = {} is below the minimum, using {}",
            config.indexer.interval_secs, MIN_INDEX_INTERVAL_SECS
        );
    }

    Ok(config)
}

/// A configuration that follows edits to its file.
///
/// Each [`current`](LiveConfig::current) call checks the file's modification
/// time and re-reads it when it changed. A file that fails to parse keeps the
/// last good configuration in effect.
pub struct LiveConfig {
    path: Option<PathBuf>,
    state: RwLock<LiveState>,
}

struct LiveState {
    config: Arc<Config>,
    modified: Option<SystemTime>,
}

impl LiveConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: RwLock::new(LiveState {
                config: Arc::new(config),
                modified,
            }),
        })
    }

    /// A fixed configuration with no backing file (tests, embedding).
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            state: RwLock::new(LiveState {
                config: Arc::new(config),
                modified: None,
            }),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        if let Some(path) = &self.path {
            let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
            let stale = {
                let state = self.state.read().unwrap_or_else(|p| p.into_inner());
                modified.is_some() && modified != state.modified
            };
            if stale {
                self.reload(path, modified);
            }
        }
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .config
            .clone()
    }

    fn reload(&self, path: &Path, modified: Option<SystemTime>) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if state.modified == modified {
            return;
        }
        match load_config(path) {
            Ok(config) => {
                info!("configuration reloaded from {}", path.display());
                state.config = Arc::new(config);
            }
            Err(e) => warn!("keeping previous configuration: {:#}", e),
        }
        state.modified = modified;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = r#"
[db]
path = "./data/index.sqlite"

[documents]
root = "/srv/oiwi"
"#;

    #[test]
    fn test_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.documents.manifest_name, "index.json");
        assert_eq!(cfg.documents.cache_ttl_secs, 300);
        assert!(cfg.indexer.enabled);
        assert!(!cfg.share.enabled);
        assert_eq!(cfg.indexer.allowed_extensions, vec!["pdf".to_string()]);
    }

    #[test]
    fn test_requires_some_root() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n").unwrap_err();
        assert!(err.to_string().contains("documents.root"));
    }

    #[test]
    fn test_rejects_manifest_name_with_separator() {
        let text = format!("{}manifest_name = \"a/b.json\"\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn test_indexer_clamps() {
        let cfg = IndexerConfig {
            interval_secs: 5,
            batch_size: 10,
            max_parallelism: 0,
            ..Default::default()
        };
        assert_eq!(cfg.interval(), Duration::from_secs(MIN_INDEX_INTERVAL_SECS));
        assert_eq!(cfg.effective_batch_size(), MIN_BATCH_SIZE);
        assert_eq!(cfg.effective_parallelism(), 1);

        let cfg = IndexerConfig {
            batch_size: 100_000,
            ..Default::default()
        };
        assert_eq!(cfg.effective_batch_size(), MAX_BATCH_SIZE);
    }

    #[test]
    fn test_allows_extension() {
        let cfg = IndexerConfig::default();
        assert!(cfg.allows_extension("a.PDF"));
        assert!(!cfg.allows_extension("a.docx"));
        assert!(!cfg.allows_extension("noext"));

        let all = IndexerConfig {
            allowed_extensions: vec![],
            ..Default::default()
        };
        assert!(all.allows_extension("noext"));
    }

    #[test]
    fn test_live_config_picks_up_edits() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("oiwi.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let live = LiveConfig::from_file(&path).unwrap();
        assert!(live.current().indexer.enabled);

        std::fs::write(&path, format!("{}\n[indexer]\nenabled = false\n", MINIMAL)).unwrap();
        // Force a different modification time regardless of clock granularity.
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert!(!live.current().indexer.enabled);
    }

    #[test]
    fn test_live_config_keeps_last_good() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("oiwi.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let live = LiveConfig::from_file(&path).unwrap();

        std::fs::write(&path, "this is not toml [").unwrap();
        let later = SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert_eq!(live.current().documents.manifest_name, "index.json");
    }
}
