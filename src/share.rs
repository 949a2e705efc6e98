//! Network share access.
//!
//! The catalog only needs to know whether the document root is reachable.
//! When the root is a UNC path and `[share] enabled = true`, a
//! [`ShareConnector`] is asked to establish the connection first. Failures are
//! reported as a diagnostic string and never abort root resolution.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::config::ShareConfig;

#[async_trait]
pub trait ShareConnector: Send + Sync {
    /// Make `root` reachable. `Ok(())` does not guarantee the directory
    /// exists, only that the connection step itself did not fail.
    async fn connect(&self, root: &Path) -> Result<()>;
}

/// Connector for environments where shares are mounted externally.
pub struct NoopShareConnector;

#[async_trait]
impl ShareConnector for NoopShareConnector {
    async fn connect(&self, _root: &Path) -> Result<()> {
        Ok(())
    }
}

/// Connects a share with `net use \\server\share /user:DOMAIN\user password`.
pub struct NetUseConnector {
    username: Option<String>,
    password: Option<String>,
    domain: Option<String>,
}

impl NetUseConnector {
    pub fn new(config: &ShareConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            domain: config.domain.clone(),
        }
    }

    fn user_arg(&self) -> Option<String> {
        let user = self.username.as_deref().filter(|u| !u.is_empty())?;
        Some(match self.domain.as_deref().filter(|d| !d.is_empty()) {
            Some(domain) => format!("/user:{}\\{}", domain, user),
            None => format!("/user:{}", user),
        })
    }
}

#[async_trait]
impl ShareConnector for NetUseConnector {
    async fn connect(&self, root: &Path) -> Result<()> {
        let share = share_root(root).context("root is not a UNC path")?;

        if !cfg!(windows) {
            debug!("share connect skipped on this platform: {}", share);
            return Ok(());
        }

        let mut cmd = tokio::process::Command::new("net");
        cmd.arg("use").arg(&share);
        if let Some(pw) = self.password.as_deref() {
            cmd.arg(pw);
        }
        if let Some(user) = self.user_arg() {
            cmd.arg(user);
        }
        cmd.arg("/persistent:no");

        let output = cmd.output().await.context("failed to run 'net use'")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "'net use {}' failed ({}): {}",
                share,
                output.status,
                stderr.trim()
            );
        }
        info!("connected network share {}", share);
        Ok(())
    }
}

/// Pick the connector for a share configuration.
pub fn connector_for(config: &ShareConfig) -> Box<dyn ShareConnector> {
    if config.enabled {
        Box::new(NetUseConnector::new(config))
    } else {
        Box::new(NoopShareConnector)
    }
}

/// `\\server\share\...` or `//server/share/...`.
pub fn is_unc_path(path: &Path) -> bool {
    let s = path.to_string_lossy();
    s.starts_with("\\\\") || s.starts_with("//")
}

/// The `\\server\share` part of a UNC path.
fn share_root(path: &Path) -> Option<String> {
    if !is_unc_path(path) {
        return None;
    }
    let s = path.to_string_lossy().replace('/', "\\");
    let mut parts = s.trim_start_matches('\\').split('\\').filter(|p| !p.is_empty());
    let server = parts.next()?;
    let share = parts.next()?;
    Some(format!("\\\\{}\\{}", server, share))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_is_unc_path() {
        assert!(is_unc_path(Path::new(r"\\fs01\docs\oiwi")));
        assert!(is_unc_path(Path::new("//fs01/docs")));
        assert!(!is_unc_path(Path::new("/srv/docs")));
        assert!(!is_unc_path(Path::new(r"C:\docs")));
    }

    #[test]
    fn test_share_root() {
        assert_eq!(
            share_root(&PathBuf::from(r"\\fs01\docs\oiwi\sub")).as_deref(),
            Some(r"\\fs01\docs")
        );
        assert_eq!(
            share_root(&PathBuf::from("//fs01/docs")).as_deref(),
            Some(r"\\fs01\docs")
        );
        assert_eq!(share_root(&PathBuf::from(r"\\fs01")), None);
        assert_eq!(share_root(&PathBuf::from("/local")), None);
    }

    #[test]
    fn test_user_arg() {
        let c = NetUseConnector::new(&ShareConfig {
            enabled: true,
            username: Some("svc".into()),
            password: Some("pw".into()),
            domain: Some("PLANT".into()),
        });
        assert_eq!(c.user_arg().as_deref(), Some(r"/user:PLANT\svc"));

        let c = NetUseConnector::new(&ShareConfig::default());
        assert_eq!(c.user_arg(), None);
    }

    #[tokio::test]
    async fn test_noop_connector() {
        assert!(NoopShareConnector.connect(Path::new("/x")).await.is_ok());
    }
}
