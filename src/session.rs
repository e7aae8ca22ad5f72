//! Shared API-server sessions
//!
//! One [`kube::Client`] per credential tuple, built lazily on first use and
//! handed out by clone afterwards.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// Default connect timeout for API-server connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default read timeout; long enough for watches and drains to make progress
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(295);

/// Identifies one set of cluster credentials
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Credentials {
    /// Kubeconfig file; `None` infers (env, default path, in-cluster)
    pub kubeconfig: Option<PathBuf>,
    /// Context within the kubeconfig; `None` uses the current context
    pub context: Option<String>,
}

impl Credentials {
    /// Credentials from an explicit kubeconfig file
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: Some(path.into()),
            context: None,
        }
    }

    /// Use a named context
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Caches clients per [`Credentials`]
pub struct SessionManager {
    sessions: Mutex<HashMap<Credentials, Client>>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

impl SessionManager {
    /// Manager applying the given timeouts to every client it builds
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            connect_timeout,
            read_timeout,
        }
    }

    /// Client for `credentials`, connecting on first use.
    ///
    /// The lock is held across construction so concurrent callers with the
    /// same credentials share one client.
    pub async fn client(&self, credentials: &Credentials) -> Result<Client> {
        let mut sessions = self.sessions.lock().await;
        if let Some(client) = sessions.get(credentials) {
            return Ok(client.clone());
        }

        let config = self.config(credentials).await?;
        let client = Client::try_from(config)?;
        info!(
            kubeconfig = ?credentials.kubeconfig,
            context = ?credentials.context,
            "connected to API server"
        );
        sessions.insert(credentials.clone(), client.clone());
        Ok(client)
    }

    /// Number of cached sessions
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether nothing has connected yet
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn config(&self, credentials: &Credentials) -> Result<Config> {
        let options = KubeConfigOptions {
            context: credentials.context.clone(),
            ..Default::default()
        };
        let mut config = match &credentials.kubeconfig {
            Some(path) => {
                debug!(path = %path.display(), "loading kubeconfig");
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::config(format!("failed to read kubeconfig {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| Error::config(format!("invalid kubeconfig: {e}")))?
            }
            None if credentials.context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| Error::config(format!("invalid kubeconfig: {e}")))?,
            None => Config::infer()
                .await
                .map_err(|e| Error::config(format!("no cluster credentials found: {e}")))?,
        };
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.read_timeout);
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: prod
  cluster:
    server: https://prod.example.internal:6443
    insecure-skip-tls-verify: true
- name: lab
  cluster:
    server: https://lab.example.internal:6443
    insecure-skip-tls-verify: true
users:
- name: admin
  user:
    token: not-a-real-token
contexts:
- name: prod
  context: {cluster: prod, user: admin}
- name: lab
  context: {cluster: lab, user: admin}
current-context: prod
"#;

    fn kubeconfig_file() -> tempfile::NamedTempFile {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn one_client_per_credential_tuple() {
        let file = kubeconfig_file();
        let sessions = SessionManager::default();
        let prod = Credentials::from_file(file.path());
        let lab = Credentials::from_file(file.path()).with_context("lab");

        sessions.client(&prod).await.unwrap();
        sessions.client(&prod).await.unwrap();
        assert_eq!(sessions.len().await, 1);

        sessions.client(&lab).await.unwrap();
        assert_eq!(sessions.len().await, 2);
    }

    #[tokio::test]
    async fn timeouts_are_applied() {
        let file = kubeconfig_file();
        let sessions = SessionManager::new(Duration::from_secs(3), Duration::from_secs(30));
        let config = sessions
            .config(&Credentials::from_file(file.path()).with_context("lab"))
            .await
            .unwrap();

        assert_eq!(config.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.cluster_url.host(), Some("lab.example.internal"));
    }

    #[tokio::test]
    async fn missing_kubeconfig_is_a_config_error() {
        let sessions = SessionManager::default();
        let err = sessions
            .client(&Credentials::from_file("/nonexistent/kubeconfig"))
            .await
            .err().expect("expected an error");
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
        assert!(sessions.is_empty().await);
    }
}
