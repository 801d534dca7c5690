//! Embedded object-store server lifecycle.
//!
//! The orchestrator spawns a local object-storage server process over the
//! working tree and uses it as the rendezvous point between stage workers:
//! every top-level directory is an implicit bucket and every file an
//! implicit key. The server's own storage engine is an off-the-shelf
//! concern; this module only manages its process lifecycle and bucket
//! layout.

use super::client::{HttpObjectClient, ObjectClient};
use crate::errors::{GangwayError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Default server binary name, resolved through `PATH`.
const DEFAULT_SERVER_BINARY: &str = "minio";

/// How long to wait for the spawned server to answer health probes.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Root credentials for one server run.
///
/// Generated fresh per run and handed to dispatched workers inside the
/// work specification's return destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCredentials {
    /// Access key (username).
    pub access_key: String,
    /// Secret key (password).
    pub secret_key: String,
}

impl StoreCredentials {
    /// Generates random credentials.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            access_key: random_token(12),
            secret_key: random_token(24),
        }
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// A locally spawned object-storage server process.
pub struct StoreServer {
    dir: PathBuf,
    host: String,
    port: u16,
    binary: String,
    credentials: StoreCredentials,
    child: Option<Child>,
}

impl StoreServer {
    /// Defines (but does not start) a server over `dir`, reachable at
    /// `host`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            host: host.into(),
            port: 9000,
            binary: DEFAULT_SERVER_BINARY.to_string(),
            credentials: StoreCredentials::generate(),
            child: None,
        }
    }

    /// Overrides the listen port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Overrides the server binary.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// The HTTP endpoint workers and clients connect to.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// This run's root credentials.
    #[must_use]
    pub fn credentials(&self) -> &StoreCredentials {
        &self.credentials
    }

    /// Creates a pre-authenticated client for this server.
    #[must_use]
    pub fn client(&self) -> HttpObjectClient {
        HttpObjectClient::new(
            self.endpoint(),
            &self.credentials.access_key,
            &self.credentials.secret_key,
        )
    }

    /// Creates the bucket if it does not exist yet.
    ///
    /// Buckets are directories under the served tree.
    pub fn ensure_bucket(&self, name: &str) -> Result<()> {
        std::fs::create_dir_all(self.dir.join(name))?;
        Ok(())
    }

    /// Spawns the server process and waits until it answers health probes.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;

        let address = format!("{}:{}", self.host, self.port);
        debug!(binary = %self.binary, %address, dir = %self.dir.display(), "spawning object-store server");
        let child = Command::new(&self.binary)
            .arg("server")
            .arg(&self.dir)
            .arg("--address")
            .arg(&address)
            .env("MINIO_ROOT_USER", &self.credentials.access_key)
            .env("MINIO_ROOT_PASSWORD", &self.credentials.secret_key)
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                GangwayError::Server(format!("failed to spawn '{}': {err}", self.binary))
            })?;
        self.child = Some(child);

        let client = self.client();
        let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
        loop {
            match client.health().await {
                Ok(()) => {
                    info!(endpoint = %self.endpoint(), "object-store server is ready");
                    return Ok(());
                }
                Err(err) if tokio::time::Instant::now() >= deadline => {
                    self.kill().await;
                    return Err(GangwayError::Server(format!(
                        "server never became healthy: {err}"
                    )));
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
    }

    /// Stops the server process, if running.
    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill object-store server");
            }
        }
    }

    /// The directory the server serves.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_are_random() {
        let a = StoreCredentials::generate();
        let b = StoreCredentials::generate();
        assert_eq!(a.access_key.len(), 12);
        assert_eq!(a.secret_key.len(), 24);
        assert_ne!(a.secret_key, b.secret_key);
    }

    #[test]
    fn test_endpoint_and_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let server = StoreServer::new(dir.path(), "10.0.0.4").with_port(9002);
        assert_eq!(server.endpoint(), "http://10.0.0.4:9002");

        server.ensure_bucket("builds").unwrap();
        server.ensure_bucket("builds").unwrap();
        assert!(dir.path().join("builds").is_dir());
    }
}
