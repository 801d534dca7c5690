//! Remote object-store client.
//!
//! The façade's remote backend talks to the embedded object-store server
//! through the [`ObjectClient`] capability. The server's object API is
//! path-style HTTP: `GET`/`PUT` on `/{bucket}/{key}`, a JSON listing on
//! `/{bucket}?list=json&prefix=...`, and an unauthenticated liveness
//! endpoint at `/minio/health/live`. Requests authenticate with the root
//! credentials the server was started with.

use crate::errors::{GangwayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record from a remote listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object key within the bucket.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Capability interface for a pre-authenticated object-store client.
///
/// Supplied by the caller when the store is switched into remote mode.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Reads the full object at `bucket`/`key`.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Writes an object at `bucket`/`key`.
    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()>;

    /// Recursively lists objects in `bucket` under `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectRecord>>;

    /// Probes server liveness.
    async fn health(&self) -> Result<()>;
}

/// HTTP implementation of [`ObjectClient`].
#[derive(Debug, Clone)]
pub struct HttpObjectClient {
    endpoint: String,
    access_key: String,
    secret_key: String,
    http: reqwest::Client,
}

impl HttpObjectClient {
    /// Creates a client for the server at `endpoint` (e.g.
    /// `http://10.0.0.4:9000`) with the given root credentials.
    #[must_use]
    pub fn new(
        endpoint: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            http: reqwest::Client::new(),
        }
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }
}

#[async_trait]
impl ObjectClient for HttpObjectClient {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.object_url(bucket, key))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GangwayError::ObjectStatus {
                status: resp.status().as_u16(),
                bucket: bucket.to_string(),
                object: key.to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        let resp = self
            .http
            .put(self.object_url(bucket, key))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .body(data)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GangwayError::ObjectStatus {
                status: resp.status().as_u16(),
                bucket: bucket.to_string(),
                object: key.to_string(),
            });
        }
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectRecord>> {
        let resp = self
            .http
            .get(format!("{}/{bucket}", self.endpoint))
            .query(&[("list", "json"), ("prefix", prefix)])
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GangwayError::ObjectStatus {
                status: resp.status().as_u16(),
                bucket: bucket.to_string(),
                object: prefix.to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    async fn health(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/minio/health/live", self.endpoint))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(GangwayError::Server(format!(
                "health probe returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// In-memory [`ObjectClient`] for tests.
///
/// Thread-safe; not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryObjectClient {
    objects: parking_lot::RwLock<std::collections::BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectClient {
    /// Creates an empty client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object synchronously.
    pub fn seed(&self, bucket: &str, key: &str, data: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .insert((bucket.to_string(), key.to_string()), data.into());
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or(GangwayError::ObjectStatus {
                status: 404,
                bucket: bucket.to_string(),
                object: key.to_string(),
            })
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<()> {
        self.seed(bucket, key, data);
        Ok(())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectRecord>> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), v)| ObjectRecord {
                key: k.clone(),
                size: v.len() as u64,
                last_modified: None,
            })
            .collect())
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}
