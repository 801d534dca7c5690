//! Artifact store façade.
//!
//! A minimal abstraction over "named object in a named bucket", backed either
//! by the local filesystem or by a remote object-store client. Exactly one
//! backend is active per [`StoreHandle`]; the handle is constructed once per
//! run and threaded through every component rather than held in global state.
//!
//! Callers never need to know which backend served a request: `open` returns
//! object bytes and `list` yields the same descriptor shape for a local
//! directory walk and a recursive remote listing.

mod client;
mod server;

pub use client::{HttpObjectClient, MemoryObjectClient, ObjectClient, ObjectRecord};
pub use server::{StoreCredentials, StoreServer};

use crate::errors::{GangwayError, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Describes one stored object, local file or remote.
///
/// Remote objects are never directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDescriptor {
    /// Full path of the object: a filesystem path for the file backend,
    /// `bucket/key` for the remote backend.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time, when the backend reports one.
    pub modified: Option<DateTime<Utc>>,
    /// Directory flag; always false for remote objects.
    pub is_dir: bool,
}

impl ObjectDescriptor {
    /// Returns the base filename of the object.
    #[must_use]
    pub fn name(&self) -> &str {
        self.path
            .rsplit('/')
            .next()
            .unwrap_or(self.path.as_str())
    }
}

enum BackendKind {
    /// Paths resolve against the local filesystem.
    File,
    /// Paths resolve as `bucket/key` against a remote object store.
    /// `None` means remote mode was selected but no client was attached.
    Remote(Option<Arc<dyn ObjectClient>>),
}

/// Handle to the active artifact store backend.
///
/// Cloning is cheap; clones share the same backend.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<BackendKind>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match *self.inner {
            BackendKind::File => "file",
            BackendKind::Remote(Some(_)) => "remote",
            BackendKind::Remote(None) => "remote (no client)",
        };
        f.debug_struct("StoreHandle").field("backend", &kind).finish()
    }
}

impl StoreHandle {
    /// Creates a file-backed handle.
    #[must_use]
    pub fn file_backed() -> Self {
        Self {
            inner: Arc::new(BackendKind::File),
        }
    }

    /// Creates a remote handle over a pre-authenticated client.
    #[must_use]
    pub fn remote(client: Arc<dyn ObjectClient>) -> Self {
        Self {
            inner: Arc::new(BackendKind::Remote(Some(client))),
        }
    }

    /// Creates a remote handle with no client attached.
    ///
    /// Every operation on the returned handle fails with
    /// [`GangwayError::NoClient`] until a configured handle replaces it.
    #[must_use]
    pub fn remote_detached() -> Self {
        Self {
            inner: Arc::new(BackendKind::Remote(None)),
        }
    }

    /// Reads the full contents of the object at `path`.
    ///
    /// For the remote backend the first path segment is the bucket and the
    /// remainder is the object key.
    pub async fn open(&self, path: &str) -> Result<Vec<u8>> {
        match &*self.inner {
            BackendKind::File => Ok(tokio::fs::read(path).await?),
            BackendKind::Remote(None) => Err(GangwayError::NoClient),
            BackendKind::Remote(Some(client)) => {
                let (bucket, key) = split_bucket(path);
                client.get_object(bucket, key).await
            }
        }
    }

    /// Lists every object under `path`, recursively.
    ///
    /// For the remote backend this issues a recursive listing scoped to the
    /// bucket/prefix named by `path`. Missing local directories yield an
    /// empty listing rather than an error; polling callers treat absence as
    /// "nothing produced yet".
    pub async fn list(&self, path: &str) -> Result<BoxStream<'static, ObjectDescriptor>> {
        match &*self.inner {
            BackendKind::File => {
                let mut found = Vec::new();
                walk_dir(Path::new(path), &mut found)?;
                Ok(Box::pin(stream::iter(found)))
            }
            BackendKind::Remote(None) => Err(GangwayError::NoClient),
            BackendKind::Remote(Some(client)) => {
                let (bucket, prefix) = split_bucket(path);
                let records = client.list_objects(bucket, prefix).await?;
                let bucket = bucket.to_string();
                let descriptors: Vec<ObjectDescriptor> = records
                    .into_iter()
                    .map(|r| ObjectDescriptor {
                        path: format!("{bucket}/{}", r.key),
                        size: r.size,
                        modified: r.last_modified,
                        is_dir: false,
                    })
                    .collect();
                Ok(Box::pin(stream::iter(descriptors)))
            }
        }
    }
}

/// Splits a remote path into its bucket and object-key parts.
fn split_bucket(path: &str) -> (&str, &str) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (trimmed, ""),
    }
}

/// Walks a directory tree, collecting a descriptor per regular file.
fn walk_dir(dir: &Path, found: &mut Vec<ObjectDescriptor>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        let path: PathBuf = entry.path();
        if meta.is_dir() {
            walk_dir(&path, found)?;
        } else {
            found.push(ObjectDescriptor {
                path: path.to_string_lossy().into_owned(),
                size: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                is_dir: false,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_bucket() {
        assert_eq!(split_bucket("builds/abc/meta.json"), ("builds", "abc/meta.json"));
        assert_eq!(split_bucket("/builds/x"), ("builds", "x"));
        assert_eq!(split_bucket("builds"), ("builds", ""));
    }

    #[test]
    fn test_descriptor_name() {
        let d = ObjectDescriptor {
            path: "builds/b1/x86_64/meta.json".to_string(),
            size: 4,
            modified: None,
            is_dir: false,
        };
        assert_eq!(d.name(), "meta.json");
    }

    #[tokio::test]
    async fn test_file_backend_open_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("builds").join("b1");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("meta.json"), b"{}").unwrap();
        std::fs::write(dir.path().join("top.txt"), b"hello").unwrap();

        let store = StoreHandle::file_backed();
        let bytes = store
            .open(&dir.path().join("top.txt").to_string_lossy())
            .await
            .unwrap();
        assert_eq!(bytes, b"hello");

        let listed: Vec<_> = store
            .list(&dir.path().to_string_lossy())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|d| !d.is_dir));
        assert!(listed.iter().any(|d| d.name() == "meta.json"));
    }

    #[tokio::test]
    async fn test_file_backend_missing_dir_lists_empty() {
        let store = StoreHandle::file_backed();
        let listed: Vec<_> = store
            .list("/definitely/not/a/real/path")
            .await
            .unwrap()
            .collect()
            .await;
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_remote_listing_matches_file_descriptor_shape() {
        let client = Arc::new(MemoryObjectClient::new());
        client.seed("builds", "b1/x86_64/meta.json", b"{}".as_slice());
        client.seed("builds", "b1/x86_64/disk.qcow2", b"disk".as_slice());

        let store = StoreHandle::remote(client);
        let listed: Vec<_> = store.list("builds/b1/").await.unwrap().collect().await;

        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|d| !d.is_dir));
        assert!(listed.iter().any(|d| d.name() == "meta.json"));
        assert!(listed
            .iter()
            .all(|d| d.path.starts_with("builds/b1/x86_64/")));

        let bytes = store.open("builds/b1/x86_64/disk.qcow2").await.unwrap();
        assert_eq!(bytes, b"disk");
    }

    #[tokio::test]
    async fn test_backends_list_identical_content_identically() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("builds").join("b1").join("x86_64");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("meta.json"), b"{}").unwrap();
        std::fs::write(sub.join("disk.qcow2"), b"disk").unwrap();

        let client = Arc::new(MemoryObjectClient::new());
        client.seed("builds", "b1/x86_64/meta.json", b"{}".as_slice());
        client.seed("builds", "b1/x86_64/disk.qcow2", b"disk".as_slice());

        let through = |handle: StoreHandle, path: String| async move {
            let mut seen: Vec<(String, u64)> = handle
                .list(&path)
                .await
                .unwrap()
                .map(|d| (d.name().to_string(), d.size))
                .collect()
                .await;
            seen.sort();
            seen
        };

        let local = through(
            StoreHandle::file_backed(),
            dir.path().join("builds").to_string_lossy().into_owned(),
        )
        .await;
        let remote = through(StoreHandle::remote(client), "builds".to_string()).await;

        assert_eq!(local, remote);
        assert_eq!(local.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_without_client_fails() {
        let store = StoreHandle::remote_detached();
        let err = store.open("builds/meta.json").await.unwrap_err();
        assert!(matches!(err, GangwayError::NoClient));
        assert!(store.list("builds").await.is_err());
    }
}
