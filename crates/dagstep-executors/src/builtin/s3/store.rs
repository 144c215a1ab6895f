use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::debug;

use dagstep_core::traits::ObjectStore;
use dagstep_core::types::{ListObjects, ObjectInfo, PutObject, StoreError, StoreResult};

/// Serves buckets from subdirectories of a local root, for `file://` endpoints.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `file:///srv/buckets` → `/srv/buckets`.
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        endpoint.strip_prefix("file://").map(Self::new)
    }

    /// A bucket is exactly one plain directory name under the root.
    async fn bucket_dir(&self, bucket: &str) -> StoreResult<PathBuf> {
        let mut components = Path::new(bucket).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(name)), None) if name == bucket
        );
        if !single {
            return Err(StoreError::Other(format!("invalid bucket name {bucket:?}")));
        }
        let dir = self.root.join(bucket);
        match tokio::fs::metadata(&dir).await {
            Ok(meta) if meta.is_dir() => Ok(dir),
            Ok(_) => Err(StoreError::NoSuchBucket(bucket.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NoSuchBucket(bucket.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn object_path(&self, bucket: &str, key: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(key);
        let plain = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !plain {
            return Err(StoreError::Other(format!("invalid object key {key:?}")));
        }
        Ok(self.bucket_dir(bucket).await?.join(rel))
    }
}

async fn stat(path: &Path, key: &str) -> StoreResult<ObjectInfo> {
    let meta = tokio::fs::metadata(path).await?;
    Ok(ObjectInfo {
        key: key.to_string(),
        size: meta.len(),
        last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        content_type: None,
    })
}

/// Every file under `dir`, as `/`-separated keys relative to it.
async fn walk(dir: &Path) -> StoreResult<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            let Ok(rel) = path.strip_prefix(dir) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((key, path));
        }
    }
    out.sort();
    Ok(out)
}

impl ObjectStore for FsObjectStore {
    fn put_object<'a>(&'a self, req: &'a PutObject) -> BoxFuture<'a, StoreResult<ObjectInfo>> {
        Box::pin(async move {
            let path = self.object_path(&req.bucket, &req.key).await?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&req.source, &path).await?;
            debug!(bucket = %req.bucket, key = %req.key, "Stored object");
            let mut info = stat(&path, &req.key).await?;
            info.content_type = req.content_type.clone();
            Ok(info)
        })
    }

    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, StoreResult<ObjectInfo>> {
        Box::pin(async move {
            let path = self.object_path(bucket, key).await?;
            if !tokio::fs::try_exists(&path).await? {
                return Err(StoreError::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            tokio::fs::copy(&path, dest).await?;
            stat(&path, key).await
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        req: &'a ListObjects,
    ) -> BoxFuture<'a, StoreResult<Vec<ObjectInfo>>> {
        Box::pin(async move {
            let dir = self.bucket_dir(bucket).await?;
            let prefix = req.prefix.as_deref().unwrap_or_default();
            let delimiter = req.delimiter.as_deref().filter(|d| !d.is_empty() && !req.recursive);

            let mut out = Vec::new();
            for (key, path) in walk(&dir).await? {
                if out.len() >= req.max_keys {
                    break;
                }
                let Some(rest) = key.strip_prefix(prefix) else {
                    continue;
                };
                if delimiter.is_some_and(|d| rest.contains(d)) {
                    continue;
                }
                out.push(stat(&path, &key).await?);
            }
            Ok(out)
        })
    }

    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let path = self.object_path(bucket, key).await?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}
