//! Object storage steps: upload, download, list and delete.
//!
//! The wire client sits behind [`ObjectStore`]. `file://` endpoints are served
//! by [`FsObjectStore`]; anything else goes through the registered
//! [`ObjectStoreFactory`].

mod config;
mod store;

pub use config::{Operation, S3Config};
pub use store::FsObjectStore;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use dagstep_core::error::{DagstepError, Result};
use dagstep_core::lifecycle::RunControl;
use dagstep_core::traits::{Executor, ExitCoder, Extensions, ObjectStore, OutputSink};
use dagstep_core::types::{
    BuildContext, ExecutorCapabilities, ListObjects, ObjectInfo, PutObject, Step, StoreError,
};

use super::{exit, exit_code_for};
use crate::output::Sinks;
use crate::registry::Registration;

/// Builds a client for a resolved config whose endpoint is not `file://`.
pub type ObjectStoreFactory =
    Arc<dyn Fn(&S3Config) -> Result<Arc<dyn ObjectStore>> + Send + Sync>;

pub fn registration(factory: Option<ObjectStoreFactory>) -> Registration {
    Registration::new(ExecutorCapabilities::single_command(), move |ctx, step| {
        Ok(Box::new(S3Executor::new(ctx, step, factory.as_ref())?))
    })
    // Required fields may come from ambient defaults, so only the shape is
    // checked here; `validate_for` runs at build time.
    .with_validator(|step| {
        Operation::from_step(step)?;
        S3Config::resolve(&BuildContext::default(), step).map(|_| ())
    })
}

fn open_store(cfg: &S3Config, factory: Option<&ObjectStoreFactory>) -> Result<Arc<dyn ObjectStore>> {
    if let Some(fs) = FsObjectStore::from_endpoint(&cfg.endpoint) {
        return Ok(Arc::new(fs));
    }
    match factory {
        Some(factory) => factory(cfg),
        None => Err(DagstepError::config(format!(
            "no object store client available for endpoint {:?}",
            cfg.endpoint
        ))),
    }
}

/// A download's temporary sibling file, removed unless persisted.
struct PartFile {
    path: PathBuf,
    persisted: bool,
}

impl PartFile {
    fn beside(dest: &Path) -> Self {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: dest.with_file_name(format!(".{name}.{}.part", Uuid::new_v4())),
            persisted: false,
        }
    }

    async fn persist(mut self, dest: &Path) -> std::io::Result<()> {
        tokio::fs::rename(&self.path, dest).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct S3Executor {
    step_name: String,
    operation: Operation,
    config: S3Config,
    dir: Option<PathBuf>,
    store: Arc<dyn ObjectStore>,
    sinks: Sinks,
    control: RunControl,
    exit_code: AtomicI32,
}

impl S3Executor {
    pub fn new(ctx: &BuildContext, step: &Step, factory: Option<&ObjectStoreFactory>) -> Result<Self> {
        let operation = Operation::from_step(step)?;
        let mut config = S3Config::resolve(ctx, step)?;
        config
            .validate_for(operation)
            .map_err(|e| DagstepError::config(format!("step {}: {}", step.name, reason(e))))?;
        let store = open_store(&config, factory)?;

        Ok(Self {
            step_name: step.name.clone(),
            operation,
            config,
            dir: step.dir.clone(),
            store,
            sinks: Sinks::default(),
            control: RunControl::new(step.name.clone()),
            exit_code: AtomicI32::new(exit::OK),
        })
    }

    /// Relative local paths are taken from the step's working directory.
    fn local_path(&self, path: &str) -> PathBuf {
        match &self.dir {
            Some(dir) if Path::new(path).is_relative() => dir.join(path),
            _ => PathBuf::from(path),
        }
    }

    fn op_name(&self) -> String {
        format!("s3 {}", self.operation)
    }

    fn classify(&self, err: StoreError) -> DagstepError {
        let operation = self.op_name();
        match err {
            StoreError::NoSuchBucket(bucket) => DagstepError::ResourceNotFound {
                operation,
                target: format!("bucket {bucket}"),
            },
            StoreError::NoSuchKey { bucket, key } => DagstepError::ResourceNotFound {
                operation,
                target: format!("s3://{bucket}/{key}"),
            },
            StoreError::AccessDenied(target) => DagstepError::PermissionDenied { operation, target },
            StoreError::InvalidCredentials(message) => {
                DagstepError::InvalidCredentials { operation, message }
            }
            StoreError::Timeout => DagstepError::Timeout {
                operation,
                timeout_secs: 0,
            },
            StoreError::Connection(message) => DagstepError::network(operation, message),
            StoreError::Io(e) => DagstepError::Io(e),
            StoreError::Other(message) => DagstepError::failed(operation, message),
        }
    }

    async fn emit(&self, value: &serde_json::Value) -> Result<()> {
        let mut rendered = serde_json::to_vec_pretty(value)?;
        rendered.push(b'\n');
        self.sinks.write_stdout(&rendered).await?;
        Ok(())
    }

    async fn execute(&self) -> Result<()> {
        match self.operation {
            Operation::Upload => self.upload().await,
            Operation::Download => self.download().await,
            Operation::List => self.list().await,
            Operation::Delete => self.delete().await,
        }
    }

    async fn upload(&self) -> Result<()> {
        let cfg = &self.config;
        let set = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let req = PutObject {
            bucket: cfg.bucket.clone(),
            key: cfg.key.clone(),
            source: self.local_path(&cfg.source),
            content_type: set(&cfg.content_type),
            storage_class: set(&cfg.storage_class),
            acl: set(&cfg.acl),
            server_side_encryption: set(&cfg.server_side_encryption),
            sse_kms_key_id: set(&cfg.sse_kms_key_id),
            checksum_algorithm: set(&cfg.checksum_algorithm),
            metadata: cfg.metadata.clone(),
            tags: cfg.tags.clone(),
            part_size_mb: u64::try_from(cfg.part_size).unwrap_or_default(),
            concurrency: u32::try_from(cfg.concurrency).unwrap_or(u32::MAX),
        };

        debug!(step = %self.step_name, bucket = %req.bucket, key = %req.key, "Uploading");
        let info = self.store.put_object(&req).await.map_err(|e| self.classify(e))?;
        self.emit(&json!({
            "operation": "upload",
            "bucket": cfg.bucket,
            "key": info.key,
            "size": info.size,
            "uri": format!("s3://{}/{}", cfg.bucket, info.key),
        }))
        .await
    }

    async fn download(&self) -> Result<()> {
        let cfg = &self.config;
        let mut dest = self.local_path(&cfg.destination);
        if cfg.destination.ends_with('/') || tokio::fs::metadata(&dest).await.is_ok_and(|m| m.is_dir()) {
            let name = cfg.key.rsplit('/').next().unwrap_or(&cfg.key);
            dest = dest.join(name);
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(step = %self.step_name, bucket = %cfg.bucket, key = %cfg.key, dest = %dest.display(), "Downloading");
        let part = PartFile::beside(&dest);
        let info = self
            .store
            .get_object(&cfg.bucket, &cfg.key, &part.path)
            .await
            .map_err(|e| self.classify(e))?;
        part.persist(&dest).await?;

        self.emit(&json!({
            "operation": "download",
            "bucket": cfg.bucket,
            "key": info.key,
            "size": info.size,
            "destination": dest.display().to_string(),
        }))
        .await
    }

    async fn list(&self) -> Result<()> {
        let cfg = &self.config;
        let req = ListObjects {
            prefix: (!cfg.prefix.is_empty()).then(|| cfg.prefix.clone()),
            delimiter: (!cfg.delimiter.is_empty()).then(|| cfg.delimiter.clone()),
            max_keys: usize::try_from(cfg.max_keys).unwrap_or_default(),
            recursive: cfg.recursive,
        };
        let objects = self
            .store
            .list_objects(&cfg.bucket, &req)
            .await
            .map_err(|e| self.classify(e))?;

        if cfg.is_jsonl() {
            let mut buf = Vec::new();
            for object in &objects {
                serde_json::to_writer(&mut buf, object)?;
                buf.push(b'\n');
            }
            self.sinks.write_stdout(&buf).await?;
            return Ok(());
        }
        self.emit(&json!({
            "bucket": cfg.bucket,
            "prefix": cfg.prefix,
            "count": objects.len(),
            "objects": objects,
        }))
        .await
    }

    async fn delete(&self) -> Result<()> {
        let cfg = &self.config;
        let keys = if !cfg.key.is_empty() {
            vec![cfg.key.clone()]
        } else {
            let req = ListObjects {
                prefix: Some(cfg.prefix.clone()),
                delimiter: None,
                max_keys: usize::MAX,
                recursive: true,
            };
            self.store
                .list_objects(&cfg.bucket, &req)
                .await
                .map_err(|e| self.classify(e))?
                .into_iter()
                .map(|o: ObjectInfo| o.key)
                .collect()
        };

        for key in &keys {
            self.store
                .delete_object(&cfg.bucket, key)
                .await
                .map_err(|e| self.classify(e))?;
            debug!(step = %self.step_name, bucket = %cfg.bucket, key = %key, "Deleted");
        }

        if cfg.quiet {
            return Ok(());
        }
        self.emit(&json!({
            "operation": "delete",
            "bucket": cfg.bucket,
            "count": keys.len(),
            "deleted": keys,
        }))
        .await
    }
}

fn reason(err: DagstepError) -> String {
    match err {
        DagstepError::Config(message) => message,
        other => other.to_string(),
    }
}

impl Executor for S3Executor {
    fn set_output_sinks(&mut self, stdout: OutputSink, stderr: OutputSink) {
        self.sinks.set(stdout, stderr);
    }

    fn run(&self, ctx: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let token = self.control.begin(&ctx)?;
            info!(step = %self.step_name, executor = "s3", operation = %self.operation, "Step started");

            let result = self.control.until_cancelled(&token, self.execute()).await;
            self.control.finish();

            let code = match &result {
                Ok(()) => exit::OK,
                Err(e) => {
                    warn!(step = %self.step_name, kind = %e.kind(), error = %e, "Object storage operation failed");
                    exit_code_for(e)
                }
            };
            self.exit_code.store(code, Ordering::SeqCst);
            result
        })
    }

    fn kill(&self) -> Result<()> {
        self.control.kill();
        Ok(())
    }

    fn extensions(&self) -> Extensions<'_> {
        Extensions {
            exit_code: Some(self),
            ..Extensions::default()
        }
    }
}

impl ExitCoder for S3Executor {
    fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}
