//! Shared test utilities for dagstep crates.
//!
//! Provides capturing output sinks, step builders, a scripted SSH transport,
//! and an in-memory object store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::io::AsyncWrite;

use dagstep_core::router::RouterConfig;
use dagstep_core::traits::{ObjectStore, OutputSink, SshSession, SshTransport, Tunnel};
use dagstep_core::types::{
    CommandEntry, ExecutorConfig, ListObjects, ObjectInfo, PutObject, SshError, SshHost, Step,
    StoreError, StoreResult,
};

// ── Output capture ──────────────────────────────────────────────

/// An output sink whose bytes stay readable after the executor is done.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A boxed handle writing into this buffer.
    pub fn sink(&self) -> OutputSink {
        Box::new(self.clone())
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ── Step builders ───────────────────────────────────────────────

fn object(config: Value) -> Map<String, Value> {
    match config {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => panic!("executor config must be a JSON object, got {other}"),
    }
}

/// A step running one shell command line.
pub fn command_step(name: &str, line: &str) -> Step {
    let mut step = Step::new(name);
    step.commands.push(CommandEntry::new(line));
    step
}

/// A step of executor type `executor_type` with one command and JSON config.
pub fn typed_step(name: &str, executor_type: &str, command: Option<CommandEntry>, config: Value) -> Step {
    let mut step = Step::new(name);
    step.executor = ExecutorConfig {
        executor_type: executor_type.to_string(),
        config: object(config),
    };
    step.commands.extend(command);
    step
}

pub fn http_step(name: &str, method: &str, url: &str, config: Value) -> Step {
    typed_step(name, "http", Some(CommandEntry::new(method).with_args([url])), config)
}

pub fn s3_step(name: &str, operation: &str, config: Value) -> Step {
    typed_step(name, "s3", Some(CommandEntry::new(operation)), config)
}

pub fn ssh_step(name: &str, line: &str, config: Value) -> Step {
    typed_step(name, "ssh", Some(CommandEntry::new(line)), config)
}

pub fn hitl_step(name: &str, config: Value) -> Step {
    typed_step(name, "hitl", None, config)
}

pub fn router_step(name: &str, router: RouterConfig) -> Step {
    let mut step = Step::new(name);
    step.router = Some(router);
    step
}

/// Write `contents` to `name` inside a fresh temp dir.
pub fn temp_file(name: &str, contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

// ── Scripted SSH transport ──────────────────────────────────────

#[derive(Default)]
struct SshScript {
    stdout: String,
    stderr: String,
    exit_status: i32,
    reject_hosts: BTreeSet<String>,
    hang: bool,
}

#[derive(Default)]
struct SshState {
    events: Mutex<Vec<String>>,
    script: Mutex<SshScript>,
}

impl SshState {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

/// An `SshTransport` that never touches the network. Every connect, tunnel,
/// exec and close is recorded as an event string.
#[derive(Clone, Default)]
pub struct MockSshTransport {
    state: Arc<SshState>,
}

impl MockSshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(self, stdout: &str, stderr: &str) -> Self {
        {
            let mut script = self.state.script.lock().unwrap();
            script.stdout = stdout.to_string();
            script.stderr = stderr.to_string();
        }
        self
    }

    pub fn with_exit_status(self, status: i32) -> Self {
        self.state.script.lock().unwrap().exit_status = status;
        self
    }

    /// Fail authentication against `host`.
    pub fn rejecting(self, host: &str) -> Self {
        self.state.script.lock().unwrap().reject_hosts.insert(host.to_string());
        self
    }

    /// Remote commands never finish.
    pub fn hanging(self) -> Self {
        self.state.script.lock().unwrap().hang = true;
        self
    }

    pub fn events(&self) -> Vec<String> {
        self.state.events.lock().unwrap().clone()
    }

    fn session(&self, host: &SshHost) -> Result<Box<dyn SshSession>, SshError> {
        if self.state.script.lock().unwrap().reject_hosts.contains(&host.host) {
            return Err(SshError::AuthFailed {
                user: host.user.clone(),
                host: host.host.clone(),
            });
        }
        Ok(Box::new(MockSession {
            host_port: host.host_port(),
            state: self.state.clone(),
        }))
    }
}

impl SshTransport for MockSshTransport {
    fn connect<'a>(&'a self, host: &'a SshHost) -> BoxFuture<'a, Result<Box<dyn SshSession>, SshError>> {
        Box::pin(async move {
            self.state.record(format!("connect {}@{}", host.user, host.host_port()));
            self.session(host)
        })
    }

    fn connect_over<'a>(
        &'a self,
        _tunnel: Box<dyn Tunnel>,
        host: &'a SshHost,
    ) -> BoxFuture<'a, Result<Box<dyn SshSession>, SshError>> {
        Box::pin(async move {
            self.state.record(format!("connect_over {}@{}", host.user, host.host_port()));
            self.session(host)
        })
    }
}

struct MockSession {
    host_port: String,
    state: Arc<SshState>,
}

impl SshSession for MockSession {
    fn open_tunnel<'a>(&'a mut self, host: &'a str, port: u16) -> BoxFuture<'a, Result<Box<dyn Tunnel>, SshError>> {
        Box::pin(async move {
            self.state.record(format!("tunnel {host}:{port}"));
            let (near, _far) = tokio::io::duplex(64);
            Ok(Box::new(near) as Box<dyn Tunnel>)
        })
    }

    fn exec<'a>(
        &'a mut self,
        command: &'a str,
        stdout: &'a mut OutputSink,
        stderr: &'a mut OutputSink,
    ) -> BoxFuture<'a, Result<i32, SshError>> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;

            self.state.record(format!("exec {command}"));
            let (out, err, status, hang) = {
                let s = self.state.script.lock().unwrap();
                (s.stdout.clone(), s.stderr.clone(), s.exit_status, s.hang)
            };
            if hang {
                futures::future::pending::<()>().await;
            }
            stdout
                .write_all(out.as_bytes())
                .await
                .map_err(|e| SshError::Channel(e.to_string()))?;
            stderr
                .write_all(err.as_bytes())
                .await
                .map_err(|e| SshError::Channel(e.to_string()))?;
            Ok(status)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), SshError>> {
        Box::pin(async move {
            self.state.record(format!("close {}", self.host_port));
            Ok(())
        })
    }
}

// ── In-memory object store ──────────────────────────────────────

#[derive(Default)]
struct StoreState {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), Vec<u8>>,
    deny: bool,
    hang: bool,
}

/// An `ObjectStore` holding objects in memory.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bucket(self, bucket: &str) -> Self {
        self.state.lock().unwrap().buckets.insert(bucket.to_string());
        self
    }

    pub fn with_object(self, bucket: &str, key: &str, bytes: &[u8]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.buckets.insert(bucket.to_string());
            state
                .objects
                .insert((bucket.to_string(), key.to_string()), bytes.to_vec());
        }
        self
    }

    /// Reject every request with `AccessDenied`.
    pub fn denying(self) -> Self {
        self.state.lock().unwrap().deny = true;
        self
    }

    /// Transfers stall forever; downloads stall after writing half the object.
    pub fn hanging(self) -> Self {
        self.state.lock().unwrap().hang = true;
        self
    }

    fn hangs(&self) -> bool {
        self.state.lock().unwrap().hang
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn check(&self, bucket: &str) -> StoreResult<()> {
        let state = self.state.lock().unwrap();
        if state.deny {
            return Err(StoreError::AccessDenied(bucket.to_string()));
        }
        if !state.buckets.contains(bucket) {
            return Err(StoreError::NoSuchBucket(bucket.to_string()));
        }
        Ok(())
    }
}

fn info(key: &str, size: usize) -> ObjectInfo {
    ObjectInfo {
        key: key.to_string(),
        size: size as u64,
        last_modified: Some(Utc::now()),
        content_type: None,
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_object<'a>(&'a self, req: &'a PutObject) -> BoxFuture<'a, StoreResult<ObjectInfo>> {
        Box::pin(async move {
            self.check(&req.bucket)?;
            let bytes = tokio::fs::read(&req.source).await?;
            if self.hangs() {
                futures::future::pending::<()>().await;
            }
            let size = bytes.len();
            self.state
                .lock()
                .unwrap()
                .objects
                .insert((req.bucket.clone(), req.key.clone()), bytes);
            Ok(ObjectInfo {
                content_type: req.content_type.clone(),
                ..info(&req.key, size)
            })
        })
    }

    fn get_object<'a>(&'a self, bucket: &'a str, key: &'a str, dest: &'a Path) -> BoxFuture<'a, StoreResult<ObjectInfo>> {
        Box::pin(async move {
            self.check(bucket)?;
            let bytes = self.object(bucket, key).ok_or_else(|| StoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
            if self.hangs() {
                tokio::fs::write(dest, &bytes[..bytes.len() / 2]).await?;
                futures::future::pending::<()>().await;
            }
            tokio::fs::write(dest, &bytes).await?;
            Ok(info(key, bytes.len()))
        })
    }

    fn list_objects<'a>(&'a self, bucket: &'a str, req: &'a ListObjects) -> BoxFuture<'a, StoreResult<Vec<ObjectInfo>>> {
        Box::pin(async move {
            self.check(bucket)?;
            let prefix = req.prefix.clone().unwrap_or_default();
            let state = self.state.lock().unwrap();
            Ok(state
                .objects
                .iter()
                .filter(|((b, k), _)| b == bucket && k.starts_with(&prefix))
                .take(req.max_keys)
                .map(|((_, k), v)| info(k, v.len()))
                .collect())
        })
    }

    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.check(bucket)?;
            self.state
                .lock()
                .unwrap()
                .objects
                .remove(&(bucket.to_string(), key.to_string()));
            Ok(())
        })
    }
}
