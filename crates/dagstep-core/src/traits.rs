use std::path::Path;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::router::RouterResult;
use crate::types::*;

/// Byte sink for a step's stdout or stderr.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// The lifecycle every backend implements.
///
/// Canonical sequence: construct → `set_output_sinks` → `run` → optional
/// concurrent `kill`. Sinks are set through `&mut self`, so they can only be
/// replaced before the executor is shared with the task driving `run`.
pub trait Executor: Send + Sync + 'static {
    /// Redirect output. Must happen before `run`.
    fn set_output_sinks(&mut self, stdout: OutputSink, stderr: OutputSink);

    /// Perform the unit of work. Single-shot; observes `ctx` and returns a
    /// `Canceled` error instead of hanging when it fires.
    fn run(&self, ctx: CancellationToken) -> BoxFuture<'_, Result<()>>;

    /// Request early termination. Idempotent, non-blocking, and a no-op
    /// before `run` starts or after it completes.
    fn kill(&self) -> Result<()>;

    /// Optional extension interfaces this executor exposes.
    fn extensions(&self) -> Extensions<'_> {
        Extensions::default()
    }
}

/// Capability record returned alongside an executor instead of runtime type probing.
#[derive(Clone, Copy, Default)]
pub struct Extensions<'a> {
    pub status: Option<&'a dyn NodeStatusDeterminer>,
    pub exit_code: Option<&'a dyn ExitCoder>,
    pub router: Option<&'a dyn RouterResultProvider>,
}

/// Reports an outcome beyond plain success/failure (e.g. `Waiting`).
pub trait NodeStatusDeterminer: Send + Sync {
    fn determine_status(&self) -> Result<NodeStatus>;
}

/// Stable integer classification of the last run's outcome.
pub trait ExitCoder: Send + Sync {
    fn exit_code(&self) -> i32;
}

/// Exposes a router step's decision. Every call returns an independent copy;
/// `None` until `run` has completed.
pub trait RouterResultProvider: Send + Sync {
    fn router_result(&self) -> Option<RouterResult>;
}

/// Object storage client used by the s3 executor.
pub trait ObjectStore: Send + Sync + 'static {
    fn put_object<'a>(&'a self, req: &'a PutObject) -> BoxFuture<'a, StoreResult<ObjectInfo>>;

    /// Write the object's bytes to `dest`. The caller owns renaming it into place.
    fn get_object<'a>(
        &'a self,
        bucket: &'a str,
        key: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, StoreResult<ObjectInfo>>;

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        req: &'a ListObjects,
    ) -> BoxFuture<'a, StoreResult<Vec<ObjectInfo>>>;

    fn delete_object<'a>(&'a self, bucket: &'a str, key: &'a str) -> BoxFuture<'a, StoreResult<()>>;
}

/// Bidirectional byte stream, e.g. a tunnel through a bastion host.
pub trait Tunnel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Tunnel for T {}

/// SSH wire protocol: dialing, handshakes and channels.
pub trait SshTransport: Send + Sync + 'static {
    /// Dial `host` directly and authenticate.
    fn connect<'a>(
        &'a self,
        host: &'a SshHost,
    ) -> BoxFuture<'a, std::result::Result<Box<dyn SshSession>, SshError>>;

    /// Authenticate against `host` over an already established tunnel.
    fn connect_over<'a>(
        &'a self,
        tunnel: Box<dyn Tunnel>,
        host: &'a SshHost,
    ) -> BoxFuture<'a, std::result::Result<Box<dyn SshSession>, SshError>>;
}

/// An authenticated SSH connection.
pub trait SshSession: Send {
    /// Open a direct-tcpip channel to `host:port` through this connection.
    fn open_tunnel<'a>(
        &'a mut self,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, std::result::Result<Box<dyn Tunnel>, SshError>>;

    /// Run `command` remotely, streaming its output. Returns the exit status.
    fn exec<'a>(
        &'a mut self,
        command: &'a str,
        stdout: &'a mut OutputSink,
        stderr: &'a mut OutputSink,
    ) -> BoxFuture<'a, std::result::Result<i32, SshError>>;

    fn close(&mut self) -> BoxFuture<'_, std::result::Result<(), SshError>>;
}
