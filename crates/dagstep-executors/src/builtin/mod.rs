pub mod command;
pub mod hitl;
pub mod http;
pub mod router;
pub mod s3;
pub mod ssh;

use dagstep_core::error::{DagstepError, ErrorKind};

pub(crate) const DEFAULT_SHELL: &str = "/bin/sh";

/// Exit code ordinals reported by backends without a native exit status.
pub mod exit {
    pub const OK: i32 = 0;
    pub const FAILED: i32 = 1;
    pub const NOT_FOUND: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NETWORK: i32 = 4;
    pub const CANCELED: i32 = 5;
    pub const CONFIG: i32 = 6;
}

/// Map an error onto the shared exit code ordinals.
pub fn exit_code_for(err: &DagstepError) -> i32 {
    match err.kind() {
        ErrorKind::OperationFailed => exit::FAILED,
        ErrorKind::ResourceNotFound => exit::NOT_FOUND,
        ErrorKind::PermissionDenied | ErrorKind::InvalidCredentials => exit::AUTH,
        ErrorKind::Network | ErrorKind::Timeout => exit::NETWORK,
        ErrorKind::Canceled => exit::CANCELED,
        ErrorKind::Config => exit::CONFIG,
    }
}

/// Split a shell setting such as `"/bin/bash -e"` into program and arguments.
/// Falls back to `/bin/sh` when blank.
pub(crate) fn split_shell(shell: Option<&str>) -> (String, Vec<String>) {
    let mut parts = shell.unwrap_or_default().split_whitespace().map(str::to_string);
    match parts.next() {
        Some(program) => (program, parts.collect()),
        None => (DEFAULT_SHELL.to_string(), Vec::new()),
    }
}
