use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::AmbientDefaults;
use crate::router::{RouterConfig, RouterInput};

/// Executor type used when a step declares none.
pub const DEFAULT_EXECUTOR: &str = "command";

/// One command line of a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandEntry {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Command and arguments joined for display and shell execution.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// Backend selection plus its opaque, loosely typed configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default, rename = "type")]
    pub executor_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl ExecutorConfig {
    pub fn new(executor_type: impl Into<String>) -> Self {
        Self {
            executor_type: executor_type.into(),
            config: Map::new(),
        }
    }
}

/// Immutable descriptor of one DAG node. Executors read it, never mutate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub router: Option<RouterConfig>,
}

impl Step {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Declared executor type, falling back to `router` for router steps and
    /// `command` otherwise.
    pub fn executor_type(&self) -> &str {
        if !self.executor.executor_type.is_empty() {
            &self.executor.executor_type
        } else if self.router.is_some() {
            "router"
        } else {
            DEFAULT_EXECUTOR
        }
    }
}

/// Scheduler-meaningful outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Waiting,
    Failed,
    Canceled,
    Skipped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Waiting => "waiting",
            NodeStatus::Failed => "failed",
            NodeStatus::Canceled => "canceled",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Structural features a backend accepts, used for generic step validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorCapabilities {
    pub command: bool,
    pub multiple_commands: bool,
    pub script: bool,
    pub shell: bool,
}

impl ExecutorCapabilities {
    pub const NONE: Self = Self {
        command: false,
        multiple_commands: false,
        script: false,
        shell: false,
    };

    pub const ALL: Self = Self {
        command: true,
        multiple_commands: true,
        script: true,
        shell: true,
    };

    pub const fn single_command() -> Self {
        Self {
            command: true,
            ..Self::NONE
        }
    }
}

/// Everything a constructor may read besides the step itself.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    /// Workflow-level defaults keyed by executor type.
    pub defaults: Arc<AmbientDefaults>,
    /// Upstream values a router step branches on.
    pub router_input: RouterInput,
}

impl BuildContext {
    pub fn new(defaults: AmbientDefaults) -> Self {
        Self {
            defaults: Arc::new(defaults),
            router_input: RouterInput::default(),
        }
    }

    pub fn with_router_input(mut self, input: RouterInput) -> Self {
        self.router_input = input;
        self
    }
}

// ── Object storage collaborator types ───────────────────────────

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

/// Upload request handed to an `ObjectStore`.
#[derive(Debug, Clone, Default)]
pub struct PutObject {
    pub bucket: String,
    pub key: String,
    pub source: PathBuf,
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
    pub acl: Option<String>,
    pub server_side_encryption: Option<String>,
    pub sse_kms_key_id: Option<String>,
    pub checksum_algorithm: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub part_size_mb: u64,
    pub concurrency: u32,
}

/// Listing request handed to an `ObjectStore`.
#[derive(Debug, Clone, Default)]
pub struct ListObjects {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: usize,
    pub recursive: bool,
}

/// Errors an object-store client reports before classification.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket not found: {0}")]
    NoSuchBucket(String),

    #[error("object not found: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ── SSH collaborator types ──────────────────────────────────────

/// Resolved address and credentials of one SSH hop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SshHost {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key: Option<PathBuf>,
    pub password: Option<String>,
    pub strict_host_key: bool,
    pub known_host_file: Option<PathBuf>,
}

impl SshHost {
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Errors an SSH transport reports before classification.
#[derive(Debug, Error)]
pub enum SshError {
    #[error("authentication failed for {user}@{host}")]
    AuthFailed { user: String, host: String },

    #[error("host key verification failed for {0}")]
    HostKeyMismatch(String),

    #[error("unreachable: {0}")]
    Unreachable(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_type_falls_back_by_shape() {
        let step = Step::new("plain");
        assert_eq!(step.executor_type(), "command");

        let mut step = Step::new("routed");
        step.router = Some(RouterConfig::default());
        assert_eq!(step.executor_type(), "router");

        let mut step = Step::new("explicit");
        step.executor = ExecutorConfig::new("http");
        assert_eq!(step.executor_type(), "http");
    }

    #[test]
    fn command_line_joins_args() {
        let entry = CommandEntry::new("echo").with_args(["hello", "world"]);
        assert_eq!(entry.command_line(), "echo hello world");
        assert_eq!(CommandEntry::new("true").command_line(), "true");
    }

    #[test]
    fn step_deserializes_from_toml() {
        let step: Step = toml::from_str(
            r#"
name = "fetch"

[[commands]]
command = "GET"
args = ["https://example.com"]

[executor]
type = "http"

[executor.config]
silent = true
timeout = "30"
"#,
        )
        .unwrap();
        assert_eq!(step.executor_type(), "http");
        assert_eq!(step.commands[0].args, vec!["https://example.com"]);
        assert_eq!(step.executor.config["silent"], serde_json::json!(true));
    }
}
