use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use dagstep_core::coerce;
use dagstep_core::error::{DagstepError, Result};
use dagstep_core::types::{BuildContext, SshHost, Step};

use crate::builtin::split_shell;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_TIMEOUT: &str = "30s";

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_true() -> bool {
    true
}
fn default_timeout() -> String {
    DEFAULT_TIMEOUT.to_string()
}

/// Jump host the target is reached through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BastionConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Falls back to the target's user.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_true")]
    pub strict_host_key: bool,
    #[serde(default)]
    pub known_host_file: String,
    /// Remote shell, optionally with arguments (`"/bin/bash -e"`).
    #[serde(default)]
    pub shell: String,
    #[serde(default)]
    pub shell_args: Vec<String>,
    /// Connection timeout, e.g. `"30s"`, `"1m"` or plain seconds.
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default)]
    pub bastion: Option<BastionConfig>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            host: String::new(),
            port: DEFAULT_PORT,
            key: String::new(),
            password: String::new(),
            strict_host_key: true,
            known_host_file: String::new(),
            shell: String::new(),
            shell_args: Vec::new(),
            timeout: default_timeout(),
            bastion: None,
        }
    }
}

/// `ip` is accepted in place of `host`.
fn with_host_alias(layer: &Map<String, Value>) -> Cow<'_, Map<String, Value>> {
    let has = |name: &str| layer.keys().any(|k| k.eq_ignore_ascii_case(name));
    if !has("ip") || has("host") {
        return Cow::Borrowed(layer);
    }
    let mut map = layer.clone();
    if let Some(key) = map.keys().find(|k| k.eq_ignore_ascii_case("ip")).cloned() {
        if let Some(value) = map.remove(&key) {
            map.insert("host".to_string(), value);
        }
    }
    Cow::Owned(map)
}

impl SshConfig {
    /// In-code defaults, then `[defaults.ssh]`, then the step's own config.
    pub fn resolve(ctx: &BuildContext, step: &Step) -> Result<Self> {
        let ambient = with_host_alias(ctx.defaults.for_type("ssh"));
        let own = with_host_alias(&step.executor.config);
        coerce::decode_layered(&Self::default(), &[&*ambient, &*own])
            .map_err(|e| DagstepError::config(format!("step {}: ssh config: {e}", step.name)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(DagstepError::config("ssh user is required"));
        }
        if self.host.trim().is_empty() {
            return Err(DagstepError::config("ssh host is required"));
        }
        if let Some(bastion) = &self.bastion {
            if bastion.host.trim().is_empty() {
                return Err(DagstepError::config("ssh bastion host is required"));
            }
        }
        self.connect_timeout()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Result<Duration> {
        match parse_duration(&self.timeout) {
            Some(d) if d.is_zero() => Err(DagstepError::config(format!(
                "timeout must be greater than zero, got {:?}",
                self.timeout
            ))),
            Some(d) => Ok(d),
            None => Err(DagstepError::config(format!(
                "invalid timeout duration: {:?}",
                self.timeout
            ))),
        }
    }

    pub fn target(&self) -> SshHost {
        SshHost {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            key: path(&self.key),
            password: non_empty(&self.password),
            strict_host_key: self.strict_host_key,
            known_host_file: path(&self.known_host_file),
        }
    }

    pub fn bastion_host(&self) -> Option<SshHost> {
        let bastion = self.bastion.as_ref()?;
        let user = if bastion.user.is_empty() {
            self.user.clone()
        } else {
            bastion.user.clone()
        };
        Some(SshHost {
            host: bastion.host.clone(),
            port: bastion.port,
            user,
            key: path(&bastion.key),
            password: non_empty(&bastion.password),
            strict_host_key: self.strict_host_key,
            known_host_file: path(&self.known_host_file),
        })
    }

    /// Remote shell: this config's `shell`, else the step's, else `/bin/sh`.
    pub fn remote_shell(&self, step: &Step) -> (String, Vec<String>) {
        if !self.shell.trim().is_empty() {
            let (shell, args) = split_shell(Some(&self.shell));
            if args.is_empty() {
                return (shell, self.shell_args.clone());
            }
            return (shell, args);
        }
        split_shell(step.shell.as_deref())
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn path(s: &str) -> Option<PathBuf> {
    (!s.is_empty()).then(|| PathBuf::from(s))
}

/// `"500ms"`, `"5s"`, `"1m"`, `"2h"` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().ok()?;
    match unit {
        "" | "s" => Some(Duration::from_secs(n)),
        "ms" => Some(Duration::from_millis(n)),
        "m" => n.checked_mul(60).map(Duration::from_secs),
        "h" => n.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagstep_core::config::AmbientDefaults;
    use dagstep_test_utils::ssh_step;
    use serde_json::json;

    fn resolve(config: Value) -> SshConfig {
        SshConfig::resolve(&BuildContext::default(), &ssh_step("s", "uptime", config)).unwrap()
    }

    #[test]
    fn test_defaults_and_ip_alias() {
        let cfg = resolve(json!({"user": "deploy", "ip": "10.0.0.5", "port": "2222"}));
        assert_eq!(cfg.host, "10.0.0.5");
        assert_eq!(cfg.port, 2222);
        assert!(cfg.strict_host_key);
        assert_eq!(cfg.connect_timeout().unwrap(), Duration::from_secs(30));
        cfg.validate().unwrap();
    }

    #[test]
    fn test_required_fields() {
        let err = resolve(json!({"host": "h"})).validate().unwrap_err();
        assert!(err.to_string().contains("user is required"));
        let err = resolve(json!({"user": "u"})).validate().unwrap_err();
        assert!(err.to_string().contains("host is required"));
    }

    #[test]
    fn test_timeouts() {
        let cfg = resolve(json!({"user": "u", "host": "h", "timeout": "1m"}));
        assert_eq!(cfg.connect_timeout().unwrap(), Duration::from_secs(60));
        let cfg = resolve(json!({"user": "u", "host": "h", "timeout": 5}));
        assert_eq!(cfg.connect_timeout().unwrap(), Duration::from_secs(5));
        let err = resolve(json!({"user": "u", "host": "h", "timeout": "soon"}))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("invalid timeout duration"));
    }

    #[test]
    fn test_ambient_defaults_under_step() {
        let mut ambient = AmbientDefaults::new();
        ambient.set(
            "ssh",
            json!({"user": "ops", "ip": "dag-host", "key": "/keys/id"})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let ctx = BuildContext::new(ambient);
        let step = ssh_step("s", "uptime", json!({"host": "step-host"}));
        let cfg = SshConfig::resolve(&ctx, &step).unwrap();
        assert_eq!(cfg.host, "step-host");
        assert_eq!(cfg.user, "ops");
        assert_eq!(cfg.target().key, Some(PathBuf::from("/keys/id")));
    }

    #[test]
    fn test_bastion() {
        let cfg = resolve(json!({
            "user": "deploy",
            "host": "target.internal",
            "bastion": {"host": "jump.example.com", "port": "2222", "password": "pw"},
        }));
        let jump = cfg.bastion_host().unwrap();
        assert_eq!(jump.host_port(), "jump.example.com:2222");
        assert_eq!(jump.user, "deploy");
        assert_eq!(jump.password.as_deref(), Some("pw"));

        let cfg = resolve(json!({"user": "u", "host": "t", "bastion": {"host": "j"}}));
        assert_eq!(cfg.bastion_host().unwrap().port, 22);
    }

    #[test]
    fn test_shell_resolution() {
        let mut step = ssh_step("s", "ls", json!({}));
        let cfg = resolve(json!({"shell": "/bin/zsh -o pipefail"}));
        assert_eq!(
            cfg.remote_shell(&step),
            ("/bin/zsh".to_string(), vec!["-o".to_string(), "pipefail".to_string()])
        );

        let cfg = resolve(json!({"shell": "/bin/bash", "shellArgs": ["-e"]}));
        assert_eq!(cfg.remote_shell(&step), ("/bin/bash".to_string(), vec!["-e".to_string()]));

        step.shell = Some("/bin/dash -x".into());
        let cfg = resolve(json!({}));
        assert_eq!(cfg.remote_shell(&step), ("/bin/dash".to_string(), vec!["-x".to_string()]));

        step.shell = None;
        assert_eq!(cfg.remote_shell(&step), ("/bin/sh".to_string(), vec![]));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("1d"), None);
        assert_eq!(parse_duration("99999999999999999h"), None);
        assert_eq!(parse_duration("99999999999999999999"), None);
    }

    #[test]
    fn test_unusable_timeouts_are_config_errors() {
        let err = resolve(json!({"user": "u", "host": "h", "timeout": "99999999999999999h"}))
            .validate()
            .unwrap_err();
        assert_eq!(err.kind(), dagstep_core::ErrorKind::Config);
        assert!(err.to_string().contains("invalid timeout duration"));

        for zero in ["0s", "0", "0ms"] {
            let err = resolve(json!({"user": "u", "host": "h", "timeout": zero}))
                .validate()
                .unwrap_err();
            assert_eq!(err.kind(), dagstep_core::ErrorKind::Config);
            assert!(err.to_string().contains("greater than zero"));
        }
    }
}
