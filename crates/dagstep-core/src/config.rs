use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DagstepError, Result};

/// Engine configuration, usually `dagstep.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub log: LogConfig,
    /// Workflow-level defaults, one table per executor type.
    #[serde(default)]
    pub defaults: AmbientDefaults,
    /// Values router steps may reference as `${NAME}`.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "dagstep=info,warn".to_string()
}

/// Ambient defaults keyed by executor type (`[defaults.s3]`, `[defaults.ssh]`).
///
/// Values stay loosely typed; each backend decodes them under its step config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AmbientDefaults(BTreeMap<String, Map<String, Value>>);

impl AmbientDefaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults for one executor type. Empty when none were configured.
    pub fn for_type(&self, executor_type: &str) -> &Map<String, Value> {
        static EMPTY: std::sync::OnceLock<Map<String, Value>> = std::sync::OnceLock::new();
        self.0
            .get(executor_type)
            .unwrap_or_else(|| EMPTY.get_or_init(Map::new))
    }

    pub fn set(&mut self, executor_type: impl Into<String>, values: Map<String, Value>) {
        self.0.insert(executor_type.into(), values);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl EngineConfig {
    /// Load from a TOML file, expanding `${ENV_VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| DagstepError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| DagstepError::Config(e.to_string()))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) if closed => result.push_str(&val),
                _ => {
                    // Keep original if env var not set
                    result.push_str("${");
                    result.push_str(&var_name);
                    if closed {
                        result.push('}');
                    }
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_DAGSTEP_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_DAGSTEP_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_DAGSTEP_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_DAGSTEP_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_DAGSTEP_VAR}\"");
    }

    #[test]
    fn test_expand_env_vars_unterminated() {
        assert_eq!(expand_env_vars("a ${HOME"), "a ${HOME");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.log.filter, "dagstep=info,warn");
        assert!(config.defaults.is_empty());
        assert!(config.defaults.for_type("s3").is_empty());
        assert!(config.variables.is_empty());
    }

    #[test]
    fn test_ambient_defaults_per_type() {
        let toml_str = r#"
[log]
filter = "dagstep=debug"

[defaults.s3]
region = "us-east-1"
bucket = "dag-bucket"
forcePathStyle = true

[defaults.ssh]
user = "deploy"
port = "2222"

[variables]
ENV = "staging"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log.filter, "dagstep=debug");
        let s3 = config.defaults.for_type("s3");
        assert_eq!(s3["bucket"], Value::String("dag-bucket".into()));
        assert_eq!(s3["forcePathStyle"], Value::Bool(true));
        assert_eq!(config.defaults.for_type("ssh")["port"], Value::String("2222".into()));
        assert!(config.defaults.for_type("http").is_empty());
        assert_eq!(config.variables["ENV"], "staging");
    }

    #[test]
    fn test_load_expands_env_from_file() {
        std::env::set_var("TEST_DAGSTEP_REGION", "eu-central-1");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dagstep.toml");
        std::fs::write(&path, "[defaults.s3]\nregion = \"${TEST_DAGSTEP_REGION}\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(
            config.defaults.for_type("s3")["region"],
            Value::String("eu-central-1".into())
        );
        std::env::remove_var("TEST_DAGSTEP_REGION");
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/dagstep.toml")).unwrap_err();
        assert!(matches!(err, DagstepError::ConfigNotFound(_)));
        assert!(err.to_string().contains("/nonexistent/dagstep.toml"));
    }
}
