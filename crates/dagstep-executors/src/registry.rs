use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use dagstep_core::error::{DagstepError, Result};
use dagstep_core::traits::{Executor, SshTransport};
use dagstep_core::types::{BuildContext, ExecutorCapabilities, Step};

use crate::builtin;
use crate::builtin::s3::ObjectStoreFactory;

/// Builds an executor for one step invocation.
pub type Constructor = Arc<dyn Fn(&BuildContext, &Step) -> Result<Box<dyn Executor>> + Send + Sync>;

/// Backend-specific step validation, run at DAG-load time.
pub type Validator = Arc<dyn Fn(&Step) -> Result<()> + Send + Sync>;

/// Everything the registry knows about one executor type.
#[derive(Clone)]
pub struct Registration {
    constructor: Constructor,
    validator: Option<Validator>,
    capabilities: ExecutorCapabilities,
}

impl Registration {
    pub fn new<F>(capabilities: ExecutorCapabilities, constructor: F) -> Self
    where
        F: Fn(&BuildContext, &Step) -> Result<Box<dyn Executor>> + Send + Sync + 'static,
    {
        Self {
            constructor: Arc::new(constructor),
            validator: None,
            capabilities,
        }
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Step) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn capabilities(&self) -> ExecutorCapabilities {
        self.capabilities
    }
}

/// External clients the built-in backends are wired to.
#[derive(Clone, Default)]
pub struct Collaborators {
    /// SSH wire protocol. The `ssh` executor is registered only when set.
    pub ssh_transport: Option<Arc<dyn SshTransport>>,
    /// Object store client for non-`file://` s3 endpoints.
    pub object_store: Option<ObjectStoreFactory>,
}

/// Registry of executor types.
///
/// Populated once at startup and read-only afterwards; share it behind an
/// `Arc` across concurrent step invocations.
pub struct ExecutorRegistry {
    executors: HashMap<String, Registration>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register an executor type. A later registration replaces an earlier one.
    pub fn register(&mut self, executor_type: impl Into<String>, registration: Registration) {
        let executor_type = executor_type.into();
        debug!(executor = %executor_type, "Registering executor");
        self.executors.insert(executor_type, registration);
    }

    /// Make `alias` resolve to the same registration as `target`.
    pub fn alias(&mut self, alias: impl Into<String>, target: &str) -> Result<()> {
        let registration = self.executors.get(target).cloned().ok_or_else(|| {
            DagstepError::config(format!("cannot alias unknown executor type: {target}"))
        })?;
        self.executors.insert(alias.into(), registration);
        Ok(())
    }

    pub fn contains(&self, executor_type: &str) -> bool {
        self.executors.contains_key(executor_type)
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.executors.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    pub fn capabilities(&self, executor_type: &str) -> Option<ExecutorCapabilities> {
        self.executors.get(executor_type).map(|r| r.capabilities)
    }

    /// Check a step against its executor's capabilities and validator.
    pub fn validate(&self, step: &Step) -> Result<()> {
        let executor_type = step.executor_type();
        let registration = self.lookup(executor_type)?;
        let caps = registration.capabilities;

        if !caps.command && !step.commands.is_empty() {
            return Err(unsupported(step, executor_type, "command"));
        }
        if !caps.multiple_commands && step.commands.len() > 1 {
            return Err(unsupported(step, executor_type, "multiple commands"));
        }
        if !caps.script && step.script.is_some() {
            return Err(unsupported(step, executor_type, "script"));
        }
        if !caps.shell && step.shell.is_some() {
            return Err(unsupported(step, executor_type, "shell"));
        }

        match &registration.validator {
            Some(validate) => validate(step),
            None => Ok(()),
        }
    }

    /// Validate `step` and construct a fresh executor for it.
    pub fn build(&self, ctx: &BuildContext, step: &Step) -> Result<Box<dyn Executor>> {
        self.validate(step)?;
        let executor_type = step.executor_type();
        debug!(step = %step.name, executor = %executor_type, "Building executor");
        let registration = self.lookup(executor_type)?;
        (registration.constructor)(ctx, step)
    }

    fn lookup(&self, executor_type: &str) -> Result<&Registration> {
        self.executors.get(executor_type).ok_or_else(|| {
            DagstepError::config(format!("executor type not registered: {executor_type}"))
        })
    }

    /// Create a registry with all built-in executors registered.
    pub fn with_builtins(collaborators: Collaborators) -> Self {
        let mut registry = Self::new();

        let command = builtin::command::registration();
        registry.register("command", command.clone());
        registry.register("shell", command.clone());
        registry.register("exec", command);

        registry.register("http", builtin::http::registration());
        registry.register("router", builtin::router::registration());
        registry.register("s3", builtin::s3::registration(collaborators.object_store));

        let hitl = builtin::hitl::registration();
        registry.register("hitl", hitl.clone());
        registry.register("approval", hitl);

        if let Some(transport) = collaborators.ssh_transport {
            registry.register("ssh", builtin::ssh::registration(transport));
        }

        registry
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn unsupported(step: &Step, executor_type: &str, feature: &str) -> DagstepError {
    DagstepError::config(format!(
        "step {}: executor type {executor_type} does not support {feature}",
        step.name
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagstep_core::types::CommandEntry;
    use dagstep_core::RouterConfig;

    fn registry() -> ExecutorRegistry {
        ExecutorRegistry::with_builtins(Collaborators::default())
    }

    #[test]
    fn test_builtin_types_sorted() {
        let reg = registry();
        assert_eq!(
            reg.types(),
            vec!["approval", "command", "exec", "hitl", "http", "router", "s3", "shell"]
        );
        assert!(!reg.contains("ssh"));
    }

    #[test]
    fn test_unknown_type_is_config_error() {
        let mut step = Step::new("x");
        step.executor.executor_type = "docker".into();
        let err = registry().validate(&step).unwrap_err();
        assert_eq!(err.kind(), dagstep_core::ErrorKind::Config);
        assert!(err.to_string().contains("docker"));
    }

    #[test]
    fn test_alias_requires_target() {
        let mut reg = ExecutorRegistry::new();
        assert!(reg.alias("sh", "command").is_err());
        reg.register("command", builtin::command::registration());
        reg.alias("sh", "command").unwrap();
        assert_eq!(reg.capabilities("sh"), reg.capabilities("command"));
    }

    #[test]
    fn test_capability_checks() {
        let reg = registry();

        let mut step = Step::new("route");
        step.router = Some(RouterConfig::new("v").default_targets(["a"]));
        step.commands.push(CommandEntry::new("echo"));
        let err = reg.validate(&step).unwrap_err();
        assert!(err.to_string().contains("does not support command"));

        let mut step = Step::new("fetch");
        step.executor.executor_type = "http".into();
        step.commands.push(CommandEntry::new("GET").with_args(["http://a"]));
        step.commands.push(CommandEntry::new("GET").with_args(["http://b"]));
        let err = reg.validate(&step).unwrap_err();
        assert!(err.to_string().contains("multiple commands"));

        let mut step = Step::new("gate");
        step.executor.executor_type = "hitl".into();
        step.script = Some("echo".into());
        assert!(reg.validate(&step).unwrap_err().to_string().contains("script"));

        let mut step = Step::new("gate");
        step.executor.executor_type = "approval".into();
        step.shell = Some("bash".into());
        assert!(reg.validate(&step).unwrap_err().to_string().contains("shell"));
    }

    #[test]
    fn test_build_runs_validation_first() {
        let mut step = Step::new("route");
        step.router = Some(RouterConfig::new(""));
        let err = registry()
            .build(&BuildContext::default(), &step)
            .err()
            .expect("router without value must not build");
        assert!(err.to_string().contains("router.value is required"));
    }

    #[test]
    fn test_custom_registration() {
        let mut reg = ExecutorRegistry::new();
        reg.register(
            "noop",
            Registration::new(ExecutorCapabilities::NONE, |_, _| {
                Err(DagstepError::config("noop cannot build"))
            })
            .with_validator(|step| {
                if step.name.is_empty() {
                    Err(DagstepError::config("name required"))
                } else {
                    Ok(())
                }
            }),
        );
        let mut step = Step::new("");
        step.executor.executor_type = "noop".into();
        assert!(reg.validate(&step).unwrap_err().to_string().contains("name required"));
        step.name = "n".into();
        assert!(reg.validate(&step).is_ok());
        assert_eq!(reg.capabilities("noop"), Some(ExecutorCapabilities::NONE));
    }
}
