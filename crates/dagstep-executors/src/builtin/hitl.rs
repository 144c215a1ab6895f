use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use dagstep_core::coerce;
use dagstep_core::error::{DagstepError, Result};
use dagstep_core::lifecycle::RunControl;
use dagstep_core::traits::{Executor, Extensions, NodeStatusDeterminer, OutputSink};
use dagstep_core::types::{ExecutorCapabilities, NodeStatus, Step};

use crate::output::Sinks;
use crate::registry::Registration;

pub fn registration() -> Registration {
    Registration::new(ExecutorCapabilities::NONE, |_, step| {
        Ok(Box::new(HitlExecutor::new(step)?))
    })
    .with_validator(|step| HitlConfig::from_step(step).map(|_| ()))
}

/// Human-approval gate configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HitlConfig {
    #[serde(default)]
    pub prompt: Option<String>,
    /// Field names the approver may fill in.
    #[serde(default)]
    pub input: Vec<String>,
    /// Subset of `input` that must be filled in.
    #[serde(default)]
    pub required: Vec<String>,
}

impl HitlConfig {
    pub fn from_step(step: &Step) -> Result<Self> {
        let cfg: Self = coerce::decode_layered(&Self::default(), &[&step.executor.config])?;
        for field in &cfg.required {
            if !cfg.input.contains(field) {
                return Err(DagstepError::config(format!(
                    "step {}: required field '{field}' is not listed in input",
                    step.name
                )));
            }
        }
        Ok(cfg)
    }
}

/// Pauses the workflow until a human approves. `run` only announces the
/// request; the scheduler sees `Waiting` and resumes the DAG out of band.
pub struct HitlExecutor {
    step_name: String,
    config: HitlConfig,
    sinks: Sinks,
    control: RunControl,
    request_id: Mutex<Option<String>>,
}

impl HitlExecutor {
    pub fn new(step: &Step) -> Result<Self> {
        Ok(Self {
            step_name: step.name.clone(),
            config: HitlConfig::from_step(step)?,
            sinks: Sinks::default(),
            control: RunControl::new(step.name.clone()),
            request_id: Mutex::new(None),
        })
    }

    /// Id of the approval request announced by the last run.
    pub fn request_id(&self) -> Option<String> {
        self.request_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn announce(&self) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let prompt = self.config.prompt.as_deref().unwrap_or("Approval required");

        self.sinks.println(prompt).await?;
        if !self.config.required.is_empty() {
            self.sinks
                .println(&format!("Required inputs: {}", self.config.required.join(", ")))
                .await?;
        }
        self.sinks.println(&format!("Approval request: {id}")).await?;

        info!(step = %self.step_name, request_id = %id, "Waiting for approval");
        *self.request_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
        Ok(())
    }
}

impl Executor for HitlExecutor {
    fn set_output_sinks(&mut self, stdout: OutputSink, stderr: OutputSink) {
        self.sinks.set(stdout, stderr);
    }

    fn run(&self, ctx: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let token = self.control.begin(&ctx)?;
            let result = self.control.until_cancelled(&token, self.announce()).await;
            self.control.finish();
            result
        })
    }

    fn kill(&self) -> Result<()> {
        self.control.kill();
        Ok(())
    }

    fn extensions(&self) -> Extensions<'_> {
        Extensions {
            status: Some(self),
            ..Extensions::default()
        }
    }
}

impl NodeStatusDeterminer for HitlExecutor {
    fn determine_status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus::Waiting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagstep_test_utils::{hitl_step, SharedBuffer};
    use serde_json::json;

    #[tokio::test]
    async fn test_announces_and_waits() {
        let step = hitl_step(
            "approve",
            json!({"prompt": "Deploy to prod?", "input": ["reason", "ticket"], "required": "ticket"}),
        );
        let mut exec = HitlExecutor::new(&step).unwrap();
        let out = SharedBuffer::new();
        exec.set_output_sinks(out.sink(), SharedBuffer::new().sink());

        assert!(exec.request_id().is_none());
        exec.run(CancellationToken::new()).await.unwrap();

        let id = exec.request_id().unwrap();
        let output = out.contents();
        assert!(output.starts_with("Deploy to prod?\n"));
        assert!(output.contains("Required inputs: ticket"));
        assert!(output.contains(&id));
        assert_eq!(
            exec.extensions().status.unwrap().determine_status().unwrap(),
            NodeStatus::Waiting
        );
        assert!(exec.extensions().exit_code.is_none());
    }

    #[test]
    fn test_required_must_be_subset_of_input() {
        let step = hitl_step("approve", json!({"input": ["a"], "required": ["b"]}));
        let err = HitlConfig::from_step(&step).unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_empty_config_is_valid() {
        let cfg = HitlConfig::from_step(&hitl_step("approve", json!({}))).unwrap();
        assert_eq!(cfg, HitlConfig::default());
    }
}
