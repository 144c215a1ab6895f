use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dagstep_core::error::{DagstepError, Result};
use dagstep_core::lifecycle::RunControl;
use dagstep_core::router::{CompiledRouter, RouterInput, RouterResult};
use dagstep_core::traits::{
    Executor, Extensions, NodeStatusDeterminer, OutputSink, RouterResultProvider,
};
use dagstep_core::types::{BuildContext, ExecutorCapabilities, NodeStatus, Step};

use crate::output::Sinks;
use crate::registry::Registration;

pub fn registration() -> Registration {
    Registration::new(ExecutorCapabilities::NONE, |ctx, step| {
        Ok(Box::new(RouterExecutor::new(ctx, step)?))
    })
    .with_validator(validate)
}

fn validate(step: &Step) -> Result<()> {
    router_config(step)?.validate().map_err(|e| invalid(step, e))
}

fn invalid(step: &Step, err: DagstepError) -> DagstepError {
    let reason = match err {
        DagstepError::Config(message) => message,
        other => other.to_string(),
    };
    DagstepError::config(format!("step {}: router validation failed: {reason}", step.name))
}

fn router_config(step: &Step) -> Result<&dagstep_core::RouterConfig> {
    step.router.as_ref().ok_or_else(|| {
        DagstepError::config(format!("step {} is not configured as a router step", step.name))
    })
}

/// Evaluates a route table and publishes which downstream steps to activate.
/// Does no external work, so `kill` has nothing to stop.
pub struct RouterExecutor {
    step_name: String,
    router: CompiledRouter,
    input: RouterInput,
    sinks: Sinks,
    control: RunControl,
    result: Mutex<Option<RouterResult>>,
}

impl RouterExecutor {
    pub fn new(ctx: &BuildContext, step: &Step) -> Result<Self> {
        let router = router_config(step)?.compile().map_err(|e| invalid(step, e))?;
        Ok(Self {
            step_name: step.name.clone(),
            router,
            input: ctx.router_input.clone(),
            sinks: Sinks::default(),
            control: RunControl::new(step.name.clone()),
            result: Mutex::new(None),
        })
    }

    async fn evaluate(&self) -> Result<()> {
        let value = self.input.resolve(self.router.value_template());
        let decision = self.router.evaluate(&value, self.input.exit_code);

        info!(
            step = %self.step_name,
            value = %value,
            matched = ?decision.matched_patterns,
            activated = ?decision.activated_steps,
            "Router evaluated"
        );

        let mut trace = String::from("Evaluating router patterns\n");
        if decision.matched_patterns.is_empty() {
            trace.push_str("No patterns matched (using default)\n");
        } else {
            trace.push_str(&format!(
                "Matched patterns: [{}]\n",
                decision.matched_patterns.join(", ")
            ));
        }
        trace.push_str(&format!(
            "Activated steps: [{}]\n",
            decision.activated_steps.join(", ")
        ));

        // The decision is published before the trace; a broken sink only costs the trace.
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(RouterResult::new(value, decision));

        if let Err(e) = self.sinks.write_stdout(trace.as_bytes()).await {
            warn!(step = %self.step_name, error = %e, "Failed to write router trace");
        }
        Ok(())
    }
}

impl Executor for RouterExecutor {
    fn set_output_sinks(&mut self, stdout: OutputSink, stderr: OutputSink) {
        self.sinks.set(stdout, stderr);
    }

    fn run(&self, ctx: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let token = self.control.begin(&ctx)?;
            let result = self.control.until_cancelled(&token, self.evaluate()).await;
            self.control.finish();
            result
        })
    }

    fn kill(&self) -> Result<()> {
        Ok(())
    }

    fn extensions(&self) -> Extensions<'_> {
        Extensions {
            status: Some(self),
            router: Some(self),
            ..Extensions::default()
        }
    }
}

impl NodeStatusDeterminer for RouterExecutor {
    fn determine_status(&self) -> Result<NodeStatus> {
        Ok(NodeStatus::Succeeded)
    }
}

impl RouterResultProvider for RouterExecutor {
    fn router_result(&self) -> Option<RouterResult> {
        self.result.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
