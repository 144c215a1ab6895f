use std::future::Future;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DagstepError, Result};

#[derive(Debug)]
enum RunState {
    Idle,
    Running(CancellationToken),
    Finished,
}

/// Shared run/kill bookkeeping for executors.
///
/// `begin` derives a per-run token from the caller's context; `kill` cancels
/// that token only while the run is in flight.
#[derive(Debug)]
pub struct RunControl {
    step: String,
    state: Mutex<RunState>,
}

impl RunControl {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            state: Mutex::new(RunState::Idle),
        }
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    /// Mark the run as started. Fails if `run` was already called.
    pub fn begin(&self, ctx: &CancellationToken) -> Result<CancellationToken> {
        let mut state = self.lock();
        match *state {
            RunState::Idle => {
                let token = ctx.child_token();
                *state = RunState::Running(token.clone());
                Ok(token)
            }
            _ => Err(DagstepError::failed(
                self.step.clone(),
                "executor already ran; run is single-shot",
            )),
        }
    }

    pub fn finish(&self) {
        *self.lock() = RunState::Finished;
    }

    /// Cancel the in-flight run. Never blocks beyond a short critical section.
    pub fn kill(&self) {
        if let RunState::Running(token) = &*self.lock() {
            debug!(step = %self.step, "Kill requested");
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), RunState::Running(_))
    }

    /// Race `fut` against `token`, returning `Canceled` when the token fires first.
    /// The losing future is dropped, which releases whatever it owns.
    pub async fn until_cancelled<T, F>(&self, token: &CancellationToken, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DagstepError::canceled(self.step.clone())),
            res = fut => res,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        // A poisoned lock only means a panic elsewhere; the state itself is still valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
