use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, Ordering};

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dagstep_core::error::{DagstepError, Result};
use dagstep_core::lifecycle::RunControl;
use dagstep_core::traits::{Executor, ExitCoder, Extensions, OutputSink};
use dagstep_core::types::{ExecutorCapabilities, Step};

use super::split_shell;
use crate::output::Sinks;
use crate::registry::Registration;

/// Exit code reported before a process has exited, or when it was killed.
const NO_EXIT_STATUS: i32 = -1;

pub fn registration() -> Registration {
    Registration::new(ExecutorCapabilities::ALL, |_, step| {
        Ok(Box::new(CommandExecutor::new(step.clone())))
    })
    .with_validator(validate)
}

fn validate(step: &Step) -> Result<()> {
    if step.commands.is_empty() && step.script.is_none() {
        return Err(DagstepError::config(format!(
            "step {}: command or script is required",
            step.name
        )));
    }
    if step.commands.iter().any(|c| c.command.trim().is_empty()) {
        return Err(DagstepError::config(format!(
            "step {}: command must not be empty",
            step.name
        )));
    }
    Ok(())
}

/// Runs local processes: each command line through the step's shell, or the
/// step's script as a file.
pub struct CommandExecutor {
    step: Step,
    sinks: Sinks,
    control: RunControl,
    exit_code: AtomicI32,
}

impl CommandExecutor {
    pub fn new(step: Step) -> Self {
        let control = RunControl::new(step.name.clone());
        Self {
            step,
            sinks: Sinks::default(),
            control,
            exit_code: AtomicI32::new(NO_EXIT_STATUS),
        }
    }

    async fn run_commands(&self) -> Result<()> {
        let (shell, shell_args) = split_shell(self.step.shell.as_deref());

        if let Some(script) = &self.step.script {
            let file = ScriptFile::create(script).await?;
            let mut cmd = match self.step.commands.first() {
                Some(entry) => {
                    let mut cmd = Command::new(&entry.command);
                    cmd.args(&entry.args);
                    cmd
                }
                None => {
                    let mut cmd = Command::new(&shell);
                    cmd.args(&shell_args);
                    cmd
                }
            };
            cmd.arg(file.path());
            return self.spawn(cmd).await;
        }

        for entry in &self.step.commands {
            let mut cmd = Command::new(&shell);
            cmd.args(&shell_args).arg("-c").arg(entry.command_line());
            self.spawn(cmd).await?;
        }
        Ok(())
    }

    async fn spawn(&self, mut cmd: Command) -> Result<()> {
        if let Some(dir) = &self.step.dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.step.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let program = cmd.as_std().get_program().to_string_lossy().into_owned();
        debug!(step = %self.step.name, program = %program, "Spawning process");

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DagstepError::ResourceNotFound {
                operation: "spawn".into(),
                target: program.clone(),
            },
            _ => DagstepError::backend("spawn", e),
        })?;

        let mut child_out = child.stdout.take();
        let mut child_err = child.stderr.take();
        let mut out = self.sinks.stdout.lock().await;
        let mut err = self.sinks.stderr.lock().await;

        let pump_out = async {
            match child_out.as_mut() {
                Some(r) => tokio::io::copy(r, &mut *out).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let pump_err = async {
            match child_err.as_mut() {
                Some(r) => tokio::io::copy(r, &mut *err).await.map(|_| ()),
                None => Ok(()),
            }
        };
        let (out_res, err_res, status) = tokio::join!(pump_out, pump_err, child.wait());
        let status = status?;
        out_res?;
        err_res?;
        out.flush().await?;
        err.flush().await?;

        let code = status.code().unwrap_or(NO_EXIT_STATUS);
        self.exit_code.store(code, Ordering::SeqCst);
        if status.success() {
            Ok(())
        } else {
            Err(DagstepError::failed(
                self.step.name.clone(),
                format!("{program} exited with code {code}"),
            ))
        }
    }
}

impl Executor for CommandExecutor {
    fn set_output_sinks(&mut self, stdout: OutputSink, stderr: OutputSink) {
        self.sinks.set(stdout, stderr);
    }

    fn run(&self, ctx: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let token = self.control.begin(&ctx)?;
            info!(step = %self.step.name, executor = "command", "Step started");

            let result = self.control.until_cancelled(&token, self.run_commands()).await;
            self.control.finish();

            match &result {
                Ok(()) => info!(step = %self.step.name, "Step finished"),
                Err(e) if e.is_canceled() => {
                    self.exit_code.store(NO_EXIT_STATUS, Ordering::SeqCst);
                    warn!(step = %self.step.name, "Step canceled; child process killed");
                }
                Err(e) => warn!(step = %self.step.name, kind = %e.kind(), error = %e, "Step failed"),
            }
            result
        })
    }

    fn kill(&self) -> Result<()> {
        self.control.kill();
        Ok(())
    }

    fn extensions(&self) -> Extensions<'_> {
        Extensions {
            exit_code: Some(self),
            ..Extensions::default()
        }
    }
}

impl ExitCoder for CommandExecutor {
    fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

/// Script body written to a private temp file, removed on drop.
struct ScriptFile {
    path: PathBuf,
}

impl ScriptFile {
    async fn create(body: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("dagstep-script-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, body).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScriptFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
