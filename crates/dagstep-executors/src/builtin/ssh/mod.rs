//! Remote command execution over SSH, optionally through a bastion host.

mod config;
mod dial;

pub use config::{parse_duration, BastionConfig, SshConfig};
pub use dial::ChainedSession;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dagstep_core::error::{DagstepError, Result};
use dagstep_core::lifecycle::RunControl;
use dagstep_core::traits::{Executor, ExitCoder, Extensions, OutputSink, SshSession, SshTransport};
use dagstep_core::types::{BuildContext, ExecutorCapabilities, SshHost, Step};

use super::exit_code_for;
use crate::output::Sinks;
use crate::registry::Registration;
use dial::{classify, close_quietly, Dialer};

const NO_EXIT_STATUS: i32 = -1;

pub fn registration(transport: Arc<dyn SshTransport>) -> Registration {
    Registration::new(ExecutorCapabilities::ALL, move |ctx, step| {
        Ok(Box::new(SshExecutor::new(ctx, step, transport.clone())?))
    })
    // `user` and `host` may come from `[defaults.ssh]`; checked at build time.
    .with_validator(|step| SshConfig::resolve(&BuildContext::default(), step).map(|_| ()))
}

/// Quote `s` for a POSIX shell unless it is plainly safe.
fn shell_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Wrap the step's work in a function so `set -e` and the working directory
/// apply to all of it.
fn build_script(step: &Step) -> Option<String> {
    let body = match &step.script {
        Some(script) if !script.trim().is_empty() => script.trim_end().to_string(),
        _ if !step.commands.is_empty() => step
            .commands
            .iter()
            .map(|c| {
                let mut line = c.command.clone();
                for arg in &c.args {
                    line.push(' ');
                    line.push_str(&shell_quote(arg));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };

    let mut script = String::from("__dagstep_exec(){\nset -e\n");
    if let Some(dir) = &step.dir {
        script.push_str(&format!(
            "cd {} || return 1\n",
            shell_quote(&dir.to_string_lossy())
        ));
    }
    for (k, v) in &step.env {
        script.push_str(&format!("export {k}={}\n", shell_quote(v)));
    }
    script.push_str(&body);
    script.push_str("\n}\n__dagstep_exec\n");
    Some(script)
}

pub struct SshExecutor {
    step_name: String,
    target: SshHost,
    bastion: Option<SshHost>,
    timeout: std::time::Duration,
    /// Full remote command line; `None` when the step has nothing to run.
    command: Option<String>,
    transport: Arc<dyn SshTransport>,
    sinks: Sinks,
    control: RunControl,
    exit_code: AtomicI32,
}

impl SshExecutor {
    pub fn new(ctx: &BuildContext, step: &Step, transport: Arc<dyn SshTransport>) -> Result<Self> {
        let config = SshConfig::resolve(ctx, step)?;
        config.validate().map_err(|e| match e {
            DagstepError::Config(message) => {
                DagstepError::config(format!("step {}: {message}", step.name))
            }
            other => other,
        })?;

        let (shell, args) = config.remote_shell(step);
        let command = build_script(step).map(|script| {
            let mut line = shell_quote(&shell);
            for arg in &args {
                line.push(' ');
                line.push_str(&shell_quote(arg));
            }
            line.push_str(" -c ");
            line.push_str(&shell_quote(&script));
            line
        });

        Ok(Self {
            step_name: step.name.clone(),
            target: config.target(),
            bastion: config.bastion_host(),
            timeout: config.connect_timeout()?,
            command,
            transport,
            sinks: Sinks::default(),
            control: RunControl::new(step.name.clone()),
            exit_code: AtomicI32::new(NO_EXIT_STATUS),
        })
    }

    fn operation(&self) -> String {
        format!("ssh {}@{}", self.target.user, self.target.host_port())
    }

    async fn dial(&self, token: &CancellationToken) -> Result<Box<dyn SshSession>> {
        let dialer = Dialer {
            transport: self.transport.as_ref(),
            timeout: self.timeout,
        };
        let Some(bastion) = &self.bastion else {
            return self.control.until_cancelled(token, dialer.connect(&self.target)).await;
        };

        info!(step = %self.step_name, bastion = %bastion.host_port(), "Connecting through bastion");
        let jump = self.control.until_cancelled(token, dialer.connect(bastion)).await?;
        // `hop` owns the bastion session from here and closes it on failure,
        // except when cancellation drops it mid-handshake.
        self.control
            .until_cancelled(token, dialer.hop(jump, bastion, &self.target))
            .await
    }

    async fn execute(&self, token: &CancellationToken, command: &str) -> Result<i32> {
        let mut session = self.dial(token).await?;

        let mut stdout = self.sinks.stdout.lock().await;
        let mut stderr = self.sinks.stderr.lock().await;
        let status = self
            .control
            .until_cancelled(token, async {
                session
                    .exec(command, &mut *stdout, &mut *stderr)
                    .await
                    .map_err(|e| classify(&self.target, e))
            })
            .await;
        drop((stdout, stderr));

        close_quietly(session, &self.target).await;
        status
    }
}

impl Executor for SshExecutor {
    fn set_output_sinks(&mut self, stdout: OutputSink, stderr: OutputSink) {
        self.sinks.set(stdout, stderr);
    }

    fn run(&self, ctx: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let token = self.control.begin(&ctx)?;
            let Some(command) = &self.command else {
                self.control.finish();
                self.exit_code.store(0, Ordering::SeqCst);
                return Ok(());
            };
            info!(step = %self.step_name, executor = "ssh", host = %self.target.host_port(), "Step started");

            let result = self.execute(&token, command).await;
            self.control.finish();

            match result {
                Ok(0) => {
                    self.exit_code.store(0, Ordering::SeqCst);
                    Ok(())
                }
                Ok(code) => {
                    self.exit_code.store(code, Ordering::SeqCst);
                    warn!(step = %self.step_name, exit_code = code, "Remote command failed");
                    Err(DagstepError::failed(
                        self.operation(),
                        format!("remote command exited with code {code}"),
                    ))
                }
                Err(e) => {
                    let code = if e.is_canceled() { NO_EXIT_STATUS } else { exit_code_for(&e) };
                    self.exit_code.store(code, Ordering::SeqCst);
                    warn!(step = %self.step_name, kind = %e.kind(), error = %e, "ssh step failed");
                    Err(e)
                }
            }
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

impl ExitCoder for SshExecutor {
    fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use dagstep_core::ErrorKind;
    use dagstep_test_utils::{ssh_step, MockSshTransport, SharedBuffer};
    use serde_json::json;

    fn build(step: &Step, transport: &MockSshTransport) -> (Arc<SshExecutor>, SharedBuffer, SharedBuffer) {
        let mut exec =
            SshExecutor::new(&BuildContext::default(), step, Arc::new(transport.clone())).unwrap();
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        exec.set_output_sinks(out.sink(), err.sink());
        (Arc::new(exec), out, err)
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp"), "/tmp");
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_build_script() {
        let mut step = ssh_step("s", "git pull", json!({}));
        step.commands.push(dagstep_core::CommandEntry::new("echo").with_args(["hello world"]));
        step.dir = Some(PathBuf::from("/app/src"));

        let script = build_script(&step).unwrap();
        assert!(script.starts_with("__dagstep_exec(){\nset -e\n"));
        assert!(script.contains("cd /app/src || return 1\n"));
        assert!(script.contains("git pull\necho 'hello world'\n"));
        assert!(script.ends_with("}\n__dagstep_exec\n"));

        let mut scripted = Step::new("s");
        scripted.script = Some("echo 'line1'\necho 'line2'\n".into());
        let script = build_script(&scripted).unwrap();
        assert!(script.contains("echo 'line1'\necho 'line2'\n}"));

        assert!(build_script(&Step::new("empty")).is_none());
    }

    #[tokio::test]
    async fn test_direct_exec() {
        let transport = MockSshTransport::new().with_output("up 3 days\n", "warn\n");
        let step = ssh_step("s", "uptime", json!({"user": "deploy", "host": "web1"}));
        let (exec, out, err) = build(&step, &transport);

        exec.run(CancellationToken::new()).await.unwrap();
        assert_eq!(out.contents(), "up 3 days\n");
        assert_eq!(err.contents(), "warn\n");
        assert_eq!(exec.exit_code(), 0);

        let events = transport.events();
        assert_eq!(events[0], "connect deploy@web1:22");
        assert!(events[1].starts_with("exec /bin/sh -c '__dagstep_exec(){"));
        assert!(events[1].contains("uptime"));
        assert_eq!(events[2], "close web1:22");
    }

    #[tokio::test]
    async fn test_through_bastion() {
        let transport = MockSshTransport::new();
        let step = ssh_step(
            "s",
            "hostname",
            json!({
                "user": "deploy",
                "ip": "10.0.0.9",
                "shell": "/bin/bash -e",
                "bastion": {"host": "jump", "port": 2222, "user": "hop"},
            }),
        );
        let (exec, _, _) = build(&step, &transport);
        exec.run(CancellationToken::new()).await.unwrap();

        let events = transport.events();
        assert_eq!(events[0], "connect hop@jump:2222");
        assert_eq!(events[1], "tunnel 10.0.0.9:22");
        assert_eq!(events[2], "connect_over deploy@10.0.0.9:22");
        assert!(events[3].starts_with("exec /bin/bash -e -c "));
        assert_eq!(&events[4..], ["close 10.0.0.9:22", "close jump:2222"]);
    }

    #[tokio::test]
    async fn test_remote_exit_status() {
        let transport = MockSshTransport::new().with_exit_status(3);
        let step = ssh_step("s", "false", json!({"user": "u", "host": "h"}));
        let (exec, _, _) = build(&step, &transport);
        let err = exec.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
        assert!(err.to_string().contains("exited with code 3"));
        assert_eq!(exec.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let transport = MockSshTransport::new().rejecting("h");
        let step = ssh_step("s", "ls", json!({"user": "u", "host": "h"}));
        let (exec, _, _) = build(&step, &transport);
        let err = exec.run(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCredentials);
        assert_eq!(exec.exit_code(), crate::builtin::exit::AUTH);
    }

    #[tokio::test]
    async fn test_kill_hanging_command_closes_session() {
        let transport = MockSshTransport::new().hanging();
        let step = ssh_step("s", "sleep 600", json!({"user": "u", "host": "h"}));
        let (exec, _, _) = build(&step, &transport);

        let runner = exec.clone();
        let handle = tokio::spawn(async move { runner.run(CancellationToken::new()).await });
        while !transport.events().iter().any(|e| e.starts_with("exec")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        exec.kill().unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_canceled());
        assert_eq!(exec.exit_code(), NO_EXIT_STATUS);
        assert_eq!(transport.events().last().unwrap(), "close h:22");
    }

    #[tokio::test]
    async fn test_nothing_to_run() {
        let transport = MockSshTransport::new();
        let step = dagstep_test_utils::typed_step("s", "ssh", None, json!({"user": "u", "host": "h"}));
        let (exec, _, _) = build(&step, &transport);
        exec.run(CancellationToken::new()).await.unwrap();
        assert!(transport.events().is_empty());
    }

    #[test]
    fn test_missing_host_is_config_error() {
        let step = ssh_step("s", "ls", json!({"user": "u"}));
        let err = SshExecutor::new(&BuildContext::default(), &step, Arc::new(MockSshTransport::new()))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("step s: ssh host is required"));
    }
}
