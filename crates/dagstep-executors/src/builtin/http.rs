use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dagstep_core::coerce;
use dagstep_core::error::{DagstepError, Result};
use dagstep_core::lifecycle::RunControl;
use dagstep_core::traits::{Executor, ExitCoder, Extensions, OutputSink};
use dagstep_core::types::{BuildContext, ExecutorCapabilities, Step};

use super::{exit, exit_code_for};
use crate::output::Sinks;
use crate::registry::Registration;

pub fn registration() -> Registration {
    Registration::new(ExecutorCapabilities::single_command(), |ctx, step| {
        Ok(Box::new(HttpExecutor::new(ctx, step)?))
    })
    .with_validator(|step| {
        request_line(step)?;
        HttpConfig::resolve(&BuildContext::default(), step).map(|_| ())
    })
}

/// Per-step HTTP options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    /// Seconds; 0 disables the timeout.
    #[serde(default)]
    pub timeout: u64,
    /// Print only the body.
    #[serde(default)]
    pub silent: bool,
    /// Print `{statusCode, headers, body}` as JSON.
    #[serde(default)]
    pub json: bool,
    #[serde(default, rename = "skipTLSVerify")]
    pub skip_tls_verify: bool,
}

impl HttpConfig {
    /// Ambient `[defaults.http]` overlaid with the step's own config.
    pub fn resolve(ctx: &BuildContext, step: &Step) -> Result<Self> {
        coerce::decode_layered(
            &Self::default(),
            &[ctx.defaults.for_type("http"), &step.executor.config],
        )
        .map_err(|e| DagstepError::config(format!("step {}: http config: {e}", step.name)))
    }
}

/// Method from the command, URL from its first argument.
fn request_line(step: &Step) -> Result<(Method, String)> {
    let entry = step.commands.first().ok_or_else(|| {
        DagstepError::config(format!("step {}: http method is required", step.name))
    })?;
    let method = Method::from_bytes(entry.command.trim().to_uppercase().as_bytes()).map_err(|_| {
        DagstepError::config(format!(
            "step {}: invalid http method: {}",
            step.name, entry.command
        ))
    })?;
    let url = entry.args.first().filter(|u| !u.trim().is_empty()).ok_or_else(|| {
        DagstepError::config(format!("step {}: http url is required", step.name))
    })?;
    Ok((method, url.clone()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonOutput {
    status_code: u16,
    headers: BTreeMap<String, String>,
    body: serde_json::Value,
}

/// Issues one HTTP request and writes the response to stdout.
pub struct HttpExecutor {
    step_name: String,
    method: Method,
    url: String,
    config: HttpConfig,
    sinks: Sinks,
    control: RunControl,
    exit_code: AtomicI32,
}

impl HttpExecutor {
    pub fn new(ctx: &BuildContext, step: &Step) -> Result<Self> {
        let (method, url) = request_line(step)?;
        Ok(Self {
            step_name: step.name.clone(),
            method,
            url,
            config: HttpConfig::resolve(ctx, step)?,
            sinks: Sinks::default(),
            control: RunControl::new(step.name.clone()),
            exit_code: AtomicI32::new(exit::OK),
        })
    }

    fn operation(&self) -> String {
        format!("{} {}", self.method, self.url)
    }

    async fn send(&self) -> Result<()> {
        let mut builder =
            reqwest::Client::builder().danger_accept_invalid_certs(self.config.skip_tls_verify);
        if self.config.timeout > 0 {
            builder = builder.timeout(Duration::from_secs(self.config.timeout));
        }
        let client = builder
            .build()
            .map_err(|e| DagstepError::backend("http client", e))?;

        let mut req = client.request(self.method.clone(), &self.url);
        if !self.config.query.is_empty() {
            req = req.query(&self.config.query);
        }
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &self.config.body {
            req = req.body(body.clone());
        }

        debug!(step = %self.step_name, method = %self.method, url = %self.url, "Sending request");
        let resp = req.send().await.map_err(|e| self.classify(e))?;
        let status = resp.status();
        let version = resp.version();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| self.classify(e))?;

        if self.config.json {
            let output = JsonOutput {
                status_code: status.as_u16(),
                headers: flatten_headers(&headers),
                body: serde_json::from_slice(&body)
                    .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned().into()),
            };
            let mut rendered = serde_json::to_vec_pretty(&output)?;
            rendered.push(b'\n');
            self.sinks.write_stdout(&rendered).await?;
        } else {
            if !self.config.silent {
                let mut head = format!("{version:?} {status}\n");
                for (k, v) in &flatten_headers(&headers) {
                    head.push_str(&format!("{k}: {v}\n"));
                }
                head.push('\n');
                self.sinks.write_stdout(head.as_bytes()).await?;
            }
            self.sinks.write_stdout(&body).await?;
        }

        self.check_status(status)
    }

    fn check_status(&self, status: StatusCode) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        let detail = format!("http status code not 2xx: {status}");
        Err(match status {
            StatusCode::UNAUTHORIZED => DagstepError::InvalidCredentials {
                operation: self.operation(),
                message: detail,
            },
            StatusCode::FORBIDDEN => DagstepError::PermissionDenied {
                operation: self.operation(),
                target: detail,
            },
            StatusCode::NOT_FOUND => DagstepError::ResourceNotFound {
                operation: self.operation(),
                target: detail,
            },
            _ => DagstepError::failed(self.operation(), detail),
        })
    }

    fn classify(&self, err: reqwest::Error) -> DagstepError {
        if err.is_timeout() {
            DagstepError::Timeout {
                operation: self.operation(),
                timeout_secs: self.config.timeout,
            }
        } else if err.is_connect() {
            DagstepError::network(self.operation(), err)
        } else if err.is_builder() {
            DagstepError::config(format!("{}: {err}", self.operation()))
        } else {
            DagstepError::backend(self.operation(), err)
        }
    }
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|v| {
                v.push_str(", ");
                v.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

impl Executor for HttpExecutor {
    fn set_output_sinks(&mut self, stdout: OutputSink, stderr: OutputSink) {
        self.sinks.set(stdout, stderr);
    }

    fn run(&self, ctx: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let token = self.control.begin(&ctx)?;
            info!(step = %self.step_name, executor = "http", "Step started");

            let result = self.control.until_cancelled(&token, self.send()).await;
            self.control.finish();

            let code = match &result {
                Ok(()) => exit::OK,
                Err(e) => {
                    warn!(step = %self.step_name, kind = %e.kind(), error = %e, "Request failed");
                    exit_code_for(e)
                }
            };
            self.exit_code.store(code, Ordering::SeqCst);
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

impl ExitCoder for HttpExecutor {
    fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }
}
