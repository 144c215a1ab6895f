use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dagstep_core::config::EngineConfig;
use dagstep_core::router::RouterInput;
use dagstep_core::traits::Executor;
use dagstep_core::types::{BuildContext, ExecutorCapabilities, Step};
use dagstep_executors::{Collaborators, ExecutorRegistry};

#[derive(Parser)]
#[command(name = "dagstep", version, about = "Run and validate single workflow steps")]
struct Cli {
    /// Path to engine config file
    #[arg(short, long, default_value = "dagstep.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one step from a TOML step file
    Run {
        step_file: PathBuf,
        /// Upstream exit code seen by router steps as `@exitCode`
        #[arg(long, default_value_t = 0)]
        exit_code: i32,
        /// Upstream output variable for router templates (KEY=VALUE)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Validate a step file without running it
    Validate { step_file: PathBuf },
    /// List registered executor types and their capabilities
    Types,
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

fn load_step(path: &Path) -> anyhow::Result<Step> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading step file {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing step file {}", path.display()))
}

fn describe(caps: ExecutorCapabilities) -> String {
    let flags = [
        (caps.command, "command"),
        (caps.multiple_commands, "multiple_commands"),
        (caps.script, "script"),
        (caps.shell, "shell"),
    ];
    let names: Vec<&str> = flags.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
    if names.is_empty() {
        "-".to_string()
    } else {
        names.join(",")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = EngineConfig::load_or_default(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    // No SSH transport or remote object-store client is linked into the
    // binary; `ssh` is unavailable and `s3` serves `file://` endpoints only.
    let registry = ExecutorRegistry::with_builtins(Collaborators::default());

    match cli.command {
        Commands::Types => {
            for ty in registry.types() {
                let caps = registry.capabilities(ty).unwrap_or_default();
                println!("{ty:<10} {}", describe(caps));
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { step_file } => {
            let step = load_step(&step_file)?;
            registry.validate(&step)?;
            println!("step {} ({}) is valid", step.name, step.executor_type());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            step_file,
            exit_code,
            vars,
        } => {
            let step = load_step(&step_file)?;
            let mut input = RouterInput::new(exit_code);
            for (k, v) in config.variables.iter().map(|(k, v)| (k.clone(), v.clone())).chain(vars) {
                input = input.with_variable(k, v);
            }
            let ctx = BuildContext::new(config.defaults.clone()).with_router_input(input);
            run_step(&registry, &ctx, &step).await
        }
    }
}

async fn run_step(registry: &ExecutorRegistry, ctx: &BuildContext, step: &Step) -> anyhow::Result<ExitCode> {
    let mut executor = registry.build(ctx, step)?;
    executor.set_output_sinks(Box::new(tokio::io::stdout()), Box::new(tokio::io::stderr()));
    let executor: Arc<dyn Executor> = Arc::from(executor);

    info!(step = %step.name, executor = %step.executor_type(), "Running step");
    let runner = executor.clone();
    let mut run = tokio::spawn(async move { runner.run(CancellationToken::new()).await });

    let result = tokio::select! {
        res = &mut run => res?,
        _ = tokio::signal::ctrl_c() => {
            warn!(step = %step.name, "Interrupted, stopping step");
            executor.kill()?;
            (&mut run).await?
        }
    };

    let ext = executor.extensions();
    if let Some(decision) = ext.router.and_then(|r| r.router_result()) {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    }
    if let Some(status) = ext.status {
        info!(step = %step.name, status = ?status.determine_status()?, "Step status");
    }
    let code = ext.exit_code.map(|e| e.exit_code());

    match result {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(step = %step.name, kind = %e.kind(), exit_code = ?code, "{e}");
            let code = code.and_then(|c| u8::try_from(c).ok()).filter(|c| *c != 0).unwrap_or(1);
            Ok(ExitCode::from(code))
        }
    }
}
