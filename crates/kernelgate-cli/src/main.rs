//! kernelgate binary
//!
//! Run code on gateway-managed kernels and move files through the shared
//! file-exchange service.
//!
//! ## Usage
//!
//! ```bash
//! kernelgate exec '2+2'
//! echo 'print("hi")' | kernelgate exec - --kernel python3
//! kernelgate kernels
//! kernelgate specs
//! kernelgate files list
//! kernelgate files put ./data.csv
//! kernelgate files get data.csv --out /tmp/data.csv
//! kernelgate files rm data.csv
//! ```
//!
//! Configuration comes from `--config`, else `~/.config/kernelgate/config.toml`,
//! then `KERNELGATE_GATEWAY_URL` and friends. `RUST_LOG` controls logging.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kernelgate_client::{
    AuthenticatedSession, ClientConfig, ExecutionMetrics, FileExchange, GatewayClient, GatewayError, KernelLifecycle,
    KernelSession, MetricsSession,
};
use kernelgate_types::{ExecutionResult, KernelSpec};

#[derive(Parser, Debug)]
#[command(name = "kernelgate")]
#[command(about = "Run code on kernels managed by a Jupyter gateway")]
struct Args {
    /// Config file (default: ~/.config/kernelgate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute code on a fresh kernel and print what it produced
    Exec {
        /// Code to run, or `-` to read it from stdin
        code: String,

        /// Kernelspec to launch
        #[arg(short, long, default_value = "python3")]
        kernel: String,

        /// Execute timeout in seconds (default: from config)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Extra launch environment, `KEY=VALUE`
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Pass the file-exchange URL and write token to the kernel
        #[arg(long)]
        with_files: bool,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,

        /// Print execution metrics (Prometheus text format) to stderr
        #[arg(long)]
        metrics: bool,
    },

    /// List kernels running on the gateway
    Kernels,

    /// List kernelspecs the gateway can launch
    Specs,

    /// File-exchange operations
    #[command(subcommand)]
    Files(FilesCommand),
}

#[derive(Subcommand, Debug)]
enum FilesCommand {
    /// List stored files
    List,
    /// Download a file
    Get {
        name: String,
        /// Destination (default: ./<name>)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Upload a local file
    Put {
        path: PathBuf,
        /// Name to store it under (default: the file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Delete a stored file
    Rm { name: String },
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let _otel_guard = init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "telemetry")]
fn init_tracing() -> Option<kernelgate_telemetry::OtelGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr));

    if !kernelgate_telemetry::otel_enabled() {
        registry.init();
        return None;
    }
    match kernelgate_telemetry::otel_layer("kernelgate") {
        Ok((otel_layer, guard)) => {
            registry.with(otel_layer).init();
            Some(guard)
        }
        Err(e) => {
            registry.init();
            tracing::warn!(error = %e, "OTel export disabled");
            None
        }
    }
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing() -> Option<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    None
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = ClientConfig::load(args.config.as_deref()).context("loading config")?;

    match args.command {
        Command::Exec {
            code,
            kernel,
            timeout,
            env,
            with_files,
            json,
            metrics,
        } => {
            let code = if code == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf).context("reading code from stdin")?;
                buf
            } else {
                code
            };
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.session_options().execute_timeout);
            let spec = KernelSpec::new(kernel).with_env(env);
            cmd_exec(&config, spec, &code, timeout, with_files, json, metrics).await
        }
        Command::Kernels => cmd_kernels(&config).await,
        Command::Specs => cmd_specs(&config).await,
        Command::Files(cmd) => cmd_files(&config, cmd).await,
    }
}

async fn cmd_exec(
    config: &ClientConfig,
    spec: KernelSpec,
    code: &str,
    timeout: Duration,
    with_files: bool,
    json: bool,
    show_metrics: bool,
) -> Result<ExitCode> {
    let lifecycle: Arc<dyn KernelLifecycle> = Arc::new(GatewayClient::new(config.gateway())?);
    let registry = prometheus::Registry::new();
    let metrics = Arc::new(ExecutionMetrics::new(&registry)?);
    let options = config.session_options();

    let result = if with_files {
        let files = FileExchange::new(config.file_exchange())?;
        let inner = AuthenticatedSession::open(lifecycle, spec, options, files).await?;
        let mut session = MetricsSession::new(inner, Arc::clone(&metrics));
        run_once(&mut session, code, timeout).await
    } else {
        let mut session = MetricsSession::open(lifecycle, spec, options, Arc::clone(&metrics)).await?;
        run_once(&mut session, code, timeout).await
    };

    if show_metrics {
        eprint!("{}", metrics.render()?);
    }

    let result = result?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(if result.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Execute once and always close, whatever the outcome.
async fn run_once<S: KernelSession>(
    session: &mut S,
    code: &str,
    timeout: Duration,
) -> Result<ExecutionResult, GatewayError> {
    tracing::info!(kernel_id = %session.kernel().id, "executing");
    let result = session.execute(code, timeout).await;
    session.close().await;
    result
}

fn print_result(result: &ExecutionResult) {
    for chunk in &result.stream {
        match chunk.name {
            kernelgate_types::StreamName::Stdout => print!("{}", chunk.text),
            kernelgate_types::StreamName::Stderr => eprint!("{}", chunk.text),
        }
    }
    if let Some(value) = &result.return_value {
        match value {
            serde_json::Value::String(s) => println!("{s}"),
            other => println!("{other}"),
        }
    }
    if let Some(error) = &result.error {
        for line in &error.traceback {
            eprintln!("{line}");
        }
        eprintln!("{}: {}", error.name, error.message);
    }
}

async fn cmd_kernels(config: &ClientConfig) -> Result<ExitCode> {
    let gateway = GatewayClient::new(config.gateway())?;
    let kernels = gateway.list_kernels().await.context("listing kernels")?;
    if kernels.is_empty() {
        println!("no kernels running");
    }
    for k in kernels {
        println!(
            "{:<38} {:<12} {:<6} {:>3} conn  {}",
            k.id,
            k.name,
            k.execution_state.as_deref().unwrap_or("-"),
            k.connections,
            k.last_activity.as_deref().unwrap_or("-"),
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_specs(config: &ClientConfig) -> Result<ExitCode> {
    let gateway = GatewayClient::new(config.gateway())?;
    for spec in gateway.list_kernelspecs().await.context("listing kernelspecs")? {
        println!("{:<16} {:<10} {}", spec.name, spec.language, spec.display_name);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_files(config: &ClientConfig, cmd: FilesCommand) -> Result<ExitCode> {
    let files = FileExchange::new(config.file_exchange())?;
    match cmd {
        FilesCommand::List => {
            for name in files.list().await? {
                println!("{name}");
            }
        }
        FilesCommand::Get { name, out } => {
            let dest = files.download_file(&name, out.as_deref()).await?;
            eprintln!("saved {}", dest.display());
        }
        FilesCommand::Put { path, name } => {
            if config.file_exchange.token.is_none() {
                bail!("uploading needs a write token (WRITE_TOKEN or [file_exchange] token)");
            }
            let stored = files.upload_file(&path, name.as_deref()).await?;
            eprintln!("stored as {stored}");
        }
        FilesCommand::Rm { name } => {
            files.delete(&name).await?;
            eprintln!("deleted {name}");
        }
    }
    Ok(ExitCode::SUCCESS)
}
