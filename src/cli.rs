use crate::engine::api::ApiClient;
use crate::engine::channel::{ChannelError, EventChannelClient, ReconnectPolicy};
use crate::engine::log_buffer::LogAccumulator;
use crate::engine::poller::StatusPoller;
use crate::engine::session::{RunSession, SessionPhase};
use crate::model::{AgentEvent, EngineConfig, RunId};
use crate::orchestrator;
use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "pipeline-watch",
    version,
    about = "Follow training pipeline runs live: status polling plus a reconnecting log stream"
)]
pub struct Cli {
    /// Base URL of the pipeline backend
    #[arg(
        long,
        env = "PIPELINE_API_URL",
        default_value = "http://localhost:8000",
        global = true
    )]
    pub api_url: String,

    /// Interval between status polls
    #[arg(long, env = "PIPELINE_POLL_INTERVAL", default_value = "2s", global = true)]
    pub poll_interval: humantime::Duration,

    /// Timeout for each HTTP request
    #[arg(long, default_value = "10s", global = true)]
    pub request_timeout: humantime::Duration,

    /// Reconnect attempts for the log stream before giving up
    #[arg(long, default_value_t = 5, global = true)]
    pub reconnect_attempts: u32,

    /// Base delay between log stream reconnects (grows linearly per attempt)
    #[arg(long, default_value = "1s", global = true)]
    pub reconnect_delay: humantime::Duration,

    /// Maximum number of log events kept in memory
    #[arg(long, default_value_t = 5000, global = true)]
    pub log_capacity: usize,

    /// Increase diagnostic logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Start a pipeline run and follow it until it finishes
    Run(RunArgs),
    /// Fetch the current status of a run once
    Status {
        /// Run identifier returned when the run was started
        run_id: String,
    },
    /// Stream backend log events until interrupted
    Logs,
    /// List, test and download trained models
    #[command(subcommand)]
    Models(ModelsCommand),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Dataset path, as seen by the backend
    pub dataset_path: String,

    /// Print the final status as JSON instead of a text summary
    #[arg(long)]
    pub json: bool,

    /// Write final status and collected logs to this file
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Do not print log events while following the run
    #[arg(long)]
    pub quiet_logs: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ModelsCommand {
    /// List trained models
    List,
    /// Classify an image with a trained model
    Test {
        /// Model name, as shown by `models list`
        #[arg(long)]
        model: String,
        /// Image file to upload
        image: PathBuf,
        /// Write the returned heatmap (PNG) to this file
        #[arg(long)]
        heatmap: Option<PathBuf>,
    },
    /// Download a trained model artifact
    Download {
        name: String,
        /// Destination file (default: <downloads>/<name>_model.pt)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Build an `EngineConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<EngineConfig> {
    let api_url = url::Url::parse(&args.api_url)
        .with_context(|| format!("invalid --api-url '{}'", args.api_url))?;
    if !matches!(api_url.scheme(), "http" | "https") {
        bail!("--api-url must use http or https, got '{}'", api_url.scheme());
    }
    let poll_interval = Duration::from(args.poll_interval);
    if poll_interval.is_zero() {
        bail!("--poll-interval must be greater than zero");
    }
    let request_timeout = Duration::from(args.request_timeout);
    if request_timeout.is_zero() {
        bail!("--request-timeout must be greater than zero");
    }
    if args.log_capacity == 0 {
        bail!("--log-capacity must be at least 1");
    }

    Ok(EngineConfig {
        poll_interval,
        request_timeout,
        reconnect_attempts: args.reconnect_attempts,
        reconnect_delay: Duration::from(args.reconnect_delay),
        log_capacity: args.log_capacity,
        ..EngineConfig::new(api_url)
    })
}

/// Dispatch a parsed command line. Returns `false` when the command should
/// exit with a failure status without an error of its own (e.g. a failed run).
pub async fn run(args: Cli) -> Result<bool> {
    let cfg = build_config(&args)?;
    let api = ApiClient::new(cfg.api_url.clone(), cfg.request_timeout)
        .context("failed to build HTTP client")?;

    match args.command {
        Command::Run(run_args) => run_pipeline(&cfg, api, &run_args).await,
        Command::Status { run_id } => {
            let status = api
                .fetch_status(&RunId::new(run_id.clone()))
                .await
                .with_context(|| format!("failed to fetch status of run {run_id}"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(true)
        }
        Command::Logs => run_logs(&cfg).await,
        Command::Models(cmd) => run_models(&api, cmd).await,
    }
}

/// Log stream wiring: channel client feeding the accumulator, which forwards
/// each event for display.
struct LogStream {
    client: EventChannelClient,
    logs: LogAccumulator,
    events: mpsc::UnboundedReceiver<AgentEvent>,
    errors: mpsc::UnboundedReceiver<ChannelError>,
}

fn connect_log_stream(cfg: &EngineConfig) -> Result<LogStream> {
    let url = cfg.logs_url().context("failed to derive log stream URL")?;
    let (tx, rx) = mpsc::channel(cfg.event_queue_capacity);
    let (fwd_tx, fwd_rx) = mpsc::unbounded_channel();
    let logs = LogAccumulator::new(cfg.log_capacity);
    logs.spawn(rx, Some(fwd_tx));

    let policy = ReconnectPolicy {
        max_attempts: cfg.reconnect_attempts,
        base_delay: cfg.reconnect_delay,
    };
    let (err_tx, err_rx) = mpsc::unbounded_channel();
    let mut client = EventChannelClient::new(&url, policy, tx).with_error_observer(err_tx);
    client.connect();
    Ok(LogStream {
        client,
        logs,
        events: fwd_rx,
        errors: err_rx,
    })
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available: never interrupt.
        std::future::pending::<()>().await;
    }
}

async fn run_pipeline(cfg: &EngineConfig, api: ApiClient, args: &RunArgs) -> Result<bool> {
    let (out_tx, out_handle) = spawn_output_writer();
    let mut stream = connect_log_stream(cfg)?;

    let backend = Arc::new(api);
    let poller = StatusPoller::new(backend.clone(), cfg.poll_interval, cfg.request_timeout);
    let session = RunSession::new(backend, poller);

    let followed = orchestrator::follow_run(
        &session,
        &args.dataset_path,
        &mut stream.events,
        &out_tx,
        !args.quiet_logs,
        ctrl_c(),
    )
    .await;
    stream.client.disconnect();
    let outcome = followed?;

    let processed = orchestrator::process_run_completion(args, &outcome.view, &stream.logs);
    if args.json {
        match outcome.view.latest_status.as_deref() {
            Some(status) => {
                let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(status)?));
            }
            None => {
                let _ = out_tx.send(OutputLine::Stdout("null".into()));
            }
        }
    } else {
        for line in processed.summary {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    for msg in processed.export_messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(!outcome.interrupted && outcome.view.phase() == SessionPhase::Completed)
}

async fn run_logs(cfg: &EngineConfig) -> Result<bool> {
    let (out_tx, out_handle) = spawn_output_writer();
    let mut stream = connect_log_stream(cfg)?;
    let mut state = stream.client.subscribe_state();

    let ok = orchestrator::stream_logs(
        &mut stream.events,
        &mut state,
        &mut stream.errors,
        &out_tx,
        ctrl_c(),
    )
    .await;
    stream.client.disconnect();

    drop(out_tx);
    let _ = out_handle.await;
    Ok(ok)
}

async fn run_models(api: &ApiClient, cmd: ModelsCommand) -> Result<bool> {
    match cmd {
        ModelsCommand::List => {
            let list = api.list_models().await.context("failed to list models")?;
            if list.models.is_empty() {
                eprintln!("No trained models yet");
            }
            for m in list.models {
                println!("{:<24} {:>12}  {}", m.name, m.size, m.path);
            }
        }
        ModelsCommand::Test {
            model,
            image,
            heatmap,
        } => {
            let result = api
                .test_model(&model, &image)
                .await
                .with_context(|| format!("failed to test model {model} on {}", image.display()))?;
            println!("Predicted class: {}", result.predicted_class);
            println!("Confidence: {:.1}%", result.confidence * 100.0);
            if let Some(explanation) = result.explanation.as_deref() {
                println!("Explanation: {explanation}");
            }
            if let Some(path) = heatmap {
                let Some(encoded) = result.heatmap_base64.as_deref() else {
                    bail!("backend returned no heatmap");
                };
                let png = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .context("heatmap is not valid base64")?;
                std::fs::write(&path, png)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!("Saved heatmap: {}", path.display());
            }
        }
        ModelsCommand::Download { name, output } => {
            let dest = output.unwrap_or_else(|| default_download_path(&name));
            let bytes = api
                .download_model(&name, &dest)
                .await
                .with_context(|| format!("failed to download model {name}"))?;
            eprintln!("Saved {} ({} bytes)", dest.display(), bytes);
        }
    }
    Ok(true)
}

fn default_download_path(name: &str) -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(format!("{name}_model.pt"))
}
