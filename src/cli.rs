use crate::config::PipelineConfig;
use crate::engine::automation::driver_for;
use crate::engine::SystemLauncher;
use crate::model::{PipelineEvent, RunSummary};
use crate::orchestrator::controller::is_valid_source;
use crate::orchestrator::{spawn_run, Pipeline, RunRequest, EVENT_CHANNEL_CAPACITY};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
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

fn parse_threshold(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !v.is_finite() || v < 0.0 {
        return Err(format!("threshold must be a non-negative number, got {s}"));
    }
    Ok(v)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "bioquant",
    version,
    about = "Stage images for the organoid analysis engine and collect its results into a report"
)]
pub struct Cli {
    /// Folder holding the images to analyse
    pub source: PathBuf,

    /// Minimum square-root area a detection needs to be counted
    #[arg(short, long, default_value = "0", value_parser = parse_threshold)]
    pub threshold: f64,

    /// Installation root holding the engine folder and the report
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Engine folder name under the root
    #[arg(long)]
    pub engine_dir: Option<String>,

    /// Engine executable file name
    #[arg(long = "exe")]
    pub executable: Option<String>,

    /// Report file stem (".csv" is appended)
    #[arg(long)]
    pub report_name: Option<String>,

    /// Detection confidence passed to the automation helper
    #[arg(long)]
    pub confidence: Option<f64>,

    /// Regex matched against the engine's window title
    #[arg(long)]
    pub window_title: Option<String>,

    /// Helper program that starts processing in the engine window
    #[arg(long, env = "BIOQUANT_AUTOMATION_CMD")]
    pub automation_cmd: Option<PathBuf>,

    /// Pause between output folder scans
    #[arg(long)]
    pub poll_interval: Option<humantime::Duration>,

    /// Attempts per result file before giving up on it
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Pause between attempts on the same result file
    #[arg(long)]
    pub retry_pause: Option<humantime::Duration>,

    /// How long the automation helper may take to find the window
    #[arg(long)]
    pub window_timeout: Option<humantime::Duration>,

    /// Configuration file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Build a `PipelineConfig` from the config file and CLI overrides.
pub fn build_config(args: &Cli) -> Result<PipelineConfig> {
    let mut cfg =
        PipelineConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(root) = &args.root {
        cfg.root = root.clone();
    }
    if let Some(dir) = &args.engine_dir {
        cfg.engine_dir = dir.clone();
    }
    if let Some(exe) = &args.executable {
        cfg.executable = exe.clone();
    }
    if let Some(name) = &args.report_name {
        cfg.report_name = name.clone();
    }
    if let Some(c) = args.confidence {
        cfg.automation.confidence = c;
    }
    if let Some(title) = &args.window_title {
        cfg.automation.window_title = title.clone();
    }
    if let Some(cmd) = &args.automation_cmd {
        cfg.automation.command = Some(cmd.clone());
    }
    if let Some(d) = args.poll_interval {
        cfg.poll_interval = Duration::from(d);
    }
    if let Some(n) = args.retry_attempts {
        cfg.retry.max_attempts = n;
    }
    if let Some(d) = args.retry_pause {
        cfg.retry.pause = Duration::from(d);
    }
    if let Some(d) = args.window_timeout {
        cfg.automation.window_timeout = Duration::from(d);
    }

    cfg.validate().context("invalid configuration")?;
    Ok(cfg)
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

fn render(ev: &PipelineEvent) -> String {
    format!("[{}] {}", timestamp(), ev.to_message())
}

pub async fn run(args: Cli) -> Result<RunSummary> {
    if !is_valid_source(&args.source) {
        anyhow::bail!(
            "source folder {} does not exist or is not a directory",
            args.source.display()
        );
    }
    let cfg = build_config(&args)?;
    let driver = driver_for(&cfg.automation);
    let pipeline = Arc::new(Pipeline::new(cfg, Arc::new(SystemLauncher), driver));
    tracing::debug!(cfg = ?pipeline.config(), "Effective configuration");
    let request = RunRequest {
        source: args.source.clone(),
        threshold: args.threshold,
    };

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::channel::<PipelineEvent>(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let handle = spawn_run(pipeline, request, evt_tx, cancel.clone());

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    while let Some(ev) = evt_rx.recv().await {
        let _ = out_tx.send(OutputLine::Stderr(render(&ev)));
    }

    let summary = handle.await.context("pipeline task failed")?;
    interrupt.abort();

    if args.json {
        let out = serde_json::to_string_pretty(&summary)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        for line in crate::text_summary::build_text_summary(&summary).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(summary)
}
