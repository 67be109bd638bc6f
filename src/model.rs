use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pipeline stages, announced in order as a run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Workspace,
    Import,
    Launch,
    Automation,
    Monitor,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Workspace => "Cleaning workspace",
            Phase::Import => "Importing images",
            Phase::Launch => "Launching analysis engine",
            Phase::Automation => "Waiting for engine window",
            Phase::Monitor => "Watching for results",
        }
    }
}

/// A staged input image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub file_name: String,
    pub source: PathBuf,
    pub staged: PathBuf,
}

/// One persisted line of the cumulative report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    pub file: String,
    pub count: usize,
    pub avg_sqrt_area: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Every expected artifact was processed.
    Completed,
    /// The engine exited before producing the expected artifacts.
    AbortedEarly,
    /// The source folder held no eligible images.
    NoImages,
    Cancelled,
    Failed { reason: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed | RunOutcome::NoImages)
    }
}

/// Final account of a run, handed back to the host alongside the `RunEnded` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub source: PathBuf,
    pub threshold: f64,
    pub expected: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Mean of the per-artifact means, `None` when nothing succeeded.
    pub mean_of_means: Option<f64>,
    pub report_path: PathBuf,
}

impl RunSummary {
    pub(crate) fn empty(source: PathBuf, threshold: f64, report_path: PathBuf) -> Self {
        Self {
            outcome: RunOutcome::Completed,
            source,
            threshold,
            expected: 0,
            processed: 0,
            succeeded: 0,
            failed: 0,
            mean_of_means: None,
            report_path,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PhaseStarted {
        phase: Phase,
    },
    ImagesImported {
        count: usize,
        source: PathBuf,
    },
    ArtifactProcessed {
        row: ReportRow,
        attempts: u32,
        processed: usize,
        expected: usize,
    },
    ArtifactFailed {
        file: String,
        error: String,
        attempts: u32,
        processed: usize,
        expected: usize,
    },
    Info(InfoEvent),
    RunEnded {
        summary: Box<RunSummary>,
    },
}

/// Structured info events emitted by the pipeline and rendered by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Error(String),
    ExecutableMissing { path: PathBuf },
    NoImagesFound { source: PathBuf },
    EngineLaunched { pid: Option<u32> },
    AutomationFinished,
    AutomationFailed { error: String },
    WriteBackSkipped { file: String, reason: String },
    EngineExitedEarly { processed: usize, expected: usize },
    PipelineComplete { report: PathBuf },
    Cancelled,
}

impl InfoEvent {
    /// Render a human-readable message for the host's log view.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Error(msg) => format!("Error: {msg}"),
            InfoEvent::ExecutableMissing { path } => format!(
                "Error: executable not found at {}. Please verify the engine folder structure.",
                path.display()
            ),
            InfoEvent::NoImagesFound { source } => {
                format!("No images found in {}", source.display())
            }
            InfoEvent::EngineLaunched { pid: Some(pid) } => {
                format!("Analysis engine started (pid {pid})")
            }
            InfoEvent::EngineLaunched { pid: None } => "Analysis engine started".to_string(),
            InfoEvent::AutomationFinished => {
                "Automation sequence finished. Watching for data...".to_string()
            }
            InfoEvent::AutomationFailed { error } => format!(
                "GUI automation failed: {error}. Please start processing manually in the engine window."
            ),
            InfoEvent::WriteBackSkipped { file, reason } => {
                format!("Warning: could not save corrected columns back to {file}: {reason}")
            }
            InfoEvent::EngineExitedEarly {
                processed,
                expected,
            } => format!(
                "Analysis engine exited early ({processed}/{expected} results processed)"
            ),
            InfoEvent::PipelineComplete { report } => {
                format!("Pipeline complete. Report: {}", report.display())
            }
            InfoEvent::Cancelled => "Run cancelled".to_string(),
        }
    }
}

impl PipelineEvent {
    pub fn to_message(&self) -> String {
        match self {
            PipelineEvent::PhaseStarted { phase } => format!("{}...", phase.label()),
            PipelineEvent::ImagesImported { count, source } => {
                format!("Imported {count} images from {}", source.display())
            }
            PipelineEvent::ArtifactProcessed {
                row,
                processed,
                expected,
                ..
            } => format!(
                "[{processed}/{expected}] Processed {} -> count {}, avg {:.2}",
                row.file, row.count, row.avg_sqrt_area
            ),
            PipelineEvent::ArtifactFailed {
                file,
                error,
                attempts,
                processed,
                expected,
            } => format!(
                "[{processed}/{expected}] Failed to parse {file} after {attempts} attempt(s): {error}"
            ),
            PipelineEvent::Info(info) => info.to_message(),
            PipelineEvent::RunEnded { summary } => match &summary.outcome {
                RunOutcome::Failed { reason } => format!("Run ended: failed ({reason})"),
                other => format!("Run ended: {other:?}"),
            },
        }
    }
}
