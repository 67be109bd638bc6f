//! Result monitor: the polling loop that turns engine output into report rows.

use super::mailbox::OutputMailbox;
use super::retry::RetryPolicy;
use crate::engine::EngineProcess;
use crate::metrics::{ComputedMetrics, MetricsError};
use crate::model::{InfoEvent, PipelineEvent, ReportRow};
use crate::report::ReportWriter;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Waiting,
    ResultFound,
    Done,
    AbortedEarly,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorStats {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub sum_of_means: f64,
}

impl MonitorStats {
    pub fn mean_of_means(&self) -> Option<f64> {
        (self.succeeded > 0).then(|| self.sum_of_means / self.succeeded as f64)
    }
}

/// Per-artifact statistics function, run on the blocking pool.
pub type Calculator = fn(&Path, f64) -> ComputedMetrics;

pub struct ResultMonitor<'a> {
    pub mailbox: OutputMailbox,
    pub report: &'a ReportWriter,
    pub retry: &'a RetryPolicy,
    pub poll_interval: Duration,
    pub threshold: f64,
    pub calculator: Calculator,
    pub expected: usize,
    pub events: &'a mpsc::Sender<PipelineEvent>,
    pub cancel: CancellationToken,
}

impl ResultMonitor<'_> {
    /// Poll until every expected artifact is processed, the engine dies, or
    /// the run is cancelled. Returns the terminal state.
    pub async fn run(mut self, engine: &mut dyn EngineProcess) -> (MonitorState, MonitorStats) {
        let mut stats = MonitorStats::default();
        let mut state = MonitorState::Waiting;

        loop {
            // Sample liveness before listing, so anything written just before
            // the engine exited is still picked up by this pass.
            let alive = engine.is_alive();

            let fresh = match self.mailbox.poll_new() {
                Ok(names) => names,
                Err(e) => {
                    tracing::warn!(dir = %self.mailbox.dir().display(), error = %e, "Output listing failed");
                    Vec::new()
                }
            };

            for name in fresh {
                if self.cancel.is_cancelled() {
                    break;
                }
                state = MonitorState::ResultFound;
                self.process_artifact(&name, &mut stats).await;
            }

            if self.cancel.is_cancelled() {
                state = MonitorState::Cancelled;
                break;
            }
            if stats.processed >= self.expected {
                state = MonitorState::Done;
                self.emit(PipelineEvent::Info(InfoEvent::PipelineComplete {
                    report: self.report.path().to_path_buf(),
                }))
                .await;
                break;
            }
            if !alive {
                state = MonitorState::AbortedEarly;
                tracing::warn!(
                    processed = stats.processed,
                    expected = self.expected,
                    "Engine exited before all results appeared"
                );
                self.emit(PipelineEvent::Info(InfoEvent::EngineExitedEarly {
                    processed: stats.processed,
                    expected: self.expected,
                }))
                .await;
                break;
            }

            if state != MonitorState::Waiting {
                tracing::trace!(?state, "Back to waiting");
                state = MonitorState::Waiting;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    state = MonitorState::Cancelled;
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        if state == MonitorState::Cancelled {
            self.emit(PipelineEvent::Info(InfoEvent::Cancelled)).await;
        }
        (state, stats)
    }

    async fn process_artifact(&mut self, name: &str, stats: &mut MonitorStats) {
        let path = self.mailbox.path_of(name);
        let threshold = self.threshold;
        let calculator = self.calculator;
        let outcome = self
            .retry
            .run(&self.cancel, || {
                let path = path.clone();
                async move {
                    tokio::task::spawn_blocking(move || calculator(&path, threshold))
                        .await
                        .unwrap_or_else(|e| Err(MetricsError::Worker(e.to_string())))
                }
            })
            .await;

        // Marked once, whatever the outcome, so a bad artifact cannot stall the run.
        self.mailbox.mark_processed(name);
        stats.processed = self.mailbox.processed_count();

        let failure = match outcome.result {
            Ok(m) => {
                if let Some(reason) = m.write_back_warning.clone() {
                    self.emit(PipelineEvent::Info(InfoEvent::WriteBackSkipped {
                        file: m.file_name.clone(),
                        reason,
                    }))
                    .await;
                }
                let row = ReportRow {
                    file: m.file_name,
                    count: m.count,
                    avg_sqrt_area: m.avg_sqrt_area,
                };
                match self.report.append(&row) {
                    Ok(()) => {
                        stats.succeeded += 1;
                        stats.sum_of_means += row.avg_sqrt_area;
                        tracing::info!(file = %row.file, count = row.count, avg = row.avg_sqrt_area, attempts = outcome.attempts, "Artifact processed");
                        self.emit(PipelineEvent::ArtifactProcessed {
                            row,
                            attempts: outcome.attempts,
                            processed: stats.processed,
                            expected: self.expected,
                        })
                        .await;
                        None
                    }
                    Err(e) => Some(format!(
                        "could not append to {}: {e}",
                        self.report.path().display()
                    )),
                }
            }
            Err(e) => Some(e.to_string()),
        };

        if let Some(error) = failure {
            stats.failed += 1;
            tracing::warn!(file = %name, attempts = outcome.attempts, %error, "Artifact failed");
            self.emit(PipelineEvent::ArtifactFailed {
                file: name.to_string(),
                error,
                attempts: outcome.attempts,
                processed: stats.processed,
                expected: self.expected,
            })
            .await;
        }
    }

    async fn emit(&self, event: PipelineEvent) {
        // A host that stopped listening must not stop the run.
        let _ = self.events.send(event).await;
    }
}
