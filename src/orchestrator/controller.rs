//! Run lifecycle controller.
//!
//! Owns one pipeline run from workspace reset to the terminal event and emits
//! events for presentation layers.

use super::mailbox::OutputMailbox;
use super::monitor::{MonitorState, ResultMonitor};
use super::workspace;
use crate::config::PipelineConfig;
use crate::engine::automation::{AutomationDriver, EngineWindow};
use crate::engine::{EngineProcess, Launcher};
use crate::metrics;
use crate::model::{InfoEvent, Phase, PipelineEvent, RunOutcome, RunSummary};
use crate::report::ReportWriter;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the event channel between a run and its host.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Failures that end a run before monitoring starts.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("executable not found at {}", .0.display())]
    ExecutableMissing(PathBuf),
    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("failed to import images from {}: {}", .0.display(), .1)]
    Import(PathBuf, #[source] io::Error),
    #[error("failed to launch {}: {}", .0.display(), .1)]
    Launch(PathBuf, #[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: PathBuf,
    pub threshold: f64,
}

pub struct Pipeline {
    cfg: PipelineConfig,
    launcher: Arc<dyn Launcher>,
    driver: Arc<dyn AutomationDriver>,
}

impl Pipeline {
    pub fn new(
        cfg: PipelineConfig,
        launcher: Arc<dyn Launcher>,
        driver: Arc<dyn AutomationDriver>,
    ) -> Self {
        Self {
            cfg,
            launcher,
            driver,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.cfg
    }

    /// Execute one run. Always ends with exactly one `RunEnded` event; the
    /// returned summary is the same one carried by that event.
    pub async fn run(
        &self,
        request: RunRequest,
        events: mpsc::Sender<PipelineEvent>,
        cancel: CancellationToken,
    ) -> RunSummary {
        let mut summary = RunSummary::empty(
            request.source.clone(),
            request.threshold,
            self.cfg.report_path(),
        );

        let outcome = match self.execute(&request, &events, &cancel, &mut summary).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Run failed during setup");
                let info = match &e {
                    SetupError::ExecutableMissing(path) => {
                        InfoEvent::ExecutableMissing { path: path.clone() }
                    }
                    other => InfoEvent::Error(other.to_string()),
                };
                let _ = events.send(PipelineEvent::Info(info)).await;
                RunOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        summary.outcome = outcome;

        tracing::info!(outcome = ?summary.outcome, processed = summary.processed, expected = summary.expected, "Run ended");
        let _ = events
            .send(PipelineEvent::RunEnded {
                summary: Box::new(summary.clone()),
            })
            .await;
        summary
    }

    async fn execute(
        &self,
        request: &RunRequest,
        events: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<RunOutcome, SetupError> {
        let executable = self.cfg.executable_path();
        if !executable.is_file() {
            return Err(SetupError::ExecutableMissing(executable));
        }

        let image_dir = self.cfg.image_dir();
        let output_dir = self.cfg.output_dir();

        emit(events, PipelineEvent::PhaseStarted {
            phase: Phase::Workspace,
        })
        .await;
        workspace::prepare(&image_dir, &output_dir).map_err(SetupError::Workspace)?;

        emit(events, PipelineEvent::PhaseStarted {
            phase: Phase::Import,
        })
        .await;
        let assets = {
            let source = request.source.clone();
            let target = image_dir.clone();
            tokio::task::spawn_blocking(move || workspace::import_images(&source, &target))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e)))
                .map_err(|e| SetupError::Import(request.source.clone(), e))?
        };
        if assets.is_empty() {
            emit(events, PipelineEvent::Info(InfoEvent::NoImagesFound {
                source: request.source.clone(),
            }))
            .await;
            return Ok(RunOutcome::NoImages);
        }
        summary.expected = assets.len();
        emit(events, PipelineEvent::ImagesImported {
            count: assets.len(),
            source: request.source.clone(),
        })
        .await;

        emit(events, PipelineEvent::PhaseStarted {
            phase: Phase::Launch,
        })
        .await;
        let engine_dir = self.cfg.engine_path();
        let mut engine = self
            .launcher
            .launch(&executable, &engine_dir)
            .map_err(|e| SetupError::Launch(executable.clone(), e))?;
        emit(events, PipelineEvent::Info(InfoEvent::EngineLaunched { pid: engine.id() })).await;

        emit(events, PipelineEvent::PhaseStarted {
            phase: Phase::Automation,
        })
        .await;
        if !self.automate(engine.id(), events, cancel).await {
            stop_engine(engine.as_mut());
            emit(events, PipelineEvent::Info(InfoEvent::Cancelled)).await;
            return Ok(RunOutcome::Cancelled);
        }

        emit(events, PipelineEvent::PhaseStarted {
            phase: Phase::Monitor,
        })
        .await;
        let report = ReportWriter::new(self.cfg.report_path());
        let monitor = ResultMonitor {
            mailbox: OutputMailbox::new(&output_dir),
            report: &report,
            retry: &self.cfg.retry,
            poll_interval: self.cfg.poll_interval,
            threshold: request.threshold,
            calculator: metrics::compute,
            expected: assets.len(),
            events,
            cancel: cancel.clone(),
        };
        let (state, stats) = monitor.run(engine.as_mut()).await;

        summary.processed = stats.processed;
        summary.succeeded = stats.succeeded;
        summary.failed = stats.failed;
        summary.mean_of_means = stats.mean_of_means();

        Ok(match state {
            MonitorState::Done => RunOutcome::Completed,
            MonitorState::AbortedEarly => RunOutcome::AbortedEarly,
            MonitorState::Cancelled => {
                stop_engine(engine.as_mut());
                RunOutcome::Cancelled
            }
            MonitorState::Waiting | MonitorState::ResultFound => RunOutcome::Failed {
                reason: format!("monitor stopped in non-terminal state {state:?}"),
            },
        })
    }

    /// Run the automation driver. Failure is only a warning; returns `false`
    /// if the run was cancelled while waiting.
    async fn automate(
        &self,
        pid: Option<u32>,
        events: &mpsc::Sender<PipelineEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let window = EngineWindow {
            pid,
            title_pattern: self.cfg.automation.window_title.clone(),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => return false,
            r = self.driver.drive(&window, &self.cfg.automation) => r,
        };
        let info = match result {
            Ok(()) => InfoEvent::AutomationFinished,
            Err(e) => {
                tracing::warn!(driver = self.driver.name(), error = %e, "Automation failed, operator must start processing");
                InfoEvent::AutomationFailed {
                    error: e.to_string(),
                }
            }
        };
        let _ = events.send(PipelineEvent::Info(info)).await;
        true
    }
}

async fn emit(events: &mpsc::Sender<PipelineEvent>, event: PipelineEvent) {
    let _ = events.send(event).await;
}

fn stop_engine(engine: &mut dyn EngineProcess) {
    if let Err(e) = engine.terminate() {
        tracing::warn!(error = %e, "Failed to stop engine");
    }
}

/// Spawn a run on its own task so the host stays responsive while it polls.
pub fn spawn_run(
    pipeline: Arc<Pipeline>,
    request: RunRequest,
    events: mpsc::Sender<PipelineEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<RunSummary> {
    tokio::spawn(async move { pipeline.run(request, events, cancel).await })
}

/// True if `path` is an existing directory; used by hosts to validate input early.
pub fn is_valid_source(path: &Path) -> bool {
    path.is_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::automation::{AutomationError, AutomationParams};
    use crate::orchestrator::monitor::tests::{ScriptedEngine, GOOD};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeLauncher {
        engine: Mutex<Option<ScriptedEngine>>,
        launches: Mutex<Vec<(PathBuf, PathBuf)>>,
        fail: bool,
    }

    impl FakeLauncher {
        fn new(engine: ScriptedEngine) -> Self {
            Self {
                engine: Mutex::new(Some(engine)),
                launches: Mutex::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(
            &self,
            executable: &Path,
            working_dir: &Path,
        ) -> io::Result<Box<dyn EngineProcess>> {
            self.launches
                .lock()
                .unwrap()
                .push((executable.to_path_buf(), working_dir.to_path_buf()));
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            let engine = self.engine.lock().unwrap().take().expect("launched twice");
            Ok(Box::new(engine))
        }
    }

    struct RecordingDriver {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AutomationDriver for RecordingDriver {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn drive(
            &self,
            window: &EngineWindow,
            _: &AutomationParams,
        ) -> Result<(), AutomationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(window.pid, Some(4242));
            if self.fail {
                Err(AutomationError::Timeout(Duration::from_secs(30)))
            } else {
                Ok(())
            }
        }
    }

    struct Setup {
        tmp: tempfile::TempDir,
        cfg: PipelineConfig,
        source: PathBuf,
    }

    fn setup(images: &[&str], with_exe: bool) -> Setup {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = PipelineConfig {
            root: tmp.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        std::fs::create_dir_all(cfg.engine_path()).unwrap();
        if with_exe {
            std::fs::write(cfg.executable_path(), b"").unwrap();
        }
        let source = tmp.path().join("source");
        std::fs::create_dir_all(&source).unwrap();
        for name in images {
            std::fs::write(source.join(name), b"img").unwrap();
        }
        Setup { tmp, cfg, source }
    }

    fn pipeline(
        cfg: &PipelineConfig,
        launcher: Arc<FakeLauncher>,
        driver: Arc<RecordingDriver>,
    ) -> Pipeline {
        Pipeline::new(cfg.clone(), launcher, driver)
    }

    fn driver(fail: bool) -> Arc<RecordingDriver> {
        Arc::new(RecordingDriver {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    async fn run(p: &Pipeline, source: &Path) -> (RunSummary, Vec<PipelineEvent>) {
        let (tx, mut rx) = mpsc::channel(1024);
        let summary = p
            .run(
                RunRequest {
                    source: source.to_path_buf(),
                    threshold: 2.5,
                },
                tx,
                CancellationToken::new(),
            )
            .await;
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (summary, events)
    }

    fn phases(events: &[PipelineEvent]) -> Vec<Phase> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::PhaseStarted { phase } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_stages_launches_and_reports() {
        let s = setup(&["a.png", "b.jpg", "readme.txt"], true);
        let engine = ScriptedEngine::new(&s.cfg.output_dir(), vec![("a.csv", GOOD), ("b.csv", GOOD)]);
        let launcher = Arc::new(FakeLauncher::new(engine));
        let drv = driver(false);
        let p = pipeline(&s.cfg, launcher.clone(), drv.clone());

        let (summary, events) = run(&p, &s.source).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!((summary.expected, summary.succeeded, summary.failed), (2, 2, 0));
        assert_eq!(summary.mean_of_means, Some(3.0));
        assert!(s.cfg.image_dir().join("a.png").is_file());
        assert!(!s.cfg.image_dir().join("readme.txt").exists());

        let launches = launcher.launches.lock().unwrap().clone();
        assert_eq!(launches, vec![(s.cfg.executable_path(), s.cfg.engine_path())]);
        assert_eq!(drv.calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            phases(&events),
            vec![
                Phase::Workspace,
                Phase::Import,
                Phase::Launch,
                Phase::Automation,
                Phase::Monitor
            ]
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Info(InfoEvent::AutomationFinished))));
        assert!(matches!(events.last(), Some(PipelineEvent::RunEnded { .. })));

        let report = std::fs::read_to_string(s.cfg.report_path()).unwrap();
        assert_eq!(report, "File,Count,Avg_Sqrt_Area\na.csv,1,3\nb.csv,1,3\n");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_executable_fails_before_touching_anything() {
        let s = setup(&["a.png"], false);
        let engine = ScriptedEngine::new(&s.cfg.output_dir(), vec![]);
        let launcher = Arc::new(FakeLauncher::new(engine));
        let p = pipeline(&s.cfg, launcher.clone(), driver(false));

        let (summary, events) = run(&p, &s.source).await;

        assert!(matches!(summary.outcome, RunOutcome::Failed { .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Info(InfoEvent::ExecutableMissing { .. }))));
        assert!(matches!(events.last(), Some(PipelineEvent::RunEnded { .. })));
        assert_eq!(events.len(), 2);
        assert!(!s.cfg.image_dir().exists());
        assert!(!s.cfg.report_path().exists());
        assert!(launcher.launches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_ends_without_launching() {
        let s = setup(&["notes.txt"], true);
        let engine = ScriptedEngine::new(&s.cfg.output_dir(), vec![]);
        let launcher = Arc::new(FakeLauncher::new(engine));
        let p = pipeline(&s.cfg, launcher.clone(), driver(false));

        let (summary, events) = run(&p, &s.source).await;

        assert_eq!(summary.outcome, RunOutcome::NoImages);
        assert!(summary.outcome.is_success());
        assert!(launcher.launches.lock().unwrap().is_empty());
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::Info(InfoEvent::NoImagesFound { .. }))));
        assert!(!s.cfg.report_path().exists());
    }

    #[tokio::test(start_paused = true)]
    async fn automation_failure_is_a_warning_only() {
        let s = setup(&["a.tif"], true);
        let engine = ScriptedEngine::new(&s.cfg.output_dir(), vec![("a.csv", GOOD)]);
        let p = pipeline(&s.cfg, Arc::new(FakeLauncher::new(engine)), driver(true));

        let (summary, events) = run(&p, &s.source).await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        let warning = events.iter().find_map(|e| match e {
            PipelineEvent::Info(info @ InfoEvent::AutomationFailed { .. }) => {
                Some(info.to_message())
            }
            _ => None,
        });
        assert!(warning.unwrap().contains("manually"));
    }

    #[tokio::test(start_paused = true)]
    async fn launch_error_is_fatal() {
        let s = setup(&["a.bmp"], true);
        let engine = ScriptedEngine::new(&s.cfg.output_dir(), vec![]);
        let mut launcher = FakeLauncher::new(engine);
        launcher.fail = true;
        let p = pipeline(&s.cfg, Arc::new(launcher), driver(false));

        let (summary, events) = run(&p, &s.source).await;

        match &summary.outcome {
            RunOutcome::Failed { reason } => assert!(reason.contains("failed to launch")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(summary.expected, 1);
        assert!(matches!(events.last(), Some(PipelineEvent::RunEnded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_run_reports_through_the_channel() {
        let s = setup(&["a.png"], true);
        let engine = ScriptedEngine::new(&s.cfg.output_dir(), vec![("a.csv", GOOD)]);
        let p = Arc::new(pipeline(&s.cfg, Arc::new(FakeLauncher::new(engine)), driver(false)));
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let handle = spawn_run(
            p,
            RunRequest {
                source: s.source.clone(),
                threshold: 0.0,
            },
            tx,
            CancellationToken::new(),
        );

        let mut last = None;
        while let Some(ev) = rx.recv().await {
            last = Some(ev);
        }
        let summary = handle.await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Completed);
        match last {
            Some(PipelineEvent::RunEnded { summary: ended }) => {
                assert_eq!(ended.outcome, RunOutcome::Completed);
                assert_eq!(ended.succeeded, 1);
            }
            other => panic!("unexpected last event {other:?}"),
        }
        drop(s.tmp);
    }

    #[test]
    fn setup_errors_name_the_path_and_the_cause() {
        let import = SetupError::Import(
            PathBuf::from("/data/plate7"),
            io::Error::new(io::ErrorKind::PermissionDenied, "access denied"),
        );
        assert_eq!(
            import.to_string(),
            "failed to import images from /data/plate7: access denied"
        );

        let launch = SetupError::Launch(
            PathBuf::from("engine/OrganoidAnalyst.exe"),
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        );
        assert_eq!(
            launch.to_string(),
            "failed to launch engine/OrganoidAnalyst.exe: no such file"
        );
    }
}
