//! Driving the engine's own window to start processing.
//!
//! The engine has no batch mode; someone has to press its start button. A
//! driver does that on the operator's behalf. Drivers are allowed to fail: the
//! pipeline logs the error and keeps watching, since the operator can always
//! finish the step by hand.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationParams {
    /// Detection confidence to enter in the engine's settings.
    pub confidence: f64,
    /// Regex matched against window titles to find the engine.
    pub window_title: String,
    /// How long to wait for the window (and the helper) before giving up.
    #[serde(with = "humantime_serde")]
    pub window_timeout: Duration,
    /// Helper program that performs the click/keystroke sequence.
    pub command: Option<PathBuf>,
}

impl Default for AutomationParams {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            window_title: ".*GelNestOrganoid.*".to_string(),
            window_timeout: Duration::from_secs(30),
            command: None,
        }
    }
}

/// The window a driver should act on.
#[derive(Debug, Clone)]
pub struct EngineWindow {
    pub pid: Option<u32>,
    pub title_pattern: String,
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("no automation helper configured")]
    NotConfigured,
    #[error("failed to start automation helper {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("engine window not found within {0:?}")]
    Timeout(Duration),
    #[error("automation helper exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn drive(
        &self,
        window: &EngineWindow,
        params: &AutomationParams,
    ) -> Result<(), AutomationError>;
}

/// Leaves the start step to the operator.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualDriver;

#[async_trait]
impl AutomationDriver for ManualDriver {
    fn name(&self) -> &'static str {
        "manual"
    }

    async fn drive(&self, _: &EngineWindow, _: &AutomationParams) -> Result<(), AutomationError> {
        Err(AutomationError::NotConfigured)
    }
}

/// Runs an external helper (a UI scripting tool) with the window details as arguments:
/// `<program> --pid <pid> --title <regex> --confidence <value>`.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    program: PathBuf,
}

impl CommandDriver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, window: &EngineWindow, params: &AutomationParams) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(pid) = window.pid {
            cmd.arg("--pid").arg(pid.to_string());
        }
        cmd.arg("--title")
            .arg(&window.title_pattern)
            .arg("--confidence")
            .arg(params.confidence.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl AutomationDriver for CommandDriver {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn drive(
        &self,
        window: &EngineWindow,
        params: &AutomationParams,
    ) -> Result<(), AutomationError> {
        let child = self
            .command(window, params)
            .spawn()
            .map_err(|source| AutomationError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(params.window_timeout, child.wait_with_output()).await
        {
            Ok(res) => res.map_err(|source| AutomationError::Spawn {
                program: self.program.clone(),
                source,
            })?,
            // Dropping the future drops the child, which kills it.
            Err(_) => return Err(AutomationError::Timeout(params.window_timeout)),
        };

        if output.status.success() {
            tracing::info!(program = %self.program.display(), "Automation helper finished");
            Ok(())
        } else {
            Err(AutomationError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Pick the driver implied by the configuration.
pub fn driver_for(params: &AutomationParams) -> Arc<dyn AutomationDriver> {
    match &params.command {
        Some(program) => Arc::new(CommandDriver::new(program)),
        None => Arc::new(ManualDriver),
    }
}
