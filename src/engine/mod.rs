pub mod automation;

use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// A running analysis engine as seen by the result monitor.
pub trait EngineProcess: Send {
    /// Non-blocking liveness check.
    fn is_alive(&mut self) -> bool;

    fn id(&self) -> Option<u32>;

    /// Ask the engine to stop. Used when a run is cancelled.
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts the analysis engine.
pub trait Launcher: Send + Sync {
    fn launch(&self, executable: &Path, working_dir: &Path) -> io::Result<Box<dyn EngineProcess>>;
}

/// Spawns the real engine executable as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl Launcher for SystemLauncher {
    fn launch(&self, executable: &Path, working_dir: &Path) -> io::Result<Box<dyn EngineProcess>> {
        // The engine resolves img/ and outputs/ relative to its own directory.
        let child = Command::new(executable)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;
        tracing::info!(
            executable = %executable.display(),
            cwd = %working_dir.display(),
            pid = ?child.id(),
            "Engine launched"
        );
        Ok(Box::new(EngineHandle { child }))
    }
}

pub struct EngineHandle {
    child: Child,
}

impl EngineProcess for EngineHandle {
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::info!(%status, "Engine exited");
                false
            }
            Err(e) => {
                // Status can't be queried; treat as gone so the monitor can't spin forever.
                tracing::warn!(error = %e, "Engine status unavailable");
                false
            }
        }
    }

    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}
