use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

/// Captured result of one external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Capability boundary for spawning external processes. The orchestrator
/// depends on this trait rather than on a concrete binary, so tests can
/// substitute fakes that write canned output files.
#[async_trait]
pub trait ExternalTool: Send + Sync {
    async fn invoke(&self, args: &[String]) -> io::Result<ToolOutput>;

    /// Program name used in diagnostics.
    fn describe(&self) -> String;
}

/// Real tool invocation via `tokio::process`. A hung tool is killed once the
/// deadline passes; `kill_on_drop` covers cancellation mid-await.
#[derive(Debug, Clone)]
pub struct SystemTool {
    program: PathBuf,
    timeout: Duration,
    work_dir: Option<PathBuf>,
}

impl SystemTool {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            work_dir: None,
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }
}

#[async_trait]
impl ExternalTool for SystemTool {
    async fn invoke(&self, args: &[String]) -> io::Result<ToolOutput> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null());
        if let Some(dir) = &self.work_dir {
            command.current_dir(dir);
        }
        let output = match timeout(self.timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "{} did not finish within {:?}",
                        self.program.display(),
                        self.timeout
                    ),
                ));
            }
        };
        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn describe(&self) -> String {
        self.program.display().to_string()
    }
}
