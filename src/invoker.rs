//! External tool execution.
//!
//! Every stage shells out to its processing binary (digifil, peasoup,
//! prepfold, the scorer, tar). The [`ToolInvoker`] trait is the seam the
//! stage handlers depend on, so tests can substitute a scripted stub and
//! never spawn real processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::PipelineError;

/// A fully-specified tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Command line as a single display string, for logs and failure notes.
    pub fn render(&self) -> String {
        let mut s = self.program.to_string_lossy().into_owned();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// Result of a completed (non-timed-out) tool run.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutcome {
    /// Promote a non-zero exit into the pipeline error taxonomy.
    pub fn require_success(self, what: &str) -> Result<Self, PipelineError> {
        if self.success {
            Ok(self)
        } else {
            let detail = if self.stderr.trim().is_empty() {
                self.stdout.trim().to_string()
            } else {
                self.stderr.trim().to_string()
            };
            Err(PipelineError::ExternalToolFailure(format!(
                "{what} exited with status {:?}: {detail}",
                self.code
            )))
        }
    }
}

/// Seam for running external processing tools.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutcome, PipelineError>;
}

/// Production invoker backed by [`tokio::process`]. An optional timeout
/// kills the child and reports a tool failure; without one the child may
/// run indefinitely (folding long observations routinely takes hours).
pub struct ProcessInvoker {
    timeout: Option<Duration>,
}

impl ProcessInvoker {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn run(&self, command: &ToolCommand) -> Result<ToolOutcome, PipelineError> {
        debug!(command = %command.render(), "spawning tool");
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            PipelineError::ExternalToolFailure(format!(
                "failed to spawn {}: {e}",
                command.program.display()
            ))
        })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait = async {
            let mut stdout = String::new();
            let mut stderr = String::new();
            let (status, out_res, err_res) = tokio::join!(
                child.wait(),
                async {
                    if let Some(p) = stdout_pipe.as_mut() {
                        p.read_to_string(&mut stdout).await?;
                    }
                    Ok::<_, std::io::Error>(())
                },
                async {
                    if let Some(p) = stderr_pipe.as_mut() {
                        p.read_to_string(&mut stderr).await?;
                    }
                    Ok::<_, std::io::Error>(())
                },
            );
            let status = status.map_err(|e| {
                PipelineError::ExternalToolFailure(format!("failed to wait on tool: {e}"))
            })?;
            if let Err(e) = out_res {
                warn!(error = %e, "failed to drain tool stdout");
            }
            if let Err(e) = err_res {
                warn!(error = %e, "failed to drain tool stderr");
            }
            Ok::<_, PipelineError>(ToolOutcome {
                success: status.success(),
                code: status.code(),
                stdout,
                stderr,
            })
        };

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(command = %command.render(), ?limit, "tool timed out, killing");
                    Err(PipelineError::ExternalToolFailure(format!(
                        "{} timed out after {limit:?}",
                        command.program.display()
                    )))
                }
            },
            None => wait.await,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
