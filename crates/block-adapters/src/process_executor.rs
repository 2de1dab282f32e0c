//! Process-backed stage runner.
//!
//! Spawns a stage program with stdout and stderr joined on one pipe, pushes
//! every line through the [`OutputFilter`] to the configured writer, and
//! waits for the exit status once the pipe reaches end-of-stream.
//!
//! There is no timeout: a stage that never closes its output blocks the run.

use crate::output_filter::OutputFilter;
use crate::terminal::ForegroundLease;
use async_trait::async_trait;
use block_core::{BlockError, StageCommand, StageReport, StageRunner, TerminalMode};
use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::process::Stdio;
use tokio::io::BufReader;
use tokio::net::unix::pipe;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs stages as real child processes.
#[derive(Debug)]
pub struct ProcessStageRunner<W> {
    filter: OutputFilter,
    writer: W,
}

impl<W: Write + Send> ProcessStageRunner<W> {
    /// Creates a runner forwarding filtered stage output to `writer`.
    pub fn new(filter: OutputFilter, writer: W) -> Self {
        Self { filter, writer }
    }

    /// Consumes the runner, returning the output writer.
    pub fn into_writer(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W: Write + Send> StageRunner for ProcessStageRunner<W> {
    async fn run_stage(&mut self, command: &StageCommand) -> Result<StageReport, BlockError> {
        let (output, output_writer) = std::io::pipe()?;

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::inherit())
            .stdout(output_writer.try_clone()?)
            .stderr(output_writer);

        // Held until the stage has exited, then hands the terminal back.
        let _lease = match command.terminal {
            TerminalMode::Handoff => Some(ForegroundLease::acquire(&mut process)?),
            TerminalMode::Inherit => None,
        };

        debug!(
            stage = %command.stage,
            program = %command.program.display(),
            args = ?command.args,
            terminal = ?command.terminal,
            "Spawning stage program"
        );
        let mut child = process.spawn().map_err(|source| BlockError::Launch {
            program: command.program.clone(),
            source,
        })?;
        // Our copies of the write end must go, or the pipe never reaches EOF.
        drop(process);
        info!(stage = %command.stage, pid = ?child.id(), "Stage started");

        let receiver = pipe::Receiver::from_file(File::from(OwnedFd::from(output)))?;
        let mut reader = BufReader::new(receiver);
        let stats = match self.filter.forward(&mut reader, &mut self.writer).await {
            Ok(stats) => stats,
            Err(err) => {
                // The child must be gone before the lease hands the terminal back.
                warn!(stage = %command.stage, "Forwarding stage output failed, stopping it: {}", err);
                let _ = child.start_kill();
                child.wait().await?;
                return Err(err.into());
            }
        };

        let status = child.wait().await?;
        debug!(
            stage = %command.stage,
            %status,
            forwarded = stats.forwarded,
            suppressed = stats.suppressed,
            "Stage output drained"
        );

        Ok(StageReport {
            stage: command.stage,
            exit_code: status.code(),
            success: status.success(),
            lines_forwarded: stats.forwarded,
            lines_suppressed: stats.suppressed,
        })
    }
}
