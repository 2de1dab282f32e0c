//! Mock stage runner that records launches instead of spawning programs.
//!
//! # Example
//!
//! ```
//! use block_core::testing::MockStageRunner;
//! use block_core::Stage;
//!
//! let runner = MockStageRunner::new().with_exit_code(Stage::Calibrate, 2);
//! assert!(runner.launched().is_empty());
//! ```

use crate::error::BlockError;
use crate::orchestrator::{Stage, StageCommand, StageReport, StageRunner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;

/// A [`StageRunner`] that remembers every command it was asked to run.
///
/// Stages exit with status 0 unless scripted otherwise. For calibration
/// stages the parameters file named after `--parameters` is read while the
/// stage "runs", so tests can inspect the narrowed document.
#[derive(Debug, Default)]
pub struct MockStageRunner {
    launched: Vec<StageCommand>,
    exit_codes: HashMap<Stage, i32>,
    launch_failures: Vec<Stage>,
    calibration_documents: Vec<String>,
}

impl MockStageRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the exit code reported for `stage`.
    pub fn with_exit_code(mut self, stage: Stage, code: i32) -> Self {
        self.exit_codes.insert(stage, code);
        self
    }

    /// Makes launching `stage` fail as if its program were missing.
    pub fn with_launch_failure(mut self, stage: Stage) -> Self {
        self.launch_failures.push(stage);
        self
    }

    /// Commands in launch order, including ones that failed to launch.
    pub fn launched(&self) -> &[StageCommand] {
        &self.launched
    }

    /// Contents of each calibration parameters file seen.
    pub fn calibration_documents(&self) -> &[String] {
        &self.calibration_documents
    }

    fn capture_parameters(&mut self, command: &StageCommand) {
        let path = command
            .args
            .iter()
            .skip_while(|arg| arg.as_os_str() != "--parameters")
            .nth(1);
        if let Some(path) = path
            && let Ok(content) = std::fs::read_to_string(path)
        {
            self.calibration_documents.push(content);
        }
    }
}

#[async_trait]
impl StageRunner for MockStageRunner {
    async fn run_stage(&mut self, command: &StageCommand) -> Result<StageReport, BlockError> {
        self.launched.push(command.clone());

        if self.launch_failures.contains(&command.stage) {
            return Err(BlockError::Launch {
                program: command.program.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "mock launch failure"),
            });
        }
        if command.stage == Stage::Calibrate {
            self.capture_parameters(command);
        }

        let code = self.exit_codes.get(&command.stage).copied().unwrap_or(0);
        Ok(StageReport {
            stage: command.stage,
            exit_code: Some(code),
            success: code == 0,
            lines_forwarded: 0,
            lines_suppressed: 0,
        })
    }
}
