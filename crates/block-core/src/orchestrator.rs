//! Block orchestration.
//!
//! Sequences the stages of one block run:
//!
//! ```text
//! Idle -> Validating -> [Calibrating] -> Recording | Playing -> Done
//!              \              \
//!               `--------------`--> Aborted(reason)
//! ```
//!
//! Calibration runs only in the calibrated flow when it is not skipped, and a
//! failed calibration stops the block before recording. The final stage is
//! not gated on its exit status: draining its output is the completion
//! signal, and the status is reported back in [`BlockOutcome`].
//!
//! Stages are launched through the [`StageRunner`] seam so the state machine
//! can be driven without real subprocesses.

use crate::config::{OrchestratorConfig, Program};
use crate::error::{BlockError, ErrorKind};
use crate::parameters::{BlockFlow, BlockParameters, ValidationOptions};
use async_trait::async_trait;
use std::ffi::OsString;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// A stage of a block run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Calibrate,
    Record,
    MonkeyRecord,
    Play,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Calibrate => "calibrate",
            Stage::Record => "record",
            Stage::MonkeyRecord => "monkey_record",
            Stage::Play => "play",
        };
        f.write_str(name)
    }
}

/// Whether a stage is handed the terminal foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalMode {
    /// Runs in the orchestrator's process group.
    Inherit,
    /// Runs in its own process group, which becomes the terminal foreground.
    Handoff,
}

/// A fully built stage invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub stage: Stage,
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub terminal: TerminalMode,
}

impl StageCommand {
    /// Arguments as strings, for logging and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }
}

/// What a finished stage reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    /// Exit code, `None` when the program was killed by a signal.
    pub exit_code: Option<i32>,
    pub success: bool,
    pub lines_forwarded: u64,
    pub lines_suppressed: u64,
}

/// Launches stage programs and waits for them to finish.
#[async_trait]
pub trait StageRunner: Send {
    /// Runs `command` until its output reaches end-of-stream and its exit
    /// status has been observed.
    async fn run_stage(&mut self, command: &StageCommand) -> Result<StageReport, BlockError>;
}

/// Why a block stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The document failed validation.
    Invalid(ErrorKind),
    /// The calibration program exited unsuccessfully.
    CalibrationFailed,
    /// A stage could not be launched or its output could not be read.
    StageError(ErrorKind),
}

/// Where a block run currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Idle,
    Validating,
    Calibrating,
    Recording,
    Playing,
    Done,
    Aborted(AbortReason),
}

/// Switches for one block run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub flow: BlockFlow,
    pub force: bool,
    pub skip_calibration: bool,
    pub fake_events: bool,
    /// Hand interactive stages the terminal foreground.
    pub terminal_handoff: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            flow: BlockFlow::Calibrated,
            force: false,
            skip_calibration: false,
            fake_events: false,
            terminal_handoff: true,
        }
    }
}

impl RunOptions {
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            flow: self.flow,
            force: self.force,
            skip_calibration: self.skip_calibration,
        }
    }

    fn calibrates(&self) -> bool {
        self.flow == BlockFlow::Calibrated && !self.skip_calibration
    }

    fn interactive_terminal(&self) -> TerminalMode {
        if self.terminal_handoff {
            TerminalMode::Handoff
        } else {
            TerminalMode::Inherit
        }
    }
}

/// Result of a completed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOutcome {
    /// The calibration stage, when it ran.
    pub calibration: Option<StageReport>,
    /// The recording or playback stage.
    pub final_stage: StageReport,
}

impl BlockOutcome {
    /// True if the final program itself exited successfully.
    pub fn final_stage_succeeded(&self) -> bool {
        self.final_stage.success
    }
}

/// Runs one block through its stages.
pub struct BlockRunner<R> {
    runner: R,
    config: OrchestratorConfig,
    options: RunOptions,
    state: BlockState,
}

impl<R: StageRunner> BlockRunner<R> {
    pub fn new(runner: R, config: OrchestratorConfig, options: RunOptions) -> Self {
        Self {
            runner,
            config,
            options,
            state: BlockState::Idle,
        }
    }

    pub fn state(&self) -> &BlockState {
        &self.state
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Loads and validates `document`, then runs the block.
    ///
    /// Nothing is launched unless validation succeeds.
    pub async fn run_document(&mut self, document: &Path) -> Result<BlockOutcome, BlockError> {
        self.transition(BlockState::Validating);
        let params = match BlockParameters::load(document, &self.options.validation_options()) {
            Ok(params) => params,
            Err(err) => {
                self.transition(BlockState::Aborted(AbortReason::Invalid(err.kind())));
                return Err(err);
            }
        };
        self.run(&params).await
    }

    /// Runs the stages of an already validated block.
    pub async fn run(&mut self, params: &BlockParameters) -> Result<BlockOutcome, BlockError> {
        let calibration = if self.options.calibrates() {
            self.transition(BlockState::Calibrating);
            let result = self.calibrate(params).await;
            Some(self.abort_on_error(result)?)
        } else {
            None
        };

        let command = match self.options.flow {
            BlockFlow::Calibrated => {
                self.transition(BlockState::Recording);
                self.record_command(params)
            }
            BlockFlow::Monkey => {
                self.transition(BlockState::Recording);
                Ok(self.monkey_record_command(params))
            }
            BlockFlow::Playback => {
                self.transition(BlockState::Playing);
                Ok(self.play_command(params))
            }
        };
        let command = self.abort_on_error(command)?;

        info!(stage = %command.stage, program = %command.program.display(), "Starting stage");
        let result = self.runner.run_stage(&command).await;
        let final_stage = self.abort_on_error(result)?;

        info!(
            stage = %final_stage.stage,
            exit_code = ?final_stage.exit_code,
            "Stage finished"
        );

        self.transition(BlockState::Done);
        Ok(BlockOutcome {
            calibration,
            final_stage,
        })
    }

    /// Runs the calibration program against a narrowed parameters file.
    ///
    /// The temporary file lives exactly as long as this call.
    async fn calibrate(&mut self, params: &BlockParameters) -> Result<StageReport, BlockError> {
        let calibration_path = require_calibration(params)?;
        let program = self.config.program_path(Program::Calibrate);
        let parameters_file = write_calibration_parameters(params)?;

        let command = StageCommand {
            stage: Stage::Calibrate,
            program: program.clone(),
            args: calibrate_args(calibration_path, parameters_file.path(), self.options.force),
            terminal: self.options.interactive_terminal(),
        };

        info!(program = %program.display(), "Starting calibration");
        let report = self.runner.run_stage(&command).await?;
        if !report.success {
            return Err(BlockError::CalibrationFailed {
                program,
                exit_code: report.exit_code,
            });
        }
        info!("Calibration finished");
        Ok(report)
    }

    fn record_command(&self, params: &BlockParameters) -> Result<StageCommand, BlockError> {
        let calibration_path = require_calibration(params)?;
        Ok(StageCommand {
            stage: Stage::Record,
            program: self.config.program_path(Program::Record),
            args: record_args(
                calibration_path,
                params,
                self.options.force,
                self.options.fake_events,
            ),
            terminal: self.options.interactive_terminal(),
        })
    }

    fn monkey_record_command(&self, params: &BlockParameters) -> StageCommand {
        StageCommand {
            stage: Stage::MonkeyRecord,
            program: self.config.program_path(Program::MonkeyRecord),
            args: monkey_record_args(params, self.options.force),
            terminal: TerminalMode::Inherit,
        }
    }

    fn play_command(&self, params: &BlockParameters) -> StageCommand {
        StageCommand {
            stage: Stage::Play,
            program: self.config.program_path(Program::Play),
            args: play_args(params),
            terminal: TerminalMode::Inherit,
        }
    }

    fn abort_on_error<T>(&mut self, result: Result<T, BlockError>) -> Result<T, BlockError> {
        if let Err(err) = &result {
            let reason = match err {
                BlockError::CalibrationFailed { .. } => AbortReason::CalibrationFailed,
                other => AbortReason::StageError(other.kind()),
            };
            self.transition(BlockState::Aborted(reason));
        }
        result
    }

    fn transition(&mut self, next: BlockState) {
        debug!(from = ?self.state, to = ?next, "Block state transition");
        self.state = next;
    }
}

fn require_calibration(params: &BlockParameters) -> Result<&Path, BlockError> {
    params
        .calibration_path()
        .ok_or_else(|| BlockError::MissingField {
            document: params.document().to_path_buf(),
            field: "calibration".to_string(),
        })
}

fn write_calibration_parameters(params: &BlockParameters) -> Result<NamedTempFile, BlockError> {
    let write = || -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("calibrate-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(&mut file, &params.calibration_document())?;
        file.flush()?;
        Ok(file)
    };
    let file = write().map_err(BlockError::CalibrationParameters)?;
    debug!(path = %file.path().display(), "Wrote calibration parameters");
    Ok(file)
}

fn paths<'a>(items: impl IntoIterator<Item = &'a PathBuf>) -> impl Iterator<Item = OsString> {
    items.into_iter().map(|path| path.clone().into_os_string())
}

/// `<calibration_path> --parameters <parameters_path> [--force]`
pub fn calibrate_args(calibration_path: &Path, parameters_path: &Path, force: bool) -> Vec<OsString> {
    let mut args = vec![
        calibration_path.as_os_str().to_owned(),
        OsString::from("--parameters"),
        parameters_path.as_os_str().to_owned(),
    ];
    if force {
        args.push(OsString::from("--force"));
    }
    args
}

/// `<calibration_path> <clip>... <output_path> [--force] [--fake-events]`
pub fn record_args(
    calibration_path: &Path,
    params: &BlockParameters,
    force: bool,
    fake_events: bool,
) -> Vec<OsString> {
    let mut args = vec![calibration_path.as_os_str().to_owned()];
    args.extend(paths(params.clips()));
    if let Some(output) = params.output_path() {
        args.push(output.as_os_str().to_owned());
    }
    if force {
        args.push(OsString::from("--force"));
    }
    if fake_events {
        args.push(OsString::from("--fake-events"));
    }
    args
}

/// `<clip>... <output_path> [--force]`
pub fn monkey_record_args(params: &BlockParameters, force: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = paths(params.clips()).collect();
    if let Some(output) = params.output_path() {
        args.push(output.as_os_str().to_owned());
    }
    if force {
        args.push(OsString::from("--force"));
    }
    args
}

/// `<clip>... [--loop] --buffer <n>`
pub fn play_args(params: &BlockParameters) -> Vec<OsString> {
    let mut args: Vec<OsString> = paths(params.clips()).collect();
    if params.loop_playback() {
        args.push(OsString::from("--loop"));
    }
    args.push(OsString::from("--buffer"));
    args.push(OsString::from(params.buffer().to_string()));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStageRunner;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        base: PathBuf,
        document: PathBuf,
    }

    impl Fixture {
        fn new(document: serde_json::Value, files: &[&str]) -> Self {
            let dir = TempDir::new().unwrap();
            for name in files {
                fs::write(dir.path().join(name), b"data").unwrap();
            }
            let path = dir.path().join("block.json");
            fs::write(&path, document.to_string()).unwrap();
            let base = fs::canonicalize(dir.path()).unwrap();
            Self {
                _dir: dir,
                base,
                document: path,
            }
        }

        fn at(&self, name: &str) -> String {
            self.base.join(name).to_string_lossy().into_owned()
        }
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            programs_dir: Some(PathBuf::from("/opt/rig/bin")),
            ..OrchestratorConfig::default()
        }
    }

    fn scenario_a() -> Fixture {
        Fixture::new(
            json!({"calibration": "cal.out", "clips": ["a.mp4", "b.mp4"], "output": "out.log"}),
            &["a.mp4", "b.mp4"],
        )
    }

    #[tokio::test]
    async fn test_calibrates_then_records() {
        let fixture = scenario_a();
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), RunOptions::default());

        let outcome = block.run_document(&fixture.document).await.unwrap();

        let launched = block.runner().launched();
        assert_eq!(launched.len(), 2);

        let calibrate = &launched[0];
        assert_eq!(calibrate.stage, Stage::Calibrate);
        assert_eq!(calibrate.program, PathBuf::from("/opt/rig/bin/calibrate"));
        assert_eq!(calibrate.terminal, TerminalMode::Handoff);
        let args = calibrate.args_lossy();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], fixture.at("cal.out"));
        assert_eq!(args[1], "--parameters");
        assert!(args[2].ends_with(".json"));

        let record = &launched[1];
        assert_eq!(record.stage, Stage::Record);
        assert_eq!(record.program, PathBuf::from("/opt/rig/bin/record"));
        assert_eq!(
            record.args_lossy(),
            [
                fixture.at("cal.out"),
                fixture.at("a.mp4"),
                fixture.at("b.mp4"),
                fixture.at("out.log"),
            ]
        );

        assert!(outcome.calibration.is_some());
        assert!(outcome.final_stage_succeeded());
        assert_eq!(block.state(), &BlockState::Done);
    }

    #[tokio::test]
    async fn test_calibration_parameters_file_is_narrowed_and_released() {
        let fixture = Fixture::new(
            json!({
                "calibration": "cal.out",
                "clips": ["a.mp4"],
                "output": "out.log",
                "fixation_duration": 1.5,
                "pattern": "grid",
                "buffer": 12
            }),
            &["a.mp4"],
        );
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), RunOptions::default());

        block.run_document(&fixture.document).await.unwrap();

        let captured = block.runner().calibration_documents();
        assert_eq!(captured.len(), 1);
        let document: serde_json::Value = serde_json::from_str(&captured[0]).unwrap();
        assert_eq!(document, json!({"fixation_duration": 1.5, "pattern": "grid"}));

        let temp_path = PathBuf::from(&block.runner().launched()[0].args_lossy()[2]);
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_flags_forwarded() {
        let fixture = scenario_a();
        let options = RunOptions {
            force: true,
            fake_events: true,
            ..RunOptions::default()
        };
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), options);

        block.run_document(&fixture.document).await.unwrap();

        let launched = block.runner().launched();
        assert_eq!(launched[0].args_lossy().last().unwrap(), "--force");
        let record_args = launched[1].args_lossy();
        assert_eq!(&record_args[record_args.len() - 2..], ["--force", "--fake-events"]);
    }

    #[tokio::test]
    async fn test_calibration_failure_stops_block() {
        let fixture = scenario_a();
        let runner = MockStageRunner::new().with_exit_code(Stage::Calibrate, 3);
        let mut block = BlockRunner::new(runner, config(), RunOptions::default());

        let err = block.run_document(&fixture.document).await.unwrap_err();

        assert!(matches!(
            err,
            BlockError::CalibrationFailed {
                exit_code: Some(3),
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::StageFailure);
        assert_eq!(block.runner().launched().len(), 1);
        assert_eq!(
            block.state(),
            &BlockState::Aborted(AbortReason::CalibrationFailed)
        );

        let temp_path = PathBuf::from(&block.runner().launched()[0].args_lossy()[2]);
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_existing_output_aborts_before_launch() {
        let fixture = Fixture::new(
            json!({"calibration": "cal.out", "clips": ["a.mp4", "b.mp4"], "output": "out.log"}),
            &["a.mp4", "b.mp4", "out.log"],
        );
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), RunOptions::default());

        let err = block.run_document(&fixture.document).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(block.runner().launched().is_empty());
        assert_eq!(
            block.state(),
            &BlockState::Aborted(AbortReason::Invalid(ErrorKind::Conflict))
        );
    }

    #[tokio::test]
    async fn test_missing_key_aborts_before_launch() {
        let fixture = Fixture::new(json!({"calibration": "cal.out", "clips": ["a.mp4"]}), &["a.mp4"]);
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), RunOptions::default());

        let err = block.run_document(&fixture.document).await.unwrap_err();

        assert!(matches!(&err, BlockError::MissingField { field, .. } if field == "output"));
        assert!(block.runner().launched().is_empty());
    }

    #[tokio::test]
    async fn test_skip_calibration_records_only() {
        let fixture = Fixture::new(
            json!({"calibration": "cal.out", "clips": ["a.mp4"], "output": "out.log"}),
            &["a.mp4", "cal.out"],
        );
        let options = RunOptions {
            skip_calibration: true,
            ..RunOptions::default()
        };
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), options);

        let outcome = block.run_document(&fixture.document).await.unwrap();

        let launched = block.runner().launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].stage, Stage::Record);
        assert_eq!(launched[0].args_lossy()[0], fixture.at("cal.out"));
        assert!(outcome.calibration.is_none());
    }

    #[tokio::test]
    async fn test_skip_calibration_without_artifact_aborts() {
        let fixture = scenario_a();
        let options = RunOptions {
            skip_calibration: true,
            ..RunOptions::default()
        };
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), options);

        let err = block.run_document(&fixture.document).await.unwrap_err();

        assert!(matches!(err, BlockError::MissingCalibration { .. }));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(block.runner().launched().is_empty());
    }

    #[tokio::test]
    async fn test_failed_recording_still_completes() {
        let fixture = scenario_a();
        let runner = MockStageRunner::new().with_exit_code(Stage::Record, 1);
        let mut block = BlockRunner::new(runner, config(), RunOptions::default());

        let outcome = block.run_document(&fixture.document).await.unwrap();

        assert!(!outcome.final_stage_succeeded());
        assert_eq!(outcome.final_stage.exit_code, Some(1));
        assert_eq!(block.state(), &BlockState::Done);
    }

    #[tokio::test]
    async fn test_launch_error_aborts() {
        let fixture = scenario_a();
        let runner = MockStageRunner::new().with_launch_failure(Stage::Calibrate);
        let mut block = BlockRunner::new(runner, config(), RunOptions::default());

        let err = block.run_document(&fixture.document).await.unwrap_err();

        assert!(matches!(err, BlockError::Launch { .. }));
        assert_eq!(
            block.state(),
            &BlockState::Aborted(AbortReason::StageError(ErrorKind::Io))
        );
    }

    #[tokio::test]
    async fn test_terminal_handoff_disabled() {
        let fixture = scenario_a();
        let options = RunOptions {
            terminal_handoff: false,
            ..RunOptions::default()
        };
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), options);

        block.run_document(&fixture.document).await.unwrap();

        assert!(
            block
                .runner()
                .launched()
                .iter()
                .all(|command| command.terminal == TerminalMode::Inherit)
        );
    }

    #[tokio::test]
    async fn test_monkey_flow() {
        let fixture = Fixture::new(
            json!({"clips": ["b.mp4", "a.mp4"], "output": "out.log"}),
            &["a.mp4", "b.mp4"],
        );
        let options = RunOptions {
            flow: BlockFlow::Monkey,
            force: true,
            ..RunOptions::default()
        };
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), options);

        block.run_document(&fixture.document).await.unwrap();

        let launched = block.runner().launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].stage, Stage::MonkeyRecord);
        assert_eq!(launched[0].program, PathBuf::from("/opt/rig/bin/monkey_record"));
        assert_eq!(launched[0].terminal, TerminalMode::Inherit);
        assert_eq!(
            launched[0].args_lossy(),
            [
                fixture.at("b.mp4"),
                fixture.at("a.mp4"),
                fixture.at("out.log"),
                "--force".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_play_flow() {
        let fixture = Fixture::new(json!({"clips": ["a.mp4"], "loop": true}), &["a.mp4"]);
        let options = RunOptions {
            flow: BlockFlow::Playback,
            ..RunOptions::default()
        };
        let mut block = BlockRunner::new(MockStageRunner::new(), config(), options);

        block.run_document(&fixture.document).await.unwrap();

        let launched = block.runner().launched();
        assert_eq!(launched[0].stage, Stage::Play);
        assert_eq!(launched[0].terminal, TerminalMode::Inherit);
        assert_eq!(
            launched[0].args_lossy(),
            [
                fixture.at("a.mp4"),
                "--loop".to_string(),
                "--buffer".to_string(),
                "64".to_string(),
            ]
        );
        assert_eq!(block.state(), &BlockState::Done);
    }
}
