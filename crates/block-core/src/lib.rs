//! # block-core
//!
//! Core orchestration for behavioral-experiment block runs.
//!
//! This crate provides:
//! - Resolution of document-relative paths against an explicit base directory
//! - Validation of block parameter documents, including output writability
//! - The block state machine: optional calibration, then recording or playback
//! - Configuration locating the external stage programs
//!
//! Launching real processes lives in `block-adapters`; this crate only
//! talks to them through the [`StageRunner`] trait.

mod config;
mod error;
mod orchestrator;
mod parameters;
pub mod path_resolver;
pub mod testing;

pub use config::{ConfigError, OrchestratorConfig, Program, ProgramNames};
pub use error::{BlockError, ErrorKind};
pub use orchestrator::{
    AbortReason, BlockOutcome, BlockRunner, BlockState, RunOptions, Stage, StageCommand,
    StageReport, StageRunner, TerminalMode, calibrate_args, monkey_record_args, play_args,
    record_args,
};
pub use parameters::{
    BlockFlow, BlockParameters, CALIBRATION_KEYS, DEFAULT_BUFFER, FieldKind, RequiredField,
    ValidationOptions, required_fields,
};
