//! Error types for block runs.
//!
//! Every failure carries the path or field it concerns. [`BlockError::kind`]
//! collapses the variants onto the coarse categories reported to the user.

use crate::parameters::FieldKind;
use std::fmt;
use std::io;
use std::path::PathBuf;

/// Coarse error category reported alongside the detailed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed, missing or mistyped document fields.
    Schema,
    /// Unreadable clip, uncreatable output, unreadable document.
    Io,
    /// Output file exists and overwriting was not permitted.
    Conflict,
    /// No controlling terminal when one is required.
    Environment,
    /// The calibration program exited unsuccessfully.
    StageFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Schema => "SchemaError",
            ErrorKind::Io => "IOError",
            ErrorKind::Conflict => "ConflictError",
            ErrorKind::Environment => "EnvironmentError",
            ErrorKind::StageFailure => "StageFailure",
        };
        f.write_str(name)
    }
}

/// Errors raised while validating or running a block.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("could not read parameters '{}': {source}", document.display())]
    DocumentUnreadable {
        document: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse parameters '{}': {source}", document.display())]
    DocumentMalformed {
        document: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("not an object: '{}' must contain a JSON object", document.display())]
    NotAnObject { document: PathBuf },

    #[error("missing field {field}: '{}' must have a '{field}' key", document.display())]
    MissingField { document: PathBuf, field: String },

    #[error("wrong type for {field}: '{field}' of '{}' must be a {expected}", document.display())]
    WrongType {
        document: PathBuf,
        field: String,
        expected: FieldKind,
    },

    #[error("empty clips: 'clips' of '{}' is empty", document.display())]
    EmptyClips { document: PathBuf },

    #[error("unreadable clip {}: {source}", path.display())]
    UnreadableClip {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create {}: {source}", path.display())]
    CannotCreate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "missing calibration {}: it must exist when calibration is skipped ({source})",
        path.display()
    )]
    MissingCalibration {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("output exists {}: use --force to overwrite it", path.display())]
    OutputExists { path: PathBuf },

    #[error("no controlling terminal: {source}")]
    NoControllingTerminal {
        #[source]
        source: io::Error,
    },

    #[error("could not launch '{}': {source}", program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not write calibration parameters: {0}")]
    CalibrationParameters(#[source] io::Error),

    #[error("calibration failed: '{}' exited with {}", program.display(), describe_exit(*exit_code))]
    CalibrationFailed {
        program: PathBuf,
        exit_code: Option<i32>,
    },

    #[error("stage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BlockError {
    /// Returns the coarse category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlockError::DocumentMalformed { .. }
            | BlockError::NotAnObject { .. }
            | BlockError::MissingField { .. }
            | BlockError::WrongType { .. }
            | BlockError::EmptyClips { .. } => ErrorKind::Schema,
            BlockError::DocumentUnreadable { .. }
            | BlockError::UnreadableClip { .. }
            | BlockError::CannotCreate { .. }
            | BlockError::MissingCalibration { .. }
            | BlockError::Launch { .. }
            | BlockError::CalibrationParameters(_)
            | BlockError::Io(_) => ErrorKind::Io,
            BlockError::OutputExists { .. } => ErrorKind::Conflict,
            BlockError::NoControllingTerminal { .. } => ErrorKind::Environment,
            BlockError::CalibrationFailed { .. } => ErrorKind::StageFailure,
        }
    }
}

fn describe_exit(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("status {code}"),
        None => "no status (terminated by signal)".to_string(),
    }
}
