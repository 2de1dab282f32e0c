//! Block parameters: loading, validation and path resolution.
//!
//! A block document is a JSON object naming the stimulus clips, the output
//! destination and, for the calibrated flow, the calibration artifact. All
//! validation happens here, eagerly, before any stage program is launched.
//!
//! Validation has one deliberate side effect: an output path that does not
//! exist yet is created and immediately removed to prove it is writable.

use crate::error::BlockError;
use crate::path_resolver::{document_directory, resolve};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Keys copied into the calibration sub-document when present.
pub const CALIBRATION_KEYS: [&str; 5] = [
    "before_fixation_duration",
    "fixation_duration",
    "after_fixation_duration",
    "points",
    "pattern",
];

/// Playback buffer size used when the document has no `buffer` key.
pub const DEFAULT_BUFFER: i64 = 64;

/// Which kind of block is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockFlow {
    /// Calibrate (unless skipped), then record.
    #[default]
    Calibrated,
    /// Record without calibration or terminal handoff.
    Monkey,
    /// Play the clips back, nothing is recorded.
    Playback,
}

/// Expected JSON kind of a document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    List,
    Mapping,
    Bool,
    Int,
}

impl FieldKind {
    /// Returns true if `value` has this kind. `null` never matches.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::List => value.is_array(),
            FieldKind::Mapping => value.is_object(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Int => value.as_i64().is_some(),
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::List => "list",
            FieldKind::Mapping => "mapping",
            FieldKind::Bool => "bool",
            FieldKind::Int => "int",
        };
        f.write_str(name)
    }
}

/// A field every document of a given flow must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredField {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> RequiredField {
    RequiredField { name, kind }
}

const CALIBRATED_FIELDS: [RequiredField; 3] = [
    field("calibration", FieldKind::String),
    field("clips", FieldKind::List),
    field("output", FieldKind::String),
];
const MONKEY_FIELDS: [RequiredField; 2] = [
    field("clips", FieldKind::List),
    field("output", FieldKind::String),
];
const PLAYBACK_FIELDS: [RequiredField; 1] = [field("clips", FieldKind::List)];

/// Returns the required-field schema of `flow`, in checking order.
pub fn required_fields(flow: BlockFlow) -> &'static [RequiredField] {
    match flow {
        BlockFlow::Calibrated => &CALIBRATED_FIELDS,
        BlockFlow::Monkey => &MONKEY_FIELDS,
        BlockFlow::Playback => &PLAYBACK_FIELDS,
    }
}

/// Caller-controlled switches that change what validation accepts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationOptions {
    pub flow: BlockFlow,
    /// Existing outputs may be overwritten.
    pub force: bool,
    /// The calibration artifact already exists and will only be read.
    pub skip_calibration: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputRole {
    Calibration,
    Recording,
}

/// A validated, path-resolved block document.
///
/// Constructed once per run and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockParameters {
    document: PathBuf,
    base_directory: PathBuf,
    calibration_path: Option<PathBuf>,
    clips: Vec<PathBuf>,
    output_path: Option<PathBuf>,
    calibration_extra: Map<String, Value>,
    loop_playback: bool,
    buffer: i64,
}

impl BlockParameters {
    /// Reads, parses and validates the document at `document`.
    ///
    /// Relative paths resolve against the directory of the document's real path.
    pub fn load(document: impl AsRef<Path>, options: &ValidationOptions) -> Result<Self, BlockError> {
        let document = document.as_ref();
        debug!(document = %document.display(), flow = ?options.flow, "Loading block parameters");

        let content =
            fs::read_to_string(document).map_err(|source| BlockError::DocumentUnreadable {
                document: document.to_path_buf(),
                source,
            })?;
        let value: Value =
            serde_json::from_str(&content).map_err(|source| BlockError::DocumentMalformed {
                document: document.to_path_buf(),
                source,
            })?;

        let base_directory = document_directory(document);
        Self::from_value(value, document, &base_directory, options)
    }

    /// Validates an already-parsed document.
    ///
    /// `document` is only used in error messages; relative paths resolve
    /// against `base_directory`.
    pub fn from_value(
        value: Value,
        document: &Path,
        base_directory: &Path,
        options: &ValidationOptions,
    ) -> Result<Self, BlockError> {
        let Value::Object(mut object) = value else {
            return Err(BlockError::NotAnObject {
                document: document.to_path_buf(),
            });
        };

        for required in required_fields(options.flow) {
            let Some(value) = object.get(required.name) else {
                return Err(BlockError::MissingField {
                    document: document.to_path_buf(),
                    field: required.name.to_string(),
                });
            };
            if !required.kind.matches(value) {
                return Err(wrong_type(document, required.name, required.kind));
            }
        }

        if options.flow == BlockFlow::Playback {
            check_optional(&object, document, "loop", FieldKind::Bool)?;
            check_optional(&object, document, "buffer", FieldKind::Int)?;
        }

        let clips = clip_names(&object, document)?
            .into_iter()
            .map(|clip| resolve(clip, base_directory))
            .collect::<Vec<_>>();
        for clip in &clips {
            open_for_reading(clip).map_err(|source| BlockError::UnreadableClip {
                path: clip.clone(),
                source,
            })?;
        }

        let calibration_path = match options.flow {
            BlockFlow::Calibrated => {
                let path = resolve(string_field(&object, "calibration"), base_directory);
                check_output_path(&path, OutputRole::Calibration, options)?;
                Some(path)
            }
            BlockFlow::Monkey | BlockFlow::Playback => None,
        };

        let output_path = match options.flow {
            BlockFlow::Calibrated | BlockFlow::Monkey => {
                let path = resolve(string_field(&object, "output"), base_directory);
                check_output_path(&path, OutputRole::Recording, options)?;
                Some(path)
            }
            BlockFlow::Playback => None,
        };

        let mut calibration_extra = Map::new();
        if options.flow == BlockFlow::Calibrated {
            for key in CALIBRATION_KEYS {
                if let Some(value) = object.remove(key) {
                    calibration_extra.insert(key.to_string(), value);
                }
            }
        }

        let loop_playback = object.get("loop").and_then(Value::as_bool).unwrap_or(false);
        let buffer = object
            .get("buffer")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_BUFFER);

        debug!(
            clips = clips.len(),
            calibration = ?calibration_path,
            output = ?output_path,
            calibration_keys = calibration_extra.len(),
            "Block parameters validated"
        );

        Ok(Self {
            document: document.to_path_buf(),
            base_directory: base_directory.to_path_buf(),
            calibration_path,
            clips,
            output_path,
            calibration_extra,
            loop_playback,
            buffer,
        })
    }

    /// Path of the document these parameters were read from.
    pub fn document(&self) -> &Path {
        &self.document
    }

    /// Directory relative paths were resolved against.
    pub fn base_directory(&self) -> &Path {
        &self.base_directory
    }

    /// Absolute calibration artifact path (calibrated flow only).
    pub fn calibration_path(&self) -> Option<&Path> {
        self.calibration_path.as_deref()
    }

    /// Absolute clip paths in playback order. Never empty.
    pub fn clips(&self) -> &[PathBuf] {
        &self.clips
    }

    /// Absolute recording destination (calibrated and monkey flows).
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Calibration-only keys present in the document.
    pub fn calibration_extra(&self) -> &Map<String, Value> {
        &self.calibration_extra
    }

    pub fn loop_playback(&self) -> bool {
        self.loop_playback
    }

    pub fn buffer(&self) -> i64 {
        self.buffer
    }

    /// The narrowed document handed to the calibration program.
    pub fn calibration_document(&self) -> Value {
        Value::Object(self.calibration_extra.clone())
    }
}

fn wrong_type(document: &Path, field: &str, expected: FieldKind) -> BlockError {
    BlockError::WrongType {
        document: document.to_path_buf(),
        field: field.to_string(),
        expected,
    }
}

fn check_optional(
    object: &Map<String, Value>,
    document: &Path,
    name: &str,
    kind: FieldKind,
) -> Result<(), BlockError> {
    match object.get(name) {
        Some(value) if !kind.matches(value) => Err(wrong_type(document, name, kind)),
        _ => Ok(()),
    }
}

/// Returns the clip entries, rejecting an empty list before any file is touched.
fn clip_names<'a>(object: &'a Map<String, Value>, document: &Path) -> Result<Vec<&'a str>, BlockError> {
    let entries = object
        .get("clips")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if entries.is_empty() {
        return Err(BlockError::EmptyClips {
            document: document.to_path_buf(),
        });
    }
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            entry
                .as_str()
                .ok_or_else(|| wrong_type(document, &format!("clips[{index}]"), FieldKind::String))
        })
        .collect()
}

// Only called for fields the schema already checked.
fn string_field<'a>(object: &'a Map<String, Value>, name: &str) -> &'a str {
    object.get(name).and_then(Value::as_str).unwrap_or_default()
}

/// Opens `path` for reading. Directories are not readable files.
fn open_for_reading(path: &Path) -> io::Result<File> {
    let file = File::open(path)?;
    if file.metadata()?.is_dir() {
        return Err(io::Error::new(io::ErrorKind::IsADirectory, "is a directory"));
    }
    Ok(file)
}

fn check_output_path(path: &Path, role: OutputRole, options: &ValidationOptions) -> Result<(), BlockError> {
    let read_only = role == OutputRole::Calibration && options.skip_calibration;

    match open_for_reading(path) {
        Ok(_) => {
            if read_only || options.force {
                debug!(path = %path.display(), read_only, "Existing output accepted");
                Ok(())
            } else {
                Err(BlockError::OutputExists {
                    path: path.to_path_buf(),
                })
            }
        }
        Err(source) if read_only => Err(BlockError::MissingCalibration {
            path: path.to_path_buf(),
            source,
        }),
        Err(source) if source.kind() == io::ErrorKind::IsADirectory => Err(BlockError::CannotCreate {
            path: path.to_path_buf(),
            source,
        }),
        Err(_) => probe_writable(path, options.force),
    }
}

/// Creates and removes a placeholder to prove `path` is writable.
///
/// Never truncates or removes a file that existed before the probe.
fn probe_writable(path: &Path, force: bool) -> Result<(), BlockError> {
    let cannot_create = |source| BlockError::CannotCreate {
        path: path.to_path_buf(),
        source,
    };

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(placeholder) => {
            drop(placeholder);
            fs::remove_file(path).map_err(cannot_create)?;
            debug!(path = %path.display(), "Output path is creatable");
            Ok(())
        }
        // Present but unreadable.
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            if !force {
                return Err(BlockError::OutputExists {
                    path: path.to_path_buf(),
                });
            }
            OpenOptions::new()
                .write(true)
                .open(path)
                .map(drop)
                .map_err(cannot_create)
        }
        Err(source) => Err(cannot_create(source)),
    }
}
