//! Orchestrator configuration.
//!
//! Optional YAML file locating the external stage programs. Every key has a
//! default, so an empty file and no file at all behave the same.

use crate::path_resolver::{document_directory, resolve};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// The external programs a block can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Calibrate,
    Record,
    MonkeyRecord,
    Play,
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding the stage programs.
    ///
    /// Relative values are resolved against the config file's directory.
    /// When unset, the directory of the running executable is used.
    #[serde(default)]
    pub programs_dir: Option<PathBuf>,

    /// Program file names.
    #[serde(default)]
    pub programs: ProgramNames,

    /// Hand interactive stages the terminal foreground.
    ///
    /// Disable on rigs without a controlling terminal.
    #[serde(default = "default_true")]
    pub terminal_handoff: bool,
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            programs_dir: None,
            programs: ProgramNames::default(),
            terminal_handoff: true,
        }
    }
}

/// File names of the stage programs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramNames {
    pub calibrate: String,
    pub record: String,
    pub monkey_record: String,
    pub play: String,
}

impl Default for ProgramNames {
    fn default() -> Self {
        Self {
            calibrate: "calibrate".to_string(),
            record: "record".to_string(),
            monkey_record: "monkey_record".to_string(),
            play: "play".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        let mut config: Self = serde_yaml::from_str(&content)?;

        if let Some(dir) = config.programs_dir.take() {
            config.programs_dir = Some(resolve(dir, document_directory(path_ref)));
        }
        debug!(
            programs_dir = ?config.programs_dir,
            terminal_handoff = config.terminal_handoff,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Returns the directory stage programs are looked up in.
    pub fn programs_dir(&self) -> PathBuf {
        if let Some(dir) = &self.programs_dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Returns the full path of `program`.
    pub fn program_path(&self, program: Program) -> PathBuf {
        let name = match program {
            Program::Calibrate => &self.programs.calibrate,
            Program::Record => &self.programs.record,
            Program::MonkeyRecord => &self.programs.monkey_record,
            Program::Play => &self.programs.play,
        };
        resolve(name, self.programs_dir())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
