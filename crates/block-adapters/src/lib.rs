//! # block-adapters
//!
//! Real-process plumbing for block runs.
//!
//! This crate provides:
//! - [`ProcessStageRunner`], the `StageRunner` that spawns stage programs with
//!   stdout and stderr merged onto one pipe
//! - [`OutputFilter`], which drops GPU/codec driver noise from that stream
//! - The terminal foreground handoff used for interactive stages
//!
//! Unix only: the handoff relies on process groups and `tcsetpgrp`.

mod output_filter;
mod process_executor;
pub mod terminal;

pub use output_filter::{FilterStats, NOISE_PREFIXES, OutputFilter};
pub use process_executor::ProcessStageRunner;
pub use terminal::ForegroundLease;
