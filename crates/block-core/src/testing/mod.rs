//! Testing utilities for driving block runs without real subprocesses.

pub mod mock_runner;

pub use mock_runner::MockStageRunner;
