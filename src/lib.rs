//! See README.md for more

mod command;
mod command_runner;
mod file_options;
mod misc;

pub mod config;
pub mod error;
pub mod incremental;
pub mod orchestrator;
pub mod runtime;
pub mod scripts;
pub mod source;
pub mod strategy;
pub mod tar_io;
pub mod workspace;

/// The process-wide `bollard::Docker` handle shared by [runtime::docker].
#[cfg(feature = "bollard")]
pub mod api_docker;
mod paths;
pub use command::*;
pub use command_runner::*;
pub use file_options::*;
pub use misc::*;
pub use paths::*;

pub use config::BuildConfig;
pub use orchestrator::{build, BuildResult};
