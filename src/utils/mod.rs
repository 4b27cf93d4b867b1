//! Ready made utilities and helpers for role code.

pub mod cli;
pub mod fs;
pub mod hostname;

pub use cli::{CliArgs, CliBuilder, CliOption, CliValue};
pub use fs::{FileAttrs, LinuxFileSystem};
pub use hostname::HostnameUtils;
