//! Configuration: command line and TOML file

mod args;
mod file;

pub use args::{Args, Command};
pub use file::{ConfigError, RecorderConfig};
