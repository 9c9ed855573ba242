//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// pcmcap - raw PCM capture from the default input device
///
/// Records interleaved 16-bit little-endian samples to a headerless file
#[derive(Parser, Debug)]
#[command(name = "pcmcap")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Configuration file (default: pcmcap.toml next to the executable,
    /// then the user config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Record from the input device
    Record {
        /// Output file for raw samples
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Recording length in seconds
        #[arg(short, long)]
        duration: Option<f64>,

        /// Input device index
        #[arg(long)]
        device: Option<u32>,

        /// Number of capture buffers kept queued on the device
        #[arg(short, long)]
        buffers: Option<usize>,

        /// Drop samples still held by the device at stop instead of writing them
        #[arg(long)]
        discard_residual: bool,

        /// Also write a WAV copy of the recording to this path
        #[arg(long)]
        wav: Option<PathBuf>,
    },

    /// List input devices and their capabilities
    List,

    /// Print a sample configuration file
    SampleConfig,
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    ///
    /// Returns None when neither flag was given, leaving the choice to
    /// the configuration file.
    pub fn log_level(&self) -> Option<tracing::Level> {
        if self.quiet {
            Some(tracing::Level::ERROR)
        } else {
            match self.verbose {
                0 => None,
                1 => Some(tracing::Level::DEBUG),
                _ => Some(tracing::Level::TRACE),
            }
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::Record {
            output: None,
            duration: None,
            device: None,
            buffers: None,
            discard_residual: false,
            wav: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_record() {
        let args = Args::parse_from(["pcmcap"]);
        assert!(args.command.is_none());
        assert_eq!(args.command.unwrap_or_default(), Command::default());
    }

    #[test]
    fn test_record_flags() {
        let args = Args::parse_from([
            "pcmcap",
            "record",
            "--output",
            "take.raw",
            "--duration",
            "2.5",
            "--buffers",
            "4",
            "--discard-residual",
        ]);
        match args.command {
            Some(Command::Record {
                output,
                duration,
                buffers,
                discard_residual,
                ..
            }) => {
                assert_eq!(output, Some(PathBuf::from("take.raw")));
                assert_eq!(duration, Some(2.5));
                assert_eq!(buffers, Some(4));
                assert!(discard_residual);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_log_level() {
        assert_eq!(Args::parse_from(["pcmcap"]).log_level(), None);
        assert_eq!(
            Args::parse_from(["pcmcap", "-vv", "list"]).log_level(),
            Some(tracing::Level::TRACE)
        );
        assert_eq!(
            Args::parse_from(["pcmcap", "-q"]).log_level(),
            Some(tracing::Level::ERROR)
        );
    }
}
