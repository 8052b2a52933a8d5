use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(about, version, author)]
pub struct Cli {
    /// Minimum log level to print out
    #[clap(long, value_enum, default_value = "warn")]
    pub log_level: LevelFilter,

    /// Location of the settings file on disk
    #[clap(long, default_value_os_t = default_config_location())]
    pub config: PathBuf,

    /// Milliseconds allowed for opening the connection (overrides the settings file)
    #[clap(long)]
    pub open_timeout: Option<u64>,

    /// Milliseconds allowed for each transfer (overrides the settings file)
    #[clap(long)]
    pub timeout: Option<u64>,

    #[clap(subcommand)]
    pub command: SubCommands,
}

#[derive(Subcommand, Debug)]
pub enum SubCommands {
    /// List the USBTMC devices attached to this machine
    ListUsb {
        /// Print the devices as JSON
        #[clap(long)]
        json: bool,
    },

    /// List the serial ports on this machine
    ListSerial,

    /// Ask an instrument to identify itself (*IDN?)
    Idn {
        /// A VISA resource string, or an alias from the settings file
        address: String,
    },

    /// Send a command which has no response
    Send {
        /// A VISA resource string, or an alias from the settings file
        address: String,
        command: String,
    },

    /// Send a command and print the response
    Query {
        /// A VISA resource string, or an alias from the settings file
        address: String,
        command: String,

        /// The response is a definite length binary block, print its size rather than its content
        #[clap(long)]
        binary: bool,
    },

    /// Store an alias for a VISA resource string in the settings file
    Alias {
        name: String,
        resource: String,
    },
}

fn default_config_location() -> PathBuf {
    ProjectDirs::from("org", "Instrument-Link", "Instrument-Client")
        .map(|dirs| dirs.config_dir().join("settings.json"))
        .unwrap_or_else(|| PathBuf::from("settings.json"))
}

#[repr(usize)]
#[derive(clap::ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}
