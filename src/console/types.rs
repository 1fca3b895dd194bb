use std::path::PathBuf;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "openbst-client", version, about = "Records repetitions streamed by an OpenVBT unit")]
pub struct Cli {
    /// Config file to use instead of the portable or per-user one.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Live session: connect to the unit and show repetitions as they arrive.
    Watch {
        /// Connect right away instead of waiting for Enter.
        #[arg(long)]
        connect: bool,
    },
    /// Print the stored repetitions of a day.
    List {
        /// Day as YYYY-MM-DD, today when absent.
        #[arg(long)]
        date: Option<String>,
    },
    /// Delete a stored repetition.
    Delete {
        capture_time_ms: i64,
    },
    /// Write the effective config (defaults included) to the config file.
    InitConfig,
}

/// A line typed during a watch session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Toggle,
    Connect,
    Disconnect,
    Delete(i64),
    ShowDate(String),
    Today,
    PermissionGranted,
    BluetoothEnabled,
    Help,
    Quit,
    Unknown(String),
}
