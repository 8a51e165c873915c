//! Command-line interface definitions for lwksim.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use lwk_core::log::LogLevel;

/// Host simulator for the LWK partition scheduler.
#[derive(Parser)]
#[command(name = "lwksim", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Most verbose scheduler log level written to stderr.
    #[arg(long, short = 'l', global = true, value_enum, default_value_t = LogArg::Warn)]
    pub log_level: LogArg,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run a scenario file and print placements and statistics.
    Run(RunArgs),
    /// Print the resolved topology of a uniform machine.
    Topology(TopologyArgs),
    /// Parse a process option list and print the resulting options.
    Options(OptionsArgs),
}

/// Arguments for the `run` subcommand.
#[derive(Parser)]
pub struct RunArgs {
    /// Scenario description (TOML).
    pub scenario: PathBuf,

    /// Timer ticks to deliver to every reserved CPU before teardown.
    #[arg(long, default_value_t = 0)]
    pub ticks: u32,
}

/// Arguments for the `topology` subcommand.
#[derive(Parser)]
pub struct TopologyArgs {
    /// NUMA nodes.
    #[arg(long, default_value_t = 2)]
    pub nodes: u32,

    /// Cores per node.
    #[arg(long, default_value_t = 4)]
    pub cores: u32,

    /// Hardware threads per core.
    #[arg(long, default_value_t = 2)]
    pub threads: u32,
}

/// Arguments for the `options` subcommand.
#[derive(Parser)]
pub struct OptionsArgs {
    /// Comma-separated `name[=value]` list, e.g. `util-threads=2,one-cpu-per-util`.
    pub list: String,
}

/// Log verbosity selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogArg {
    /// Errors only.
    Error,
    /// Degraded placements and counter anomalies.
    Warn,
    /// Lifecycle events and statistics summaries.
    Info,
    /// Placement decisions.
    Debug,
    /// Everything.
    Trace,
}

impl From<LogArg> for LogLevel {
    fn from(arg: LogArg) -> Self {
        match arg {
            LogArg::Error => LogLevel::Error,
            LogArg::Warn => LogLevel::Warn,
            LogArg::Info => LogLevel::Info,
            LogArg::Debug => LogLevel::Debug,
            LogArg::Trace => LogLevel::Trace,
        }
    }
}
