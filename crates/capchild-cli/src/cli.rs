//! Command-line argument definitions for `capctl`.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// How command results are written to stdout.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text, one record per line.
    #[default]
    Human,
    /// One JSON object per line.
    Json,
}

/// Controller for packet-capture workers.
#[derive(Parser, Debug)]
#[command(name = "capctl", version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) global: GlobalArgs,
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Options shared by every subcommand.
///
/// Configuration flags such as `--config-path` are taken off the front of the
/// command line before clap sees it.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct GlobalArgs {
    /// Result format on stdout.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Human)]
    pub(crate) output: OutputFormat,
}

/// Subcommands.
#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Lists capture interfaces.
    Interfaces,
    /// Shows the link-layer types an interface supports.
    Capabilities {
        /// Interface name.
        interface: String,
        /// Query monitor-mode capabilities.
        #[arg(long)]
        monitor_mode: bool,
        /// Remote capture credentials.
        #[arg(long, value_name = "AUTH")]
        auth: Option<String>,
    },
    /// Tunes a wireless interface.
    Channel {
        /// Interface name.
        interface: String,
        /// Centre frequency in MHz.
        frequency: u32,
        /// Channel type, for example `HT40+`.
        #[arg(long = "type", value_name = "TYPE")]
        channel_type: Option<String>,
        /// First centre frequency segment.
        #[arg(long, requires = "channel_type")]
        center_freq1: Option<u32>,
        /// Second centre frequency segment.
        #[arg(long, requires = "center_freq1")]
        center_freq2: Option<u32>,
    },
    /// Prints per-interface statistics.
    Stats {
        /// Samples to print before closing the channel.
        #[arg(long, default_value_t = 1)]
        samples: usize,
        /// Longest wait for a sample, in milliseconds.
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },
    /// Runs a capture and prints its events.
    Capture(CaptureArgs),
}

/// Options for `capctl capture`.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct CaptureArgs {
    /// Interfaces to capture on.
    #[arg(short, long = "interface", value_name = "IF")]
    pub(crate) interfaces: Vec<String>,
    /// Stop after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub(crate) duration_secs: Option<u64>,
    /// Stop once this many packets were reported.
    #[arg(long, value_name = "COUNT")]
    pub(crate) packet_limit: Option<u64>,
    /// Extra worker arguments, passed through verbatim.
    #[arg(last = true, value_name = "ARG")]
    pub(crate) worker_args: Vec<String>,
}

impl CaptureArgs {
    /// Worker arguments for this capture.
    pub(crate) fn worker_arguments(&self) -> Vec<String> {
        self.interfaces
            .iter()
            .flat_map(|interface| [String::from("-i"), interface.clone()])
            .chain(self.worker_args.iter().cloned())
            .collect()
    }
}
