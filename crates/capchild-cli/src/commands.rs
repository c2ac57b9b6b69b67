//! Subcommand implementations.

use std::io::Write;
use std::time::{Duration, Instant};

use capchild::{
    CaptureEvents, OneShotRunner, QueryCommand, SessionOptions, SessionState, StatsChannel,
    capture_spec, start_session,
};
use capchild_config::Config;
use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info};

use crate::cli::{CaptureArgs, Command};
use crate::errors::AppError;
use crate::output::{CaptureRecord, Printer, StatsRecord};

const COMMAND_TARGET: &str = "capctl::commands";

/// Runs `command` against the worker configured in `config`.
pub(crate) fn execute<W: Write>(
    command: &Command,
    config: &Config,
    printer: &mut Printer<'_, W>,
) -> Result<(), AppError> {
    match command {
        Command::Interfaces => query(config, "interfaces", &QueryCommand::ListInterfaces, printer),
        Command::Capabilities {
            interface,
            monitor_mode,
            auth,
        } => query(
            config,
            "capabilities",
            &QueryCommand::InterfaceCapabilities {
                interface: interface.clone(),
                monitor_mode: *monitor_mode,
                auth: auth.clone(),
            },
            printer,
        ),
        Command::Channel {
            interface,
            frequency,
            channel_type,
            center_freq1,
            center_freq2,
        } => query(
            config,
            "channel",
            &QueryCommand::SetChannel {
                interface: interface.clone(),
                frequency: *frequency,
                channel_type: channel_type.clone(),
                center_freq1: *center_freq1,
                center_freq2: *center_freq2,
            },
            printer,
        ),
        Command::Stats {
            samples,
            timeout_ms,
        } => stats(config, *samples, Duration::from_millis(*timeout_ms), printer),
        Command::Capture(args) => capture(config, args, printer),
    }
}

fn query<W: Write>(
    config: &Config,
    label: &str,
    command: &QueryCommand,
    printer: &mut Printer<'_, W>,
) -> Result<(), AppError> {
    let runner = OneShotRunner::new(config.clone());
    let output = runner.query(command, || {})?;
    printer.query_output(label, &output)
}

fn stats<W: Write>(
    config: &Config,
    samples: usize,
    timeout: Duration,
    printer: &mut Printer<'_, W>,
) -> Result<(), AppError> {
    let channel = StatsChannel::open(config, || {})?;
    let mut printed = 0;
    let outcome = loop {
        if printed >= samples {
            break Ok(());
        }
        match channel.updates().recv_timeout(timeout) {
            Ok(sample) => {
                if let Err(error) = printer.record(&StatsRecord::from(sample)) {
                    break Err(error);
                }
                printed += 1;
            }
            Err(RecvTimeoutError::Timeout) => break Err(AppError::StatsTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => break Err(AppError::StatsClosed),
        }
    };
    channel.close()?;
    outcome
}

/// Forwards callbacks from the session's reader thread to the printing
/// thread.
struct ForwardingEvents {
    sender: Sender<CaptureRecord>,
    total: u64,
}

impl ForwardingEvents {
    fn forward(&self, record: CaptureRecord) {
        if self.sender.send(record).is_err() {
            debug!(target: COMMAND_TARGET, "capture printer is gone");
        }
    }
}

impl CaptureEvents for ForwardingEvents {
    fn new_file(&mut self, path: &str) -> bool {
        self.forward(CaptureRecord::NewFile {
            path: path.to_owned(),
        });
        true
    }

    fn new_packets(&mut self, count: u64) {
        self.total = self.total.saturating_add(count);
        self.forward(CaptureRecord::Packets {
            count,
            total: self.total,
        });
    }

    fn drops(&mut self, count: u64, interface: Option<&str>) {
        self.forward(CaptureRecord::Drops {
            count,
            interface: interface.map(str::to_owned),
        });
    }

    fn error(&mut self, primary: &str, secondary: Option<&str>) {
        self.forward(CaptureRecord::Error {
            primary: primary.to_owned(),
            secondary: secondary.map(str::to_owned),
        });
    }

    fn cfilter_error(&mut self, index: u32, message: &str) {
        self.forward(CaptureRecord::CfilterError {
            index,
            message: message.to_owned(),
        });
    }

    fn closed(&mut self, diagnostic: Option<&str>) {
        self.forward(CaptureRecord::Closed {
            diagnostic: diagnostic.map(str::to_owned),
        });
    }
}

fn capture<W: Write>(
    config: &Config,
    args: &CaptureArgs,
    printer: &mut Printer<'_, W>,
) -> Result<(), AppError> {
    let (sender, records) = unbounded();
    let events = ForwardingEvents { sender, total: 0 };
    let session = start_session(
        capture_spec(config, args.worker_arguments()),
        events,
        &SessionOptions::from_config(config),
        || {},
    )?;
    info!(target: COMMAND_TARGET, pid = session.pid().as_u32(), "capture running");

    let deadline = args
        .duration_secs
        .and_then(|secs| Instant::now().checked_add(Duration::from_secs(secs)));
    let mut printed = Ok(());
    loop {
        match records.recv_timeout(config.poll_interval()) {
            Ok(record) => {
                let closed = matches!(record, CaptureRecord::Closed { .. });
                if printed.is_ok() {
                    printed = printer.record(&record);
                }
                let limit_reached = args
                    .packet_limit
                    .is_some_and(|limit| session.packets() >= limit);
                if printed.is_err() || limit_reached {
                    session.stop();
                }
                if closed {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if deadline.is_some_and(|at| Instant::now() >= at) {
                    session.stop();
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let state = session.wait();
    printed?;
    if state == SessionState::Failed {
        return Err(AppError::CaptureFailed(state));
    }
    Ok(())
}
