//! Long-lived per-interface statistics worker.
//!
//! The worker runs in statistics mode (`-S`) and prints one line per
//! interface at a fixed cadence: `NAME<TAB>PACKETS<TAB>DROPS`. A reader
//! thread parses those lines and publishes them on a channel.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use capchild_config::Config;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use nix::sys::signal::Signal;
use tracing::{debug, info, warn};

use crate::errors::{ChannelError, LaunchError, StatsLineError, SyncError};
use crate::launcher::{LaunchSpec, ProcessId, StreamRequest, WorkerProcess, launch};
use crate::line_reader::{LineRead, LineReader};
use crate::message::Message;

const STATS_TARGET: &str = "capchild::stats";
const MAX_LINES_PER_POLL: usize = 256;

/// Samples held for a consumer that falls behind. Older samples are dropped
/// first.
pub const STATS_QUEUE_DEPTH: usize = 64;

/// Arguments selecting statistics mode.
pub const STATS_ARGS: [&str; 2] = ["-S", "-M"];

/// One statistics sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceStats {
    /// Interface name.
    pub interface: String,
    /// Packets received since the worker started.
    pub packets: u64,
    /// Packets dropped since the worker started.
    pub drops: u64,
}

impl FromStr for InterfaceStats {
    type Err = StatsLineError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split('\t').collect();
        let [interface, packets, drops] = fields.as_slice() else {
            return Err(StatsLineError::FieldCount {
                found: fields.len(),
            });
        };
        if interface.is_empty() {
            return Err(StatsLineError::EmptyInterface);
        }
        Ok(Self {
            interface: (*interface).to_owned(),
            packets: counter("packets", packets)?,
            drops: counter("drops", drops)?,
        })
    }
}

fn counter(field: &'static str, value: &str) -> Result<u64, StatsLineError> {
    let invalid = || StatsLineError::InvalidCounter {
        field,
        value: value.to_owned(),
    };
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(invalid());
    }
    value.parse().map_err(|_| invalid())
}

/// A running statistics worker and its reader thread.
#[derive(Debug)]
pub struct StatsChannel {
    worker: WorkerProcess,
    updates: Receiver<InterfaceStats>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl StatsChannel {
    /// Starts the statistics worker and waits until it reports success.
    ///
    /// `progress` runs on every idle poll while waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the worker cannot be launched, reports an
    /// error, or exits before confirming. The worker is killed first.
    pub fn open<P: FnMut()>(config: &Config, mut progress: P) -> Result<Self, SyncError> {
        let spec = LaunchSpec::new(config.worker_path().as_std_path())
            .args(config.child_mode_args().iter().map(String::as_str))
            .args(STATS_ARGS)
            .stdout(StreamRequest::Pipe)
            .stderr(StreamRequest::Pipe);
        let mut worker = launch(&spec)?;
        let pid = worker.pid();
        let output = worker
            .take_stdout()
            .ok_or(LaunchError::MissingStream { stream: "stdout" })?;
        let control = worker
            .take_stderr()
            .ok_or(LaunchError::MissingStream { stream: "stderr" })?;
        let (sender, updates) = bounded(STATS_QUEUE_DEPTH);
        let mut pump = StatsPump {
            output: LineReader::new(output),
            control: LineReader::new(control),
            sender,
            backlog: updates.clone(),
            line_limit: config.line_limit(),
            pid,
        };

        pump.await_success(config.poll_interval(), &mut progress)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let poll_interval = config.poll_interval();
        let program = worker.program().to_path_buf();
        let reader = thread::Builder::new()
            .name(format!("capchild-stats-{pid}"))
            .spawn(move || pump.run(&thread_stop, poll_interval))
            .map_err(|source| LaunchError::from_spawn(program, source))?;
        info!(target: STATS_TARGET, pid = pid.as_u32(), "statistics channel open");

        Ok(Self {
            worker,
            updates,
            stop,
            reader: Some(reader),
        })
    }

    /// Worker process id.
    #[must_use]
    pub const fn pid(&self) -> ProcessId {
        self.worker.pid()
    }

    /// Receiver of parsed samples, in the order the worker wrote them.
    ///
    /// At most [`STATS_QUEUE_DEPTH`] samples wait here; when the queue is
    /// full the oldest is discarded.
    #[must_use]
    pub const fn updates(&self) -> &Receiver<InterfaceStats> {
        &self.updates
    }

    /// Drains pending samples and returns the latest one per interface,
    /// sorted by interface name.
    #[must_use]
    pub fn try_latest(&self) -> Vec<InterfaceStats> {
        let mut latest = BTreeMap::new();
        for sample in self.updates.try_iter() {
            latest.insert(sample.interface.clone(), sample);
        }
        latest.into_values().collect()
    }

    /// Kills the worker and joins the reader thread.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Reap`] when the worker cannot be reaped.
    pub fn close(mut self) -> Result<(), SyncError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), SyncError> {
        self.stop.store(true, Ordering::Release);
        let pid = self.worker.pid();
        let reaped = if self.worker.is_alive() {
            self.worker.handle().signal(Signal::SIGKILL);
            self.worker.wait().map(drop).map_err(|source| SyncError::Reap {
                pid,
                source: Arc::new(source),
            })
        } else {
            Ok(())
        };
        if let Some(reader) = self.reader.take()
            && reader.join().is_err()
        {
            warn!(target: STATS_TARGET, pid = pid.as_u32(), "statistics reader thread panicked");
        }
        info!(target: STATS_TARGET, pid = pid.as_u32(), "statistics channel closed");
        reaped
    }
}

impl Drop for StatsChannel {
    fn drop(&mut self) {
        if self.reader.is_some()
            && let Err(error) = self.shutdown()
        {
            warn!(target: STATS_TARGET, error = %error, "statistics worker was not reaped");
        }
    }
}

/// Reads both worker streams; moves to the reader thread once started.
struct StatsPump {
    output: LineReader,
    control: LineReader,
    sender: Sender<InterfaceStats>,
    backlog: Receiver<InterfaceStats>,
    line_limit: usize,
    pid: ProcessId,
}

/// What a control line meant before the worker confirmed start-up.
enum StartSignal {
    Success,
    Failure(SyncError),
    Ignored,
}

impl StatsPump {
    fn await_success<P: FnMut()>(
        &mut self,
        poll_interval: Duration,
        progress: &mut P,
    ) -> Result<(), SyncError> {
        let mut diagnostics = Vec::new();
        loop {
            let published = self.publish_output()?;
            match self.control.get_line(self.line_limit)? {
                LineRead::Line(line) => match start_signal(&line.bytes) {
                    StartSignal::Success => return Ok(()),
                    StartSignal::Failure(error) => return Err(error),
                    StartSignal::Ignored => diagnostics.push(line.text().into_owned()),
                },
                LineRead::Incomplete => {
                    if published == 0 {
                        progress();
                        thread::sleep(poll_interval);
                    }
                }
                LineRead::Closed => {
                    let text = diagnostics.join("\n");
                    return Err(SyncError::PrematureClose {
                        diagnostic: (!text.is_empty()).then_some(text),
                    });
                }
            }
        }
    }

    fn run(mut self, stop: &AtomicBool, poll_interval: Duration) {
        debug!(target: STATS_TARGET, pid = self.pid.as_u32(), "statistics reader started");
        while !stop.load(Ordering::Acquire)
            && !(self.output.is_closed() && self.control.is_closed())
        {
            match self.poll() {
                Ok(0) => thread::sleep(poll_interval),
                Ok(_) => {}
                Err(error) => {
                    warn!(
                        target: STATS_TARGET,
                        pid = self.pid.as_u32(),
                        error = %error,
                        "statistics pipe failed"
                    );
                    break;
                }
            }
        }
        debug!(target: STATS_TARGET, pid = self.pid.as_u32(), "statistics reader finished");
    }

    fn poll(&mut self) -> Result<usize, ChannelError> {
        let published = self.publish_output()?;
        let mut drained = 0;
        for _ in 0..MAX_LINES_PER_POLL {
            let LineRead::Line(line) = self.control.get_line(self.line_limit)? else {
                break;
            };
            drained += 1;
            match Message::decode(&line.bytes) {
                Ok(message) => debug!(
                    target: STATS_TARGET,
                    pid = self.pid.as_u32(),
                    kind = %message.kind(),
                    "control message from statistics worker"
                ),
                Err(_) => debug!(
                    target: STATS_TARGET,
                    pid = self.pid.as_u32(),
                    text = %line.text(),
                    "statistics worker diagnostic"
                ),
            }
        }
        Ok(published + drained)
    }

    fn publish_output(&mut self) -> Result<usize, ChannelError> {
        let mut handled = 0;
        for _ in 0..MAX_LINES_PER_POLL {
            let LineRead::Line(line) = self.output.get_line(self.line_limit)? else {
                break;
            };
            handled += 1;
            if line.truncated {
                warn!(
                    target: STATS_TARGET,
                    bytes = line.bytes.len(),
                    "skipping over-long statistics line"
                );
                continue;
            }
            match line.text().parse::<InterfaceStats>() {
                Ok(sample) => self.publish(sample),
                Err(error) => warn!(
                    target: STATS_TARGET,
                    error = %error,
                    line = %line.text(),
                    "skipping malformed statistics line"
                ),
            }
        }
        Ok(handled)
    }

    fn publish(&self, sample: InterfaceStats) {
        let Err(TrySendError::Full(sample)) = self.sender.try_send(sample) else {
            return;
        };
        drop(self.backlog.try_recv());
        if self.sender.try_send(sample).is_err() {
            debug!(target: STATS_TARGET, pid = self.pid.as_u32(), "statistics sample dropped");
        }
    }
}

fn start_signal(line: &[u8]) -> StartSignal {
    match Message::decode(line) {
        Ok(Message::Success) => StartSignal::Success,
        Ok(Message::Error { primary, secondary }) => {
            StartSignal::Failure(SyncError::Worker { primary, secondary })
        }
        Ok(Message::BadFilter { message }) => StartSignal::Failure(SyncError::Worker {
            primary: message,
            secondary: None,
        }),
        Ok(other) => {
            debug!(
                target: STATS_TARGET,
                kind = %other.kind(),
                "ignoring control message before statistics start"
            );
            StartSignal::Ignored
        }
        Err(error) => {
            debug!(
                target: STATS_TARGET,
                error = %error,
                "unparsed control line before statistics start"
            );
            StartSignal::Ignored
        }
    }
}
