//! Synchronous one-shot queries: interface lists, capabilities and channel
//! changes.
//!
//! A query launches the worker, collects its stdout as the result text and
//! watches its control stream for the outcome. Everything runs on the
//! caller's thread; `progress` is called whenever both pipes are idle.

use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread;

use capchild_config::Config;
use tracing::{debug, info, warn};

use crate::errors::{ChannelError, LaunchError, SyncError};
use crate::launcher::{LaunchSpec, StreamRequest, launch};
use crate::line_reader::{Line, LineRead, LineReader};
use crate::message::Message;

const ONESHOT_TARGET: &str = "capchild::oneshot";
const MAX_LINES_PER_POLL: usize = 256;

/// A request answered by a single worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryCommand {
    /// List capture interfaces.
    ListInterfaces,
    /// Describe what `interface` supports.
    InterfaceCapabilities {
        /// Interface name.
        interface: String,
        /// Query the capabilities of monitor mode.
        monitor_mode: bool,
        /// Remote capture credentials, passed through verbatim.
        auth: Option<String>,
    },
    /// Tune a wireless interface.
    SetChannel {
        /// Interface name.
        interface: String,
        /// Centre frequency in MHz.
        frequency: u32,
        /// Channel type, for example `HT40+`.
        channel_type: Option<String>,
        /// First centre frequency segment. Only sent with a channel type.
        center_freq1: Option<u32>,
        /// Second centre frequency segment. Only sent with `center_freq1`.
        center_freq2: Option<u32>,
    },
    /// Any other arguments, appended verbatim.
    Custom(Vec<OsString>),
}

impl QueryCommand {
    /// Arguments appended after the child-mode prefix.
    #[must_use]
    pub fn args(&self) -> Vec<OsString> {
        match self {
            Self::ListInterfaces => vec!["-D".into(), "-M".into()],
            Self::InterfaceCapabilities {
                interface,
                monitor_mode,
                auth,
            } => {
                let mut args: Vec<OsString> =
                    vec!["-i".into(), interface.into(), "-L".into(), "-M".into()];
                if *monitor_mode {
                    args.push("-I".into());
                }
                if let Some(credentials) = auth {
                    args.push("-A".into());
                    args.push(credentials.into());
                }
                args
            }
            Self::SetChannel {
                interface,
                frequency,
                channel_type,
                center_freq1,
                center_freq2,
            } => vec![
                "-i".into(),
                interface.into(),
                "-k".into(),
                channel_spec(
                    *frequency,
                    channel_type.as_deref(),
                    *center_freq1,
                    *center_freq2,
                )
                .into(),
            ],
            Self::Custom(args) => args.clone(),
        }
    }
}

fn channel_spec(
    frequency: u32,
    channel_type: Option<&str>,
    center_freq1: Option<u32>,
    center_freq2: Option<u32>,
) -> String {
    let mut parts = vec![frequency.to_string()];
    if let Some(kind) = channel_type {
        parts.push(kind.to_owned());
        if let Some(first) = center_freq1 {
            parts.push(first.to_string());
            if let Some(second) = center_freq2 {
                parts.push(second.to_string());
            }
        }
    }
    parts.join(",")
}

/// Runs one-shot queries against the configured worker.
#[derive(Debug, Clone)]
pub struct OneShotRunner {
    config: Config,
}

impl OneShotRunner {
    /// Runner using the worker path, child-mode arguments and limits from
    /// `config`.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    /// Configuration used for every query.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Runs `command` and returns the worker's stdout.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] when the worker cannot be launched, reports an
    /// error, exits unsuccessfully without reporting success, or cannot be
    /// reaped.
    pub fn query<P: FnMut()>(
        &self,
        command: &QueryCommand,
        mut progress: P,
    ) -> Result<String, SyncError> {
        let spec = LaunchSpec::new(self.config.worker_path().as_std_path())
            .args(self.config.child_mode_args().iter().map(String::as_str))
            .args(command.args())
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
        let mut exchange = Exchange::new(
            LineReader::new(output),
            LineReader::new(control),
            self.config.line_limit(),
        );

        while !exchange.is_done() {
            if exchange.poll()? == 0 {
                progress();
                thread::sleep(self.config.poll_interval());
            }
        }

        let status = worker.wait().map_err(|source| SyncError::Reap {
            pid,
            source: Arc::new(source),
        })?;
        debug!(target: ONESHOT_TARGET, pid = pid.as_u32(), ?status, "query worker exited");
        exchange.finish(status)
    }

    /// Lists capture interfaces.
    ///
    /// # Errors
    ///
    /// See [`OneShotRunner::query`].
    pub fn list_interfaces<P: FnMut()>(&self, progress: P) -> Result<String, SyncError> {
        self.query(&QueryCommand::ListInterfaces, progress)
    }

    /// Describes the capabilities of `interface`.
    ///
    /// # Errors
    ///
    /// See [`OneShotRunner::query`].
    pub fn interface_capabilities<P: FnMut()>(
        &self,
        interface: &str,
        monitor_mode: bool,
        auth: Option<&str>,
        progress: P,
    ) -> Result<String, SyncError> {
        let command = QueryCommand::InterfaceCapabilities {
            interface: interface.to_owned(),
            monitor_mode,
            auth: auth.map(str::to_owned),
        };
        self.query(&command, progress)
    }

    /// Tunes a wireless interface.
    ///
    /// # Errors
    ///
    /// See [`OneShotRunner::query`].
    pub fn set_wireless_channel<P: FnMut()>(
        &self,
        interface: &str,
        frequency: u32,
        channel_type: Option<&str>,
        center_freqs: (Option<u32>, Option<u32>),
        progress: P,
    ) -> Result<String, SyncError> {
        let command = QueryCommand::SetChannel {
            interface: interface.to_owned(),
            frequency,
            channel_type: channel_type.map(str::to_owned),
            center_freq1: center_freqs.0,
            center_freq2: center_freqs.1,
        };
        self.query(&command, progress)
    }
}

/// Accumulates one query's output and outcome.
struct Exchange {
    output: LineReader,
    control: LineReader,
    line_limit: usize,
    text: String,
    output_lines: usize,
    partial: Vec<u8>,
    control_continues: bool,
    succeeded: bool,
    failure: Option<SyncError>,
    diagnostics: Vec<String>,
}

impl Exchange {
    fn new(output: LineReader, control: LineReader, line_limit: usize) -> Self {
        Self {
            output,
            control,
            line_limit,
            text: String::new(),
            output_lines: 0,
            partial: Vec::new(),
            control_continues: false,
            succeeded: false,
            failure: None,
            diagnostics: Vec::new(),
        }
    }

    fn is_done(&self) -> bool {
        self.output.is_closed() && self.control.is_closed()
    }

    fn poll(&mut self) -> Result<usize, ChannelError> {
        let mut handled = 0;
        for _ in 0..MAX_LINES_PER_POLL {
            let LineRead::Line(line) = self.output.get_line(self.line_limit)? else {
                break;
            };
            self.push_output(&line);
            handled += 1;
        }
        for _ in 0..MAX_LINES_PER_POLL {
            let LineRead::Line(line) = self.control.get_line(self.line_limit)? else {
                break;
            };
            self.control_line(&line);
            handled += 1;
        }
        Ok(handled)
    }

    /// Pieces of an over-long line are held as bytes until the line ends so
    /// that a character split across pieces decodes intact.
    fn push_output(&mut self, line: &Line) {
        self.partial.extend_from_slice(&line.bytes);
        if !line.truncated {
            self.end_output_line();
        }
    }

    fn end_output_line(&mut self) {
        if self.output_lines > 0 {
            self.text.push('\n');
        }
        self.text.push_str(&String::from_utf8_lossy(&self.partial));
        self.partial.clear();
        self.output_lines += 1;
    }

    fn control_line(&mut self, line: &Line) {
        let continuation = self.control_continues;
        self.control_continues = line.truncated;
        if continuation || line.truncated {
            warn!(
                target: ONESHOT_TARGET,
                bytes = line.bytes.len(),
                "over-long control line from query worker"
            );
            self.diagnostics.push(line.text().into_owned());
            return;
        }
        match Message::decode(&line.bytes) {
            Ok(Message::Success) => self.succeeded = true,
            Ok(Message::Error { primary, secondary }) => {
                self.fail(SyncError::Worker { primary, secondary });
            }
            Ok(Message::BadFilter { message }) => self.fail(SyncError::Worker {
                primary: message,
                secondary: None,
            }),
            Ok(other) => debug!(
                target: ONESHOT_TARGET,
                kind = %other.kind(),
                "ignoring control message during query"
            ),
            Err(error) => {
                warn!(
                    target: ONESHOT_TARGET,
                    error = %error,
                    "malformed control line from query worker"
                );
                self.diagnostics.push(line.text().into_owned());
            }
        }
    }

    fn fail(&mut self, error: SyncError) {
        info!(target: ONESHOT_TARGET, error = %error, "query worker reported failure");
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn finish(mut self, status: ExitStatus) -> Result<String, SyncError> {
        if !self.partial.is_empty() {
            self.end_output_line();
        }
        if let Some(failure) = self.failure {
            return Err(failure);
        }
        if self.succeeded || status.success() {
            return Ok(self.text);
        }
        let diagnostics = self.diagnostics.join("\n");
        Err(SyncError::Worker {
            primary: describe_exit(status),
            secondary: (!diagnostics.is_empty()).then_some(diagnostics),
        })
    }
}

fn describe_exit(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("capture worker exited with status {code}"),
        (None, Some(signal)) => format!("capture worker was killed by signal {signal}"),
        (None, None) => String::from("capture worker exited abnormally"),
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;
    use crate::tests::support::shell_config;

    fn runner(script: &str) -> OneShotRunner {
        OneShotRunner::new(shell_config(script))
    }

    #[fixture]
    fn capabilities() -> QueryCommand {
        QueryCommand::InterfaceCapabilities {
            interface: String::from("wlan0"),
            monitor_mode: true,
            auth: Some(String::from("rpcap:user:secret")),
        }
    }

    #[rstest]
    fn list_interfaces_uses_the_listing_flags() {
        assert_eq!(QueryCommand::ListInterfaces.args(), ["-D", "-M"]);
    }

    #[rstest]
    fn capability_query_adds_monitor_and_auth(capabilities: QueryCommand) {
        assert_eq!(
            capabilities.args(),
            ["-i", "wlan0", "-L", "-M", "-I", "-A", "rpcap:user:secret"]
        );
    }

    #[rstest]
    #[case(None, None, None, "2412")]
    #[case(Some("HT20"), None, None, "2412,HT20")]
    #[case(Some("VHT80"), Some(5210), None, "2412,VHT80,5210")]
    #[case(Some("VHT80+80"), Some(5210), Some(5530), "2412,VHT80+80,5210,5530")]
    #[case(None, Some(5210), Some(5530), "2412")]
    fn channel_spec_nests_optional_parts(
        #[case] channel_type: Option<&str>,
        #[case] first: Option<u32>,
        #[case] second: Option<u32>,
        #[case] expected: &str,
    ) {
        assert_eq!(channel_spec(2412, channel_type, first, second), expected);
    }

    #[rstest]
    fn success_returns_stdout_verbatim() {
        let result = runner("printf '1. eth0\\n2. lo\\n'; printf 'S\\n' >&2; exit 3")
            .list_interfaces(|| {})
            .expect("query should succeed");

        assert_eq!(result, "1. eth0\n2. lo");
    }

    #[rstest]
    #[case::split_character("printf 'abc\\303\\251\\n'", "abc\u{e9}")]
    #[case::several_pieces("printf 'abcdefghij\\nxy\\n'", "abcdefghij\nxy")]
    fn over_long_output_lines_are_rejoined(#[case] output: &str, #[case] expected: &str) {
        let config = Config {
            line_limit: 4,
            ..shell_config(&format!("{output}; printf 'S\\n' >&2"))
        };

        let result = OneShotRunner::new(config)
            .list_interfaces(|| {})
            .expect("query should succeed");

        assert_eq!(result, expected);
    }

    #[rstest]
    fn arguments_follow_the_child_mode_prefix() {
        let result = runner(r#"printf '%s ' "$@"; printf 'S\n' >&2"#)
            .interface_capabilities("eth0", false, None, || {})
            .expect("query should succeed");

        assert_eq!(result, "-i eth0 -L -M ");
    }

    #[rstest]
    fn clean_exit_without_success_still_succeeds() {
        let result = runner("printf 'ok\\n'").query(&QueryCommand::Custom(Vec::new()), || {});

        assert_eq!(result.expect("query should succeed"), "ok");
    }

    #[rstest]
    fn error_message_fails_the_query() {
        let error = runner("printf 'Eno such device\\000wlan9\\n' >&2")
            .set_wireless_channel("wlan9", 2412, None, (None, None), || {})
            .expect_err("query should fail");

        assert_eq!(error.primary_message(), "no such device");
        assert_eq!(error.secondary_message().as_deref(), Some("wlan9"));
    }

    #[rstest]
    fn bad_filter_fails_the_query() {
        let error = runner("printf 'Bunknown field\\n' >&2; printf 'S\\n' >&2")
            .list_interfaces(|| {})
            .expect_err("query should fail");

        assert!(matches!(
            error,
            SyncError::Worker { ref primary, secondary: None } if primary == "unknown field"
        ));
    }

    #[rstest]
    fn failing_exit_reports_status_and_diagnostics() {
        let error = runner("printf 'permission denied\\n' >&2; exit 2")
            .list_interfaces(|| {})
            .expect_err("query should fail");

        assert_eq!(error.primary_message(), "capture worker exited with status 2");
        assert_eq!(
            error.secondary_message().as_deref(),
            Some("permission denied")
        );
    }

    #[rstest]
    fn progress_runs_while_the_worker_is_quiet() {
        let mut polls = 0;

        runner("sleep 0.1; printf 'S\\n' >&2")
            .list_interfaces(|| polls += 1)
            .expect("query should succeed");

        assert!(polls > 0);
    }

    #[rstest]
    fn missing_worker_is_a_launch_error() {
        let config = Config {
            worker_path: camino::Utf8PathBuf::from("/nonexistent/dumpcap"),
            ..Config::default()
        };

        let error = OneShotRunner::new(config)
            .list_interfaces(|| {})
            .expect_err("launch should fail");

        assert!(matches!(error, SyncError::Launch(_)));
    }
}
