//! Error surface for capture-child control.
//!
//! Errors are split by concern: [`LaunchError`] when the worker cannot be
//! created, [`ChannelError`] when an open pipe fails, [`MalformedMessage`] and
//! [`EncodeError`] for protocol framing, and [`SyncError`], the aggregate that
//! session and query callers receive. I/O errors are wrapped in `Arc` to keep
//! the `Result` types small.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use nix::errno::Errno;
use thiserror::Error;

use crate::launcher::ProcessId;
use crate::message::MessageKind;

/// Diagnostic reported when a worker exits without saying anything.
pub const PREMATURE_CLOSE_MESSAGE: &str = "capture worker exited before starting capture";

/// Errors raised while creating a worker process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The executable does not exist.
    #[error("capture worker executable not found: {}", .program.display())]
    NotFound {
        /// Program that was requested.
        program: PathBuf,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The executable exists but may not be run.
    #[error("permission denied running capture worker {}", .program.display())]
    PermissionDenied {
        /// Program that was requested.
        program: PathBuf,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The system ran out of processes, descriptors or memory.
    #[error("insufficient resources to start capture worker {}: {source}", .program.display())]
    ResourceExhausted {
        /// Program that was requested.
        program: PathBuf,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Any other spawn failure.
    #[error("failed to start capture worker {}: {source}", .program.display())]
    Spawn {
        /// Program that was requested.
        program: PathBuf,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// A requested pipe was not handed back by the operating system.
    #[error("capture worker {stream} was requested as a pipe but not captured")]
    MissingStream {
        /// Stream name.
        stream: &'static str,
    },
    /// A pipe was created but could not be configured.
    #[error("failed to prepare capture worker pipe: {source}")]
    Channel {
        /// Underlying channel error.
        #[source]
        source: ChannelError,
    },
}

impl LaunchError {
    pub(crate) fn from_spawn(program: PathBuf, source: io::Error) -> Self {
        let resource_codes = [Errno::EAGAIN, Errno::ENOMEM, Errno::EMFILE, Errno::ENFILE];
        let exhausted = source
            .raw_os_error()
            .is_some_and(|code| resource_codes.iter().any(|errno| *errno as i32 == code));
        let kind = source.kind();
        let shared = Arc::new(source);
        match kind {
            io::ErrorKind::NotFound => Self::NotFound {
                program,
                source: shared,
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                program,
                source: shared,
            },
            io::ErrorKind::OutOfMemory => Self::ResourceExhausted {
                program,
                source: shared,
            },
            _ if exhausted => Self::ResourceExhausted {
                program,
                source: shared,
            },
            _ => Self::Spawn {
                program,
                source: shared,
            },
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NotFound { .. } => {
                Some("Check that the capture worker is installed and the configured path is correct.")
            }
            Self::PermissionDenied { .. } => {
                Some("The capture worker may need additional privileges to capture packets.")
            }
            Self::ResourceExhausted { .. } => {
                Some("Close other programs or captures and try again.")
            }
            Self::Spawn { .. } | Self::MissingStream { .. } | Self::Channel { .. } => None,
        }
    }
}

impl From<ChannelError> for LaunchError {
    fn from(source: ChannelError) -> Self {
        Self::Channel { source }
    }
}

/// Errors raised by an open pipe.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Reading or writing failed.
    #[error("I/O error on capture worker {channel}: {source}")]
    Io {
        /// Channel name (`stdout`, `stderr`, `stdin`, ...).
        channel: &'static str,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The descriptor could not be switched to non-blocking mode.
    #[error("failed to make capture worker {channel} non-blocking: {source}")]
    Configure {
        /// Channel name.
        channel: &'static str,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
}

impl ChannelError {
    pub(crate) fn io(channel: &'static str, source: io::Error) -> Self {
        Self::Io {
            channel,
            source: Arc::new(source),
        }
    }
}

/// A control line that does not follow the message framing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMessage {
    /// The line was empty.
    #[error("empty control message")]
    Empty,
    /// The first byte is not a known message tag.
    #[error("unknown control message tag '{}'", .tag.escape_ascii())]
    UnknownTag {
        /// Offending tag byte.
        tag: u8,
    },
    /// A required field was absent.
    #[error("{kind} message is missing its {field}")]
    MissingField {
        /// Message kind selected by the tag.
        kind: MessageKind,
        /// Name of the absent field.
        field: &'static str,
    },
    /// A numeric field did not hold a decimal number.
    #[error("{kind} message has a non-numeric {field}: '{value}'")]
    InvalidNumber {
        /// Message kind selected by the tag.
        kind: MessageKind,
        /// Name of the numeric field.
        field: &'static str,
        /// Text that failed to parse.
        value: String,
    },
    /// A payload was present on a message kind that carries none.
    #[error("{kind} message carries an unexpected payload")]
    UnexpectedPayload {
        /// Message kind selected by the tag.
        kind: MessageKind,
    },
}

/// A message that cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A field contains a line break.
    #[error("{kind} {field} contains a line break")]
    LineBreak {
        /// Message kind.
        kind: MessageKind,
        /// Offending field.
        field: &'static str,
    },
    /// A field followed by a separator contains NUL.
    #[error("{kind} {field} contains a NUL byte")]
    EmbeddedNul {
        /// Message kind.
        kind: MessageKind,
        /// Offending field.
        field: &'static str,
    },
    /// A field that must carry text is empty.
    #[error("{kind} {field} must not be empty")]
    EmptyField {
        /// Message kind.
        kind: MessageKind,
        /// Offending field.
        field: &'static str,
    },
}

/// A statistics line that is not `NAME<TAB>PACKETS<TAB>DROPS`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatsLineError {
    /// The line has the wrong number of tab-separated fields.
    #[error("expected 3 tab-separated fields, found {found}")]
    FieldCount {
        /// Fields present.
        found: usize,
    },
    /// The interface name is empty.
    #[error("interface name is empty")]
    EmptyInterface,
    /// A counter is not a decimal number.
    #[error("{field} counter is not a number: '{value}'")]
    InvalidCounter {
        /// Counter name.
        field: &'static str,
        /// Raw text.
        value: String,
    },
}

/// Errors registering the process-wide worker hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HookError {
    /// A hook was already installed.
    #[error("the worker pid hook has already been set")]
    AlreadySet,
}

/// Failures reported to callers starting a session or running a query.
///
/// Controllers usually present these as a primary message plus an optional
/// secondary message; see [`SyncError::primary_message`] and
/// [`SyncError::secondary_message`].
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The worker could not be created.
    #[error(transparent)]
    Launch(Arc<LaunchError>),
    /// A pipe failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// The worker exited before confirming it had started.
    #[error("{}", .diagnostic.as_deref().unwrap_or(PREMATURE_CLOSE_MESSAGE))]
    PrematureClose {
        /// Text the worker wrote before exiting, if any.
        diagnostic: Option<String>,
    },
    /// The worker reported an error.
    #[error("{primary}{}", .secondary.as_deref().map(|text| format!(": {text}")).unwrap_or_default())]
    Worker {
        /// Main error text.
        primary: String,
        /// Supplementary detail.
        secondary: Option<String>,
    },
    /// The worker rejected a capture filter.
    #[error("invalid capture filter for interface {index}: {message}")]
    CaptureFilter {
        /// Index of the interface whose filter failed.
        index: u32,
        /// Compiler message.
        message: String,
    },
    /// The worker could not be reaped.
    #[error("failed to reap capture worker {pid}: {source}")]
    Reap {
        /// Worker process id.
        pid: ProcessId,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl From<LaunchError> for SyncError {
    fn from(source: LaunchError) -> Self {
        Self::Launch(Arc::new(source))
    }
}

impl SyncError {
    /// The main message shown to an operator.
    #[must_use]
    pub fn primary_message(&self) -> String {
        match self {
            Self::Worker { primary, .. } => primary.clone(),
            Self::CaptureFilter { index, .. } => {
                format!("invalid capture filter for interface {index}")
            }
            other => other.to_string(),
        }
    }

    /// Supplementary detail, if any.
    #[must_use]
    pub fn secondary_message(&self) -> Option<String> {
        match self {
            Self::Launch(error) => error.hint().map(str::to_owned),
            Self::Worker { secondary, .. } => secondary.clone(),
            Self::CaptureFilter { message, .. } => Some(message.clone()),
            Self::Channel(_) | Self::PrematureClose { .. } | Self::Reap { .. } => None,
        }
    }
}
