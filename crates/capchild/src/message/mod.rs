//! Control-line framing between a capture worker and its controller.
//!
//! Every control line carries one message. The first byte is a tag naming the
//! message kind; sub-fields are separated by NUL. Text fields are decoded
//! lossily as UTF-8, numeric fields must be plain ASCII decimal.
//!
//! | Tag | Kind | Payload |
//! |-----|------|---------|
//! | `F` | new file | path |
//! | `P` | packet count | count |
//! | `D` | drops | count, optionally NUL and interface name |
//! | `E` | error | primary, optionally NUL and secondary |
//! | `C` | capture filter error | interface index, NUL, message |
//! | `S` | success | none |
//! | `B` | bad filter | message |
//! | `Z` | closed | optional diagnostic |

use std::fmt;
use std::str::FromStr;

use crate::errors::{EncodeError, MalformedMessage};

const FIELD_SEPARATOR: u8 = 0;

/// Message kinds, one per tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `F`: the worker started writing a capture file.
    NewFile,
    /// `P`: packets were captured since the previous count.
    PacketCount,
    /// `D`: the worker's drop counter.
    Drops,
    /// `E`: the worker hit an error.
    Error,
    /// `C`: a capture filter failed to compile.
    CFilterError,
    /// `S`: a request completed.
    Success,
    /// `B`: a filter was rejected.
    BadFilter,
    /// `Z`: the worker is about to exit.
    Closed,
}

impl MessageKind {
    /// Every kind, in tag order of the table above.
    pub const ALL: [Self; 8] = [
        Self::NewFile,
        Self::PacketCount,
        Self::Drops,
        Self::Error,
        Self::CFilterError,
        Self::Success,
        Self::BadFilter,
        Self::Closed,
    ];

    /// The tag byte identifying this kind on the wire.
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::NewFile => b'F',
            Self::PacketCount => b'P',
            Self::Drops => b'D',
            Self::Error => b'E',
            Self::CFilterError => b'C',
            Self::Success => b'S',
            Self::BadFilter => b'B',
            Self::Closed => b'Z',
        }
    }

    /// Looks up the kind for a tag byte.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'F' => Some(Self::NewFile),
            b'P' => Some(Self::PacketCount),
            b'D' => Some(Self::Drops),
            b'E' => Some(Self::Error),
            b'C' => Some(Self::CFilterError),
            b'S' => Some(Self::Success),
            b'B' => Some(Self::BadFilter),
            b'Z' => Some(Self::Closed),
            _ => None,
        }
    }

    /// Stable name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewFile => "new_file",
            Self::PacketCount => "packet_count",
            Self::Drops => "drops",
            Self::Error => "error",
            Self::CFilterError => "cfilter_error",
            Self::Success => "success",
            Self::BadFilter => "bad_filter",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// The worker opened a new capture file.
    NewFile {
        /// Path of the file.
        path: String,
    },
    /// Packets captured since the previous report.
    PacketCount {
        /// Packet count delta.
        count: u64,
    },
    /// Current drop counter.
    Drops {
        /// Packets dropped.
        count: u64,
        /// Interface the drops were seen on, when the worker names it.
        interface: Option<String>,
    },
    /// The worker reported an error.
    Error {
        /// Main error text.
        primary: String,
        /// Supplementary detail.
        secondary: Option<String>,
    },
    /// A capture filter failed to compile.
    CFilterError {
        /// Index of the interface whose filter failed.
        index: u32,
        /// Filter compiler message.
        message: String,
    },
    /// The request completed.
    Success,
    /// A filter was rejected.
    BadFilter {
        /// Explanation from the worker.
        message: String,
    },
    /// The worker is about to exit.
    Closed {
        /// Final diagnostic, if any.
        diagnostic: Option<String>,
    },
}

impl Message {
    /// The kind of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::NewFile { .. } => MessageKind::NewFile,
            Self::PacketCount { .. } => MessageKind::PacketCount,
            Self::Drops { .. } => MessageKind::Drops,
            Self::Error { .. } => MessageKind::Error,
            Self::CFilterError { .. } => MessageKind::CFilterError,
            Self::Success => MessageKind::Success,
            Self::BadFilter { .. } => MessageKind::BadFilter,
            Self::Closed { .. } => MessageKind::Closed,
        }
    }

    /// Decodes one control line, without its terminator.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`] describing the first framing violation.
    pub fn decode(line: &[u8]) -> Result<Self, MalformedMessage> {
        let Some((&tag, payload)) = line.split_first() else {
            return Err(MalformedMessage::Empty);
        };
        let kind = MessageKind::from_tag(tag).ok_or(MalformedMessage::UnknownTag { tag })?;
        match kind {
            MessageKind::NewFile => {
                if payload.is_empty() {
                    return Err(MalformedMessage::MissingField {
                        kind,
                        field: "path",
                    });
                }
                Ok(Self::NewFile {
                    path: text(payload),
                })
            }
            MessageKind::PacketCount => Ok(Self::PacketCount {
                count: number(kind, "count", payload)?,
            }),
            MessageKind::Drops => {
                let (count, interface) = split_field(payload);
                Ok(Self::Drops {
                    count: number(kind, "count", count)?,
                    interface: interface.and_then(optional_text),
                })
            }
            MessageKind::Error => {
                let (primary, secondary) = split_field(payload);
                if primary.is_empty() {
                    return Err(MalformedMessage::MissingField {
                        kind,
                        field: "primary message",
                    });
                }
                Ok(Self::Error {
                    primary: text(primary),
                    secondary: secondary.and_then(optional_text),
                })
            }
            MessageKind::CFilterError => {
                let (index, rest) = split_field(payload);
                let Some(message) = rest else {
                    return Err(MalformedMessage::MissingField {
                        kind,
                        field: "message",
                    });
                };
                Ok(Self::CFilterError {
                    index: number(kind, "index", index)?,
                    message: text(message),
                })
            }
            MessageKind::Success => {
                if payload.is_empty() {
                    Ok(Self::Success)
                } else {
                    Err(MalformedMessage::UnexpectedPayload { kind })
                }
            }
            MessageKind::BadFilter => Ok(Self::BadFilter {
                message: text(payload),
            }),
            MessageKind::Closed => Ok(Self::Closed {
                diagnostic: optional_text(payload),
            }),
        }
    }

    /// Encodes the message without a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] when a field cannot be framed: it contains a
    /// line break, a NUL ahead of another field, or is empty where text is
    /// required. Optional fields must be `None` rather than empty.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let kind = self.kind();
        let mut out = vec![kind.tag()];
        match self {
            Self::NewFile { path } => {
                required(kind, "path", path)?;
                field(kind, "path", path, false, &mut out)?;
            }
            Self::PacketCount { count } => out.extend_from_slice(count.to_string().as_bytes()),
            Self::Drops { count, interface } => {
                out.extend_from_slice(count.to_string().as_bytes());
                if let Some(name) = interface {
                    required(kind, "interface", name)?;
                    out.push(FIELD_SEPARATOR);
                    field(kind, "interface", name, false, &mut out)?;
                }
            }
            Self::Error { primary, secondary } => {
                required(kind, "primary message", primary)?;
                field(kind, "primary message", primary, true, &mut out)?;
                if let Some(detail) = secondary {
                    required(kind, "secondary message", detail)?;
                    out.push(FIELD_SEPARATOR);
                    field(kind, "secondary message", detail, false, &mut out)?;
                }
            }
            Self::CFilterError { index, message } => {
                out.extend_from_slice(index.to_string().as_bytes());
                out.push(FIELD_SEPARATOR);
                field(kind, "message", message, false, &mut out)?;
            }
            Self::Success => {}
            Self::BadFilter { message } => field(kind, "message", message, false, &mut out)?,
            Self::Closed { diagnostic } => {
                if let Some(detail) = diagnostic {
                    required(kind, "diagnostic", detail)?;
                    field(kind, "diagnostic", detail, false, &mut out)?;
                }
            }
        }
        Ok(out)
    }

    /// Encodes the message followed by a newline.
    ///
    /// # Errors
    ///
    /// As [`Message::encode`].
    pub fn encode_line(&self) -> Result<Vec<u8>, EncodeError> {
        let mut line = self.encode()?;
        line.push(b'\n');
        Ok(line)
    }
}

fn split_field(payload: &[u8]) -> (&[u8], Option<&[u8]>) {
    match payload.iter().position(|byte| *byte == FIELD_SEPARATOR) {
        Some(at) => {
            let (head, tail) = payload.split_at(at);
            (head, tail.get(1..))
        }
        None => (payload, None),
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn optional_text(bytes: &[u8]) -> Option<String> {
    (!bytes.is_empty()).then(|| text(bytes))
}

fn number<T: FromStr>(
    kind: MessageKind,
    field: &'static str,
    bytes: &[u8],
) -> Result<T, MalformedMessage> {
    let invalid = || MalformedMessage::InvalidNumber {
        kind,
        field,
        value: text(bytes),
    };
    if bytes.is_empty() {
        return Err(MalformedMessage::MissingField { kind, field });
    }
    if !bytes.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(invalid)
}

const fn required(kind: MessageKind, name: &'static str, value: &str) -> Result<(), EncodeError> {
    if value.is_empty() {
        Err(EncodeError::EmptyField { kind, field: name })
    } else {
        Ok(())
    }
}

fn field(
    kind: MessageKind,
    name: &'static str,
    value: &str,
    delimited: bool,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    if value.contains(['\n', '\r']) {
        return Err(EncodeError::LineBreak { kind, field: name });
    }
    if delimited && value.contains('\0') {
        return Err(EncodeError::EmbeddedNul { kind, field: name });
    }
    out.extend_from_slice(value.as_bytes());
    Ok(())
}
