//! Rendering command results as text or JSON lines.

use std::fmt;
use std::io::Write;

use capchild::InterfaceStats;
use serde::Serialize;

use crate::cli::OutputFormat;
use crate::errors::AppError;

/// One event from a running capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub(crate) enum CaptureRecord {
    NewFile {
        path: String,
    },
    Packets {
        count: u64,
        total: u64,
    },
    Drops {
        count: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        interface: Option<String>,
    },
    Error {
        primary: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        secondary: Option<String>,
    },
    CfilterError {
        index: u32,
        message: String,
    },
    Closed {
        #[serde(skip_serializing_if = "Option::is_none")]
        diagnostic: Option<String>,
    },
}

impl fmt::Display for CaptureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewFile { path } => write!(f, "file {path}"),
            Self::Packets { count, total } => write!(f, "packets +{count} ({total} total)"),
            Self::Drops { count, interface } => match interface {
                Some(name) => write!(f, "drops {count} on {name}"),
                None => write!(f, "drops {count}"),
            },
            Self::Error { primary, secondary } => match secondary {
                Some(detail) => write!(f, "error: {primary}: {detail}"),
                None => write!(f, "error: {primary}"),
            },
            Self::CfilterError { index, message } => {
                write!(f, "capture filter error on interface {index}: {message}")
            }
            Self::Closed { diagnostic } => match diagnostic {
                Some(text) => write!(f, "closed: {text}"),
                None => f.write_str("closed"),
            },
        }
    }
}

/// A statistics sample as printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct StatsRecord {
    interface: String,
    packets: u64,
    drops: u64,
}

impl From<InterfaceStats> for StatsRecord {
    fn from(sample: InterfaceStats) -> Self {
        Self {
            interface: sample.interface,
            packets: sample.packets,
            drops: sample.drops,
        }
    }
}

impl fmt::Display for StatsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} packets, {} dropped",
            self.interface, self.packets, self.drops
        )
    }
}

#[derive(Serialize)]
struct QueryRecord<'a> {
    command: &'a str,
    output: &'a str,
}

/// Writes records to stdout in the selected format.
pub(crate) struct Printer<'a, W: Write> {
    out: &'a mut W,
    format: OutputFormat,
}

impl<'a, W: Write> Printer<'a, W> {
    pub(crate) const fn new(out: &'a mut W, format: OutputFormat) -> Self {
        Self { out, format }
    }

    /// Writes the text returned by a one-shot query.
    pub(crate) fn query_output(&mut self, command: &str, output: &str) -> Result<(), AppError> {
        match self.format {
            OutputFormat::Human => {
                if !output.is_empty() {
                    writeln!(self.out, "{output}")?;
                }
            }
            OutputFormat::Json => self.json(&QueryRecord { command, output })?,
        }
        self.out.flush()?;
        Ok(())
    }

    /// Writes one record, flushing so that events appear as they happen.
    pub(crate) fn record<T: Serialize + fmt::Display>(&mut self, record: &T) -> Result<(), AppError> {
        match self.format {
            OutputFormat::Human => writeln!(self.out, "{record}")?,
            OutputFormat::Json => self.json(record)?,
        }
        self.out.flush()?;
        Ok(())
    }

    fn json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), AppError> {
        serde_json::to_writer(&mut *self.out, value)?;
        writeln!(self.out)?;
        Ok(())
    }
}
