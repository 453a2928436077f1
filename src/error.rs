//! Errors returned by the [`Master`](crate::Master) operations.

use std::io;

use snafu::Snafu;

use crate::frame::{DecodeError, EncodeError};
use crate::types;

/// How a station rejected a well-formed request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// UNI-TE response code 0xFD, the station couldn't carry out the request.
    RequestFailed,
    /// X-WAY type 0x22, the message was refused before reaching UNI-TE.
    Refused,
    /// An I/O channel request answered with this non-zero report.
    ChannelReport(u8),
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// The transport failed to send or receive.
    #[snafu(display("Transport error: {}", source))]
    Transport { source: io::Error },
    /// The connection was closed or reset during a transaction.
    #[snafu(display("Link lost: {}", source))]
    LinkLost { source: io::Error },
    /// No response after `attempts` sends.
    #[snafu(display("No response after {} attempts", attempts))]
    Timeout { attempts: u8 },
    /// Every attempt ended in corrupt or partial data, `source` is the last.
    #[snafu(display("Protocol error after {} attempts: {}", attempts, source))]
    Protocol { attempts: u8, source: DecodeError },
    #[snafu(display("Rejected by station: {:?}", rejection))]
    RejectedByStation { rejection: Rejection },
    /// The response decoded but doesn't match the request.
    #[snafu(display("Unexpected response: {}", reason))]
    UnexpectedResponseShape { reason: String },
    #[snafu(display("Payload of {} bytes exceeds the maximum of {}", len, max))]
    PayloadTooLarge { len: usize, max: usize },
    #[snafu(display("Invalid argument: {}", reason))]
    InvalidArgument { reason: String },
}

impl Error {
    /// True for failures of the link rather than of the controller.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. }
                | Error::LinkLost { .. }
                | Error::Timeout { .. }
                | Error::Protocol { .. }
        )
    }

    /// True if the controller answered but didn't do what was asked.
    pub fn is_station_failure(&self) -> bool {
        matches!(
            self,
            Error::RejectedByStation { .. } | Error::UnexpectedResponseShape { .. }
        )
    }
}

impl From<EncodeError> for Error {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::PayloadTooLarge { len, max } => Error::PayloadTooLarge { len, max },
        }
    }
}

impl From<types::Error> for Error {
    fn from(err: types::Error) -> Self {
        Error::InvalidArgument {
            reason: err.to_string(),
        }
    }
}

pub(crate) fn unexpected(reason: impl Into<String>) -> Error {
    Error::UnexpectedResponseShape {
        reason: reason.into(),
    }
}

pub(crate) fn invalid_argument(reason: impl Into<String>) -> Error {
    Error::InvalidArgument {
        reason: reason.into(),
    }
}
