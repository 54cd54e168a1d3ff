// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// framing errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// sending errors
    #[error("time out when trying to send data")]
    SendTimeout,

    #[error("the sending queue rejected the data")]
    SendRejected,

    #[error("session {0} is closed")]
    SessionClosed(u64),

    /// resource exhaustion
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    #[error("application error: {0}")]
    Application(String),
}

/// The cause recorded when a session transitions to closed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Unknown = 0,
    ServerShutdown = 1,
    ClientClosing = 2,
    ServerClosing = 3,
    ApplicationError = 4,
    SocketError = 5,
    Timeout = 6,
    ProtocolError = 7,
    InternalError = 8,
}

impl CloseReason {
    pub(crate) fn from_u8(value: u8) -> CloseReason {
        match value {
            1 => CloseReason::ServerShutdown,
            2 => CloseReason::ClientClosing,
            3 => CloseReason::ServerClosing,
            4 => CloseReason::ApplicationError,
            5 => CloseReason::SocketError,
            6 => CloseReason::Timeout,
            7 => CloseReason::ProtocolError,
            8 => CloseReason::InternalError,
            _ => CloseReason::Unknown,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloseReason::Unknown => "Unknown",
            CloseReason::ServerShutdown => "ServerShutdown",
            CloseReason::ClientClosing => "ClientClosing",
            CloseReason::ServerClosing => "ServerClosing",
            CloseReason::ApplicationError => "ApplicationError",
            CloseReason::SocketError => "SocketError",
            CloseReason::Timeout => "Timeout",
            CloseReason::ProtocolError => "ProtocolError",
            CloseReason::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Transport failures the peer causes routinely. These close the session but
/// are not worth an error log line.
pub fn is_ignorable_io_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io;

    #[rstest]
    #[case(CloseReason::Unknown)]
    #[case(CloseReason::ServerShutdown)]
    #[case(CloseReason::ClientClosing)]
    #[case(CloseReason::ServerClosing)]
    #[case(CloseReason::ApplicationError)]
    #[case(CloseReason::SocketError)]
    #[case(CloseReason::Timeout)]
    #[case(CloseReason::ProtocolError)]
    #[case(CloseReason::InternalError)]
    fn test_close_reason_from_u8(#[case] reason: CloseReason) {
        assert_eq!(CloseReason::from_u8(reason as u8), reason);
    }

    #[test]
    fn test_out_of_range_reason_is_unknown() {
        assert_eq!(CloseReason::from_u8(200), CloseReason::Unknown);
    }

    #[test]
    fn test_ignorable_errors() {
        assert!(is_ignorable_io_error(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(is_ignorable_io_error(&io::Error::from(
            io::ErrorKind::BrokenPipe
        )));
        assert!(!is_ignorable_io_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
