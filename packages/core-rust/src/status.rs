//! Call outcome: framework code, business code, and message.
//!
//! Every pipeline stage writes a [`Status`] instead of returning early with a
//! panic or an opaque error, so post-hooks and callers always observe a
//! concrete outcome.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Framework-level error classification.
///
/// The numeric codes are stable and travel in response envelopes, so a
/// server-side failure decoded from the wire maps back onto the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Per-call timeout expired.
    Timeout,
    /// Full-link timeout budget expired.
    FullLinkTimeout,
    /// Could not establish a connection to the endpoint.
    ConnectError,
    /// Request payload or envelope could not be encoded.
    EncodeError,
    /// Response envelope or payload could not be decoded.
    DecodeError,
    /// The selector could not resolve an endpoint.
    RouterError,
    /// I/O failure after the request was handed to the transport.
    NetworkError,
    /// Dispatch was refused because the concurrency limit was reached.
    LimitedError,
    /// The call was abandoned by its caller.
    Cancelled,
    /// A filter pre-hook declined the call.
    FilterRejected,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// Framework return code carried on the wire for this kind.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Timeout => 101,
            Self::FullLinkTimeout => 102,
            Self::ConnectError => 111,
            Self::EncodeError => 121,
            Self::DecodeError => 122,
            Self::RouterError => 131,
            Self::NetworkError => 141,
            Self::LimitedError => 151,
            Self::Cancelled => 161,
            Self::FilterRejected => 171,
            Self::Unknown => 999,
        }
    }

    /// Maps a framework code back to its kind. Unrecognized non-zero codes
    /// are `Unknown`; zero has no kind.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => return None,
            101 => Self::Timeout,
            102 => Self::FullLinkTimeout,
            111 => Self::ConnectError,
            121 => Self::EncodeError,
            122 => Self::DecodeError,
            131 => Self::RouterError,
            141 => Self::NetworkError,
            151 => Self::LimitedError,
            161 => Self::Cancelled,
            171 => Self::FilterRejected,
            _ => Self::Unknown,
        })
    }

    /// Whether this kind is one of the two timeout kinds.
    #[must_use]
    pub const fn is_timeout(self) -> bool {
        matches!(self, Self::Timeout | Self::FullLinkTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::FullLinkTimeout => "full-link timeout",
            Self::ConnectError => "connect error",
            Self::EncodeError => "encode error",
            Self::DecodeError => "decode error",
            Self::RouterError => "router error",
            Self::NetworkError => "network error",
            Self::LimitedError => "limited",
            Self::Cancelled => "cancelled",
            Self::FilterRejected => "filter rejected",
            Self::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Outcome of a call. `OK` iff both codes are zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("ret={framework_code}, func_ret={func_code}, msg={message}")]
pub struct Status {
    framework_code: i32,
    func_code: i32,
    message: String,
}

impl Status {
    /// The success value.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            framework_code: 0,
            func_code: 0,
            message: String::new(),
        }
    }

    /// Builds a status from raw codes, e.g. when decoding a response envelope.
    #[must_use]
    pub fn new(framework_code: i32, func_code: i32, message: impl Into<String>) -> Self {
        Self {
            framework_code,
            func_code,
            message: message.into(),
        }
    }

    /// Builds a framework failure of the given kind.
    #[must_use]
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind.code(), 0, message)
    }

    /// Builds a business (func-level) failure with no framework error.
    #[must_use]
    pub fn from_func(func_code: i32, message: impl Into<String>) -> Self {
        Self::new(0, func_code, message)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.framework_code == 0 && self.func_code == 0
    }

    #[must_use]
    pub fn framework_code(&self) -> i32 {
        self.framework_code
    }

    #[must_use]
    pub fn func_code(&self) -> i32 {
        self.func_code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Framework error kind, or `None` for success and pure business failures.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.framework_code)
    }

    /// Whether the framework code is one of the timeout kinds.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind().is_some_and(ErrorKind::is_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_requires_both_codes_zero() {
        assert!(Status::ok().is_ok());
        assert!(!Status::from_kind(ErrorKind::NetworkError, "io").is_ok());
        assert!(!Status::from_func(7, "business").is_ok());
    }

    #[test]
    fn kind_round_trips_through_code() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::FullLinkTimeout,
            ErrorKind::ConnectError,
            ErrorKind::EncodeError,
            ErrorKind::DecodeError,
            ErrorKind::RouterError,
            ErrorKind::NetworkError,
            ErrorKind::LimitedError,
            ErrorKind::Cancelled,
            ErrorKind::FilterRejected,
            ErrorKind::Unknown,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(-42), Some(ErrorKind::Unknown));
    }

    #[test]
    fn business_failure_has_no_kind() {
        let status = Status::from_func(3, "not found");
        assert_eq!(status.kind(), None);
        assert_eq!(status.func_code(), 3);
    }

    #[test]
    fn display_includes_codes_and_message() {
        let status = Status::from_kind(ErrorKind::Timeout, "deadline");
        assert_eq!(status.to_string(), "ret=101, func_ret=0, msg=deadline");
        assert!(status.is_timeout());
    }
}
