use std::fmt;
use std::io;

use http::StatusCode;
use serde_json::Value;

/// Error type for fanout
#[derive(Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    BadHost(String),
    Io(io::Error),
    UnexpectedEof,
    HttpParseFail(String),
    HttpParseTooManyHeaders,
    ChunkLenNotAscii,
    ChunkLenNotANumber,
    ChunkExpectedCrLf,
    BodyNotJson(String),
    NoLocationHeader,
    BadLocationHeader(String),
    RedirectHostMismatch(String, String),
    Remote(StatusCode, String, Value),
    UnknownHost(String),
    NoHostsAvailable,
}

impl Error {
    /// Whether the transport died under us rather than the exchange itself
    /// being malformed.
    ///
    /// These are the failure classes the pool substitutes with "no
    /// response" on the first receive attempt: a pooled connection may
    /// have been closed server-side between requests, which surfaces as a
    /// reset or a garbled status line on the next read.
    pub(crate) fn is_disconnect(&self) -> bool {
        match self {
            Error::UnexpectedEof => true,
            Error::HttpParseFail(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// The remote status for [`Error::Remote`], if that is what this is.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Remote(status, _, _) => Some(*status),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        Error::HttpParseFail(value.to_string())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadHost(v) => write!(f, "bad host identifier: {}", v),
            Error::Io(v) => write!(f, "io: {}", v),
            Error::UnexpectedEof => write!(f, "transport closed before a full response"),
            Error::HttpParseFail(v) => write!(f, "http parse fail: {}", v),
            Error::HttpParseTooManyHeaders => write!(f, "http parse resulted in too many headers"),
            Error::ChunkLenNotAscii => write!(f, "chunk length is not ascii"),
            Error::ChunkLenNotANumber => write!(f, "chunk length cannot be read as a number"),
            Error::ChunkExpectedCrLf => write!(f, "chunk expected crlf as next character"),
            Error::BodyNotJson(v) => write!(f, "body is not valid json: {}", v),
            Error::NoLocationHeader => write!(f, "missing a location header"),
            Error::BadLocationHeader(v) => write!(f, "location header is malformed: {}", v),
            Error::RedirectHostMismatch(expected, found) => {
                write!(
                    f,
                    "redirect to foreign host: expected {}, got {}",
                    expected, found
                )
            }
            Error::Remote(status, reason, _) => write!(f, "remote error: {} {}", status, reason),
            Error::UnknownHost(v) => write!(f, "host not managed here: {}", v),
            Error::NoHostsAvailable => write!(f, "no hosts available after exclusion"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_classes() {
        assert!(Error::UnexpectedEof.is_disconnect());
        assert!(Error::HttpParseFail("bad status line".into()).is_disconnect());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_disconnect());
        assert!(!Error::Io(io::Error::from(io::ErrorKind::ConnectionRefused)).is_disconnect());
        assert!(!Error::NoHostsAvailable.is_disconnect());
        let remote = Error::Remote(StatusCode::NOT_FOUND, "Not Found".into(), Value::Null);
        assert!(!remote.is_disconnect());
    }

    #[test]
    fn from_httparse_error() {
        let error: Error = httparse::Error::Status.into();
        assert!(matches!(error, Error::HttpParseFail(_)));
    }

    #[test]
    fn remote_status() {
        let error = Error::Remote(StatusCode::NOT_FOUND, "Not Found".into(), Value::Null);
        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(Error::NoHostsAvailable.status(), None);
    }
}
