//! Driver error taxonomy.
//!
//! Errors split into two classes with different blast radii:
//!
//! - **Driver errors** are local failures: connection state, socket I/O,
//!   malformed frames, undecodable values. Socket-level variants
//!   ([`Error::Timeout`], [`Error::Disconnected`], [`Error::Io`]) force the
//!   connection closed before they are returned.
//! - **Server errors** ([`Error::Compile`], [`Error::Runtime`]) are fatal only
//!   to the query that triggered them; the connection stays usable. They carry
//!   the offending query and, when the server provides one, a decoded
//!   [`Backtrace`] pinpointing the term that failed.
//!
//! Every error is raised synchronously to the caller of the operation that
//! produced it. The driver never retries on its own.

use thiserror::Error;

use crate::reql::ast::Term;
use crate::reql::protocol::{Backtrace, ErrorType};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("operation timed out")]
    Timeout,

    #[error("server closed the connection")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request payload of {0} bytes exceeds the maximum frame size")]
    PayloadTooLarge(usize),

    #[error("response token {got} does not match request token {expected}")]
    TokenMismatch { expected: u32, got: u32 },

    #[error("token {0} has no active stream")]
    UnknownToken(u32),

    #[error("client error reported by server: {0}")]
    ClientError(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("cannot convert value: {0}")]
    Unconvertible(String),

    #[error("compile error: {message}")]
    Compile {
        message: String,
        backtrace: Option<Backtrace>,
        query: Option<Term>,
    },

    #[error("runtime error: {message}")]
    Runtime {
        error_type: Option<ErrorType>,
        message: String,
        backtrace: Option<Backtrace>,
        query: Option<Term>,
    },
}

impl Error {
    /// True for errors reported by the server against a specific query.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Error::Compile { .. } | Error::Runtime { .. })
    }

    /// True when the server rejected the credentials during the handshake.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Error::Auth(_))
    }

    /// Backtrace into the offending query, if the server supplied one.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            Error::Compile { backtrace, .. } | Error::Runtime { backtrace, .. } => {
                backtrace.as_ref()
            }
            _ => None,
        }
    }

    /// The query a server error was raised against.
    pub fn query(&self) -> Option<&Term> {
        match self {
            Error::Compile { query, .. } | Error::Runtime { query, .. } => query.as_ref(),
            _ => None,
        }
    }
}
