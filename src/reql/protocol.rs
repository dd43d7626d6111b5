//! Query/response envelope definitions.
//!
//! A request payload is `[queryType, encodedTerm?, optargs?]`; a response
//! payload is `{"t": type, "r": [...], "b"?: backtrace, "p"?: profile,
//! "e"?: errorType, "n"?: notes}`. This module owns the numeric codes for
//! both directions plus strict decoding of the response envelope.

use serde_json::Value;

use crate::error::{Error, Result};

/// Request kind, first element of every query envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum QueryType {
    Start = 1,
    Continue = 2,
    Stop = 3,
    NoreplyWait = 4,
    ServerInfo = 5,
}

impl QueryType {
    pub fn wire_code(self) -> u64 {
        self as u64
    }
}

/// Response kind, the `"t"` field of every response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ResponseType {
    /// A single complete value in `r[0]`.
    SuccessAtom = 1,
    /// A complete sequence of values in `r`.
    SuccessSequence = 2,
    /// A batch of values in `r`, with more batches pending.
    SuccessPartial = 3,
    /// All outstanding noreply queries have finished.
    WaitComplete = 4,
    /// Server metadata in `r[0]`.
    ServerInfo = 5,
    /// Driver/server protocol mismatch - a bug, not a query failure.
    ClientError = 16,
    /// The query failed to compile server-side.
    CompileError = 17,
    /// The query failed while executing.
    RuntimeError = 18,
}

impl ResponseType {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(ResponseType::SuccessAtom),
            2 => Some(ResponseType::SuccessSequence),
            3 => Some(ResponseType::SuccessPartial),
            4 => Some(ResponseType::WaitComplete),
            5 => Some(ResponseType::ServerInfo),
            16 => Some(ResponseType::ClientError),
            17 => Some(ResponseType::CompileError),
            18 => Some(ResponseType::RuntimeError),
            _ => None,
        }
    }

    pub fn wire_code(self) -> u64 {
        self as u64
    }
}

/// Runtime error subtype, the `"e"` field of error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ErrorType {
    Internal = 1_000_000,
    ResourceLimit = 2_000_000,
    QueryLogic = 3_000_000,
    NonExistence = 3_100_000,
    OpFailed = 4_100_000,
    OpIndeterminate = 4_200_000,
    User = 5_000_000,
    PermissionError = 6_000_000,
}

impl ErrorType {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1_000_000 => Some(ErrorType::Internal),
            2_000_000 => Some(ErrorType::ResourceLimit),
            3_000_000 => Some(ErrorType::QueryLogic),
            3_100_000 => Some(ErrorType::NonExistence),
            4_100_000 => Some(ErrorType::OpFailed),
            4_200_000 => Some(ErrorType::OpIndeterminate),
            5_000_000 => Some(ErrorType::User),
            6_000_000 => Some(ErrorType::PermissionError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorType::Internal => "INTERNAL",
            ErrorType::ResourceLimit => "RESOURCE_LIMIT",
            ErrorType::QueryLogic => "QUERY_LOGIC",
            ErrorType::NonExistence => "NON_EXISTENCE",
            ErrorType::OpFailed => "OP_FAILED",
            ErrorType::OpIndeterminate => "OP_INDETERMINATE",
            ErrorType::User => "USER",
            ErrorType::PermissionError => "PERMISSION_ERROR",
        };
        write!(f, "{name}")
    }
}

/// Stream annotation from the `"n"` field of a response. The feed variants
/// mark a partial stream as a changefeed: it follows writes and never
/// completes on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum ResponseNote {
    SequenceFeed = 1,
    AtomFeed = 2,
    OrderByLimitFeed = 3,
    UnionedFeed = 4,
    IncludesStates = 5,
}

impl ResponseNote {
    pub fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(ResponseNote::SequenceFeed),
            2 => Some(ResponseNote::AtomFeed),
            3 => Some(ResponseNote::OrderByLimitFeed),
            4 => Some(ResponseNote::UnionedFeed),
            5 => Some(ResponseNote::IncludesStates),
            _ => None,
        }
    }

    /// Whether this note marks the stream as a changefeed.
    pub fn is_feed(self) -> bool {
        !matches!(self, ResponseNote::IncludesStates)
    }
}

/// One step of a backtrace path: a positional argument index or an optarg
/// name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Index(u64),
    Key(String),
}

/// Path from the query root to the term a server error points at.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Backtrace(pub Vec<Frame>);

impl Backtrace {
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Array(frames) = value else {
            return Err(Error::MalformedResponse(
                "backtrace is not an array".into(),
            ));
        };
        let mut path = Vec::with_capacity(frames.len());
        for frame in frames {
            match frame {
                Value::Number(n) => {
                    let index = n.as_u64().ok_or_else(|| {
                        Error::MalformedResponse(format!("invalid backtrace index {n}"))
                    })?;
                    path.push(Frame::Index(index));
                }
                Value::String(key) => path.push(Frame::Key(key)),
                other => {
                    return Err(Error::MalformedResponse(format!(
                        "invalid backtrace frame {other}"
                    )));
                }
            }
        }
        Ok(Backtrace(path))
    }

    pub fn frames(&self) -> &[Frame] {
        &self.0
    }
}

impl std::fmt::Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "query")?;
        for frame in &self.0 {
            match frame {
                Frame::Index(i) => write!(f, "[{i}]")?,
                Frame::Key(k) => write!(f, ".{k}")?,
            }
        }
        Ok(())
    }
}

/// A decoded response envelope.
#[derive(Debug, Clone)]
pub struct Response {
    pub response_type: ResponseType,
    pub results: Vec<Value>,
    pub backtrace: Option<Backtrace>,
    pub profile: Option<Value>,
    pub error_type: Option<ErrorType>,
    pub notes: Vec<ResponseNote>,
}

impl Response {
    /// Decode a response payload. Any deviation from the envelope shape is a
    /// malformed-response error.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Self::from_json(serde_json::from_slice(payload)?)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::MalformedResponse("response is not an object".into()));
        };

        let t = map
            .get("t")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::MalformedResponse("missing response type".into()))?;
        let response_type = ResponseType::from_wire(t)
            .ok_or_else(|| Error::MalformedResponse(format!("unknown response type {t}")))?;

        let results = match map.remove("r") {
            Some(Value::Array(items)) => items,
            None => Vec::new(),
            Some(other) => {
                return Err(Error::MalformedResponse(format!(
                    "response results are not an array: {other}"
                )));
            }
        };

        let backtrace = map.remove("b").map(Backtrace::from_json).transpose()?;
        let profile = map.remove("p");
        let error_type = map
            .get("e")
            .and_then(Value::as_u64)
            .and_then(ErrorType::from_wire);
        let notes = map
            .get("n")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(ResponseNote::from_wire)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Response {
            response_type,
            results,
            backtrace,
            profile,
            error_type,
            notes,
        })
    }

    /// Whether any note marks this stream as a changefeed.
    pub fn is_feed(&self) -> bool {
        self.notes.iter().any(|note| note.is_feed())
    }

    /// The message carried by an error response.
    pub fn error_message(&self) -> String {
        self.results
            .first()
            .and_then(Value::as_str)
            .unwrap_or("unknown server error")
            .to_string()
    }

    /// Convert an error response into the matching [`Error`], or `None` for
    /// success responses.
    pub fn to_error(&self) -> Option<Error> {
        match self.response_type {
            ResponseType::ClientError => Some(Error::ClientError(self.error_message())),
            ResponseType::CompileError => Some(Error::Compile {
                message: self.error_message(),
                backtrace: self.backtrace.clone(),
                query: None,
            }),
            ResponseType::RuntimeError => Some(Error::Runtime {
                error_type: self.error_type,
                message: self.error_message(),
                backtrace: self.backtrace.clone(),
                query: None,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_atom_response() {
        let resp = Response::from_json(json!({"t": 1, "r": [42]})).unwrap();
        assert_eq!(resp.response_type, ResponseType::SuccessAtom);
        assert_eq!(resp.results, vec![json!(42)]);
        assert!(resp.backtrace.is_none());
        assert!(resp.to_error().is_none());
    }

    #[test]
    fn test_partial_response_with_notes() {
        let resp = Response::from_json(json!({"t": 3, "r": [1, 2, 3], "n": [1]})).unwrap();
        assert_eq!(resp.response_type, ResponseType::SuccessPartial);
        assert_eq!(resp.results.len(), 3);
        assert_eq!(resp.notes, vec![ResponseNote::SequenceFeed]);
        assert!(resp.is_feed());
    }

    #[test]
    fn test_feed_detection() {
        let plain = Response::from_json(json!({"t": 3, "r": []})).unwrap();
        assert!(!plain.is_feed());

        // INCLUDES_STATES alone does not make a feed.
        let states = Response::from_json(json!({"t": 3, "r": [], "n": [5]})).unwrap();
        assert!(!states.is_feed());

        let atom_feed = Response::from_json(json!({"t": 3, "r": [], "n": [2, 5]})).unwrap();
        assert!(atom_feed.is_feed());
    }

    #[test]
    fn test_runtime_error_response() {
        let resp = Response::from_json(json!({
            "t": 18,
            "r": ["Table `test.users` does not exist."],
            "b": [0, "db"],
            "e": 3_100_000,
        }))
        .unwrap();
        assert_eq!(resp.error_type, Some(ErrorType::NonExistence));
        let err = resp.to_error().unwrap();
        assert!(err.is_server_error());
        let backtrace = err.backtrace().unwrap();
        assert_eq!(backtrace.to_string(), "query[0].db");
    }

    #[test]
    fn test_profile_payload() {
        let resp =
            Response::from_json(json!({"t": 1, "r": [1], "p": [{"duration(ms)": 0.2}]})).unwrap();
        assert!(resp.profile.is_some());
    }

    #[test]
    fn test_malformed_responses() {
        assert!(Response::from_json(json!([1, 2])).is_err());
        assert!(Response::from_json(json!({"r": []})).is_err());
        assert!(Response::from_json(json!({"t": 99, "r": []})).is_err());
        assert!(Response::from_json(json!({"t": 1, "r": "oops"})).is_err());
        assert!(Response::from_json(json!({"t": 17, "b": {"bad": true}})).is_err());
    }

    #[test]
    fn test_payload_decoding() {
        let resp = Response::from_payload(br#"{"t":2,"r":[]}"#).unwrap();
        assert_eq!(resp.response_type, ResponseType::SuccessSequence);
        assert!(Response::from_payload(b"not json").is_err());
    }
}
