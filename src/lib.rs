// ReQL client driver - Rust implementation
// A client for RethinkDB's query language wire protocol

#![warn(rust_2018_idioms)]

pub mod error;
pub mod network;
pub mod reql;

// Re-exports for convenience
pub use error::{Error, Result};
pub use network::connection::{ConnectOptions, Connection, RunOptions, RunOutcome, RunResult};
#[cfg(feature = "tls")]
pub use network::connection::TlsOptions;
pub use network::cursor::Cursor;
pub use reql::ast::Term;
pub use reql::datum::{BinaryFormat, Datum, FormatOptions, TimeFormat};
pub use reql::terms::TermType;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
