//! Client networking.
//!
//! [`protocol`] frames bytes, [`handshake`] authenticates a fresh stream,
//! [`connection`] multiplexes queries over it by token, and [`cursor`]
//! streams batched sequence results.

pub mod connection;
pub mod cursor;
pub mod handshake;
pub mod protocol;

pub use connection::{ConnectOptions, Connection, RunOptions, RunOutcome, RunResult};
pub use cursor::Cursor;
