//! ReQL query language support.
//!
//! The pieces layer cleanly: [`terms`] is the operator catalog, [`datum`]
//! maps native values to and from wire JSON, [`ast`] composes terms into
//! query trees and encodes them, and [`protocol`] defines the query/response
//! envelopes that wrap an encoded tree.

pub mod ast;
pub mod datum;
pub mod protocol;
pub mod terms;

pub use ast::Term;
pub use datum::{BinaryFormat, Datum, FormatOptions, TimeFormat};
pub use protocol::{Backtrace, ErrorType, Frame, QueryType, Response, ResponseNote, ResponseType};
pub use terms::TermType;
