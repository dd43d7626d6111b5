//! Query expression tree.
//!
//! A query is a tree of [`Term`] nodes. Each node has a [`TermType`],
//! ordered positional arguments (child terms), and named optional arguments.
//! Trees compose bottom-up through the fluent builders and are never mutated
//! after a parent takes ownership, so cycles cannot occur.
//!
//! [`Term::encode`] produces the wire form: a depth-first
//! `[code, [args...], {optargs...}]` array, with empty optargs omitted and
//! literal datums encoded as bare JSON values. Bare JSON arrays are reserved
//! for terms on the wire, so array literals are lifted into `MAKE_ARRAY`
//! nodes during encoding.
//!
//! No argument-count or type validation happens client-side: an invalid term
//! shape comes back as a server compile error. Only values that cannot be
//! encoded at all fail locally.
//!
//! # Example
//!
//! Building `r.table("users").filter({age: 25})`:
//!
//! ```rust,ignore
//! use reql_driver::{Datum, Term, TermType};
//! use std::collections::HashMap;
//!
//! let mut filter_obj = HashMap::new();
//! filter_obj.insert("age".to_string(), Datum::Number(25.0));
//!
//! let query = Term::filter(Term::table("users"), Term::expr(Datum::Object(filter_obj)));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::datum::Datum;
use super::terms::TermType;
use crate::error::{Error, Result};

/// A ReQL term - one node of the query expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    /// The operation this node performs
    pub term_type: TermType,

    /// Positional arguments
    pub args: Vec<Term>,

    /// Optional named arguments
    pub optargs: HashMap<String, Term>,

    /// Literal value (for DATUM terms)
    pub datum: Option<Datum>,
}

impl Term {
    /// Create a new term with given type
    pub fn new(term_type: TermType) -> Self {
        Self {
            term_type,
            args: Vec::new(),
            optargs: HashMap::new(),
            datum: None,
        }
    }

    /// Create a datum (literal value) term
    pub fn datum(datum: Datum) -> Self {
        Self {
            term_type: TermType::Datum,
            args: Vec::new(),
            optargs: HashMap::new(),
            datum: Some(datum),
        }
    }

    /// Lift a native value into the expression tree.
    pub fn expr<D: Into<Datum>>(value: D) -> Self {
        Term::datum(value.into())
    }

    /// Add a positional argument
    pub fn with_arg(mut self, arg: Term) -> Self {
        self.args.push(arg);
        self
    }

    /// Add multiple positional arguments
    pub fn with_args(mut self, args: Vec<Term>) -> Self {
        self.args.extend(args);
        self
    }

    /// Add an optional named argument
    pub fn with_optarg<S: Into<String>>(mut self, name: S, value: Term) -> Self {
        self.optargs.insert(name.into(), value);
        self
    }

    /// Get the first argument
    pub fn first_arg(&self) -> Option<&Term> {
        self.args.first()
    }

    /// Get argument at index
    pub fn arg(&self, index: usize) -> Option<&Term> {
        self.args.get(index)
    }

    /// Get optional argument by name
    pub fn optarg(&self, name: &str) -> Option<&Term> {
        self.optargs.get(name)
    }

    /// Check if this is a datum term
    pub fn is_datum(&self) -> bool {
        self.term_type == TermType::Datum
    }

    /// Get datum value if this is a datum term
    pub fn as_datum(&self) -> Option<&Datum> {
        self.datum.as_ref()
    }

    /// Encode into the canonical wire form, depth-first.
    ///
    /// Argument order is preserved exactly as supplied; the optargs object is
    /// omitted when empty.
    pub fn encode(&self) -> Result<Value> {
        if self.term_type == TermType::Datum {
            let datum = self
                .datum
                .as_ref()
                .ok_or_else(|| Error::Unconvertible("datum term without a value".into()))?;
            return encode_literal(datum);
        }

        let args = self
            .args
            .iter()
            .map(Term::encode)
            .collect::<Result<Vec<_>>>()?;
        let mut parts = vec![Value::from(self.term_type.wire_code()), Value::Array(args)];

        if !self.optargs.is_empty() {
            let mut optargs = serde_json::Map::with_capacity(self.optargs.len());
            for (name, value) in &self.optargs {
                optargs.insert(name.clone(), value.encode()?);
            }
            parts.push(Value::Object(optargs));
        }

        Ok(Value::Array(parts))
    }
}

/// Encode a literal, lifting arrays into `MAKE_ARRAY` terms so a bare JSON
/// array never lands in term position.
fn encode_literal(datum: &Datum) -> Result<Value> {
    match datum {
        Datum::Array(items) => {
            let encoded = items
                .iter()
                .map(encode_literal)
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(vec![
                Value::from(TermType::MakeArray.wire_code()),
                Value::Array(encoded),
            ]))
        }
        Datum::Object(map) => {
            let mut obj = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                obj.insert(key.clone(), encode_literal(value)?);
            }
            Ok(Value::Object(obj))
        }
        other => other.to_wire(),
    }
}

// === Convenience constructors ===
//
// The full operator catalog is generated elsewhere; these cover the terms the
// driver itself needs plus the common entry points.

impl Term {
    // Database operations
    pub fn db<S: Into<String>>(name: S) -> Self {
        Term::new(TermType::Db).with_arg(Term::expr(name.into()))
    }

    pub fn table<S: Into<String>>(name: S) -> Self {
        Term::new(TermType::Table).with_arg(Term::expr(name.into()))
    }

    pub fn db_list() -> Self {
        Term::new(TermType::DbList)
    }

    pub fn table_list() -> Self {
        Term::new(TermType::TableList)
    }

    // Data access
    pub fn get(table: Term, key: Datum) -> Self {
        Term::new(TermType::Get)
            .with_arg(table)
            .with_arg(Term::datum(key))
    }

    pub fn filter(sequence: Term, predicate: Term) -> Self {
        Term::new(TermType::Filter)
            .with_arg(sequence)
            .with_arg(predicate)
    }

    // Transformations
    pub fn map(sequence: Term, mapping: Term) -> Self {
        Term::new(TermType::Map)
            .with_arg(sequence)
            .with_arg(mapping)
    }

    pub fn limit(sequence: Term, n: i64) -> Self {
        Term::new(TermType::Limit)
            .with_arg(sequence)
            .with_arg(Term::expr(n))
    }

    pub fn count(sequence: Term) -> Self {
        Term::new(TermType::Count).with_arg(sequence)
    }

    // Write operations
    pub fn insert(table: Term, documents: Vec<Datum>) -> Self {
        let docs: Vec<Term> = documents.into_iter().map(Term::datum).collect();
        Term::new(TermType::Insert).with_arg(table).with_args(docs)
    }

    pub fn update(selection: Term, update_doc: Datum) -> Self {
        Term::new(TermType::Update)
            .with_arg(selection)
            .with_arg(Term::datum(update_doc))
    }

    pub fn delete(selection: Term) -> Self {
        Term::new(TermType::Delete).with_arg(selection)
    }

    // Math and logic
    pub fn add(terms: Vec<Term>) -> Self {
        Term::new(TermType::Add).with_args(terms)
    }

    pub fn eq(left: Term, right: Term) -> Self {
        Term::new(TermType::Eq).with_arg(left).with_arg(right)
    }

    pub fn gt(left: Term, right: Term) -> Self {
        Term::new(TermType::Gt).with_arg(left).with_arg(right)
    }

    pub fn and(terms: Vec<Term>) -> Self {
        Term::new(TermType::And).with_args(terms)
    }

    pub fn or(terms: Vec<Term>) -> Self {
        Term::new(TermType::Or).with_args(terms)
    }

    pub fn not(term: Term) -> Self {
        Term::new(TermType::Not).with_arg(term)
    }
}
