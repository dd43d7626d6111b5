//! Datum - the JSON-like value type queries operate on.
//!
//! A `Datum` covers the six plain JSON shapes plus two decoded pseudo-types.
//! On the wire a pseudo-type is an object carrying the reserved
//! `$reql_type$` marker key; the driver decodes `TIME` and `BINARY` markers
//! into native values ([`chrono::DateTime`] and [`bytes::Bytes`]) and leaves
//! other markers (such as `GEOMETRY`) as raw objects.
//!
//! Decoding is parameterized by [`FormatOptions`], chosen per `run()` call:
//! either pseudo-type can independently be kept in its raw object form.
//!
//! Round-trip law: `from_wire(to_wire(x)) == x` for every representable
//! value, modulo the chosen presentation. Doubles survive exactly because
//! the JSON layer emits the shortest representation that parses back to the
//! same bits.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Error, Result};

/// Reserved marker key identifying a pseudo-type object.
pub const PSEUDO_TYPE_KEY: &str = "$reql_type$";

/// Presentation of `TIME` pseudo-types in decoded results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeFormat {
    /// Decode into [`Datum::Time`].
    #[default]
    Native,
    /// Keep the raw `{"$reql_type$":"TIME",...}` object.
    Raw,
}

/// Presentation of `BINARY` pseudo-types in decoded results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinaryFormat {
    /// Decode into [`Datum::Binary`].
    #[default]
    Native,
    /// Keep the raw `{"$reql_type$":"BINARY",...}` object.
    Raw,
}

/// Per-query conversion options, captured when a query is run and applied to
/// every value decoded from its responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatOptions {
    pub time_format: TimeFormat,
    pub binary_format: BinaryFormat,
}

/// A value stored or manipulated by a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Datum>),
    Object(HashMap<String, Datum>),
    /// Decoded `TIME` pseudo-type.
    Time(DateTime<FixedOffset>),
    /// Decoded `BINARY` pseudo-type.
    Binary(Bytes),
}

impl Datum {
    /// Check if datum is null
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Get as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Datum::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Datum::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as string
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Datum::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as array
    pub fn as_array(&self) -> Option<&Vec<Datum>> {
        match self {
            Datum::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object
    pub fn as_object(&self) -> Option<&HashMap<String, Datum>> {
        match self {
            Datum::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Get as a decoded time
    pub fn as_time(&self) -> Option<&DateTime<FixedOffset>> {
        match self {
            Datum::Time(t) => Some(t),
            _ => None,
        }
    }

    /// Get as decoded binary data
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Datum::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Encode into the wire JSON representation.
    ///
    /// Fails with [`Error::Unconvertible`] for values the wire cannot carry
    /// (non-finite numbers).
    pub fn to_wire(&self) -> Result<Value> {
        Ok(match self {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(*b),
            Datum::Number(n) => Value::Number(
                serde_json::Number::from_f64(*n)
                    .ok_or_else(|| Error::Unconvertible(format!("non-finite number {n}")))?,
            ),
            Datum::String(s) => Value::String(s.clone()),
            Datum::Array(arr) => {
                Value::Array(arr.iter().map(Datum::to_wire).collect::<Result<_>>()?)
            }
            Datum::Object(obj) => {
                let mut map = serde_json::Map::with_capacity(obj.len());
                for (key, value) in obj {
                    map.insert(key.clone(), value.to_wire()?);
                }
                Value::Object(map)
            }
            Datum::Time(dt) => {
                let epoch =
                    dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9;
                serde_json::json!({
                    PSEUDO_TYPE_KEY: "TIME",
                    "epoch_time": epoch,
                    "timezone": format_timezone(dt.offset().local_minus_utc()),
                })
            }
            Datum::Binary(data) => serde_json::json!({
                PSEUDO_TYPE_KEY: "BINARY",
                "data": BASE64.encode(data),
            }),
        })
    }

    /// Decode a wire JSON value, applying the pseudo-type presentation in
    /// `opts`.
    pub fn from_wire(value: Value, opts: FormatOptions) -> Result<Datum> {
        match value {
            Value::Null => Ok(Datum::Null),
            Value::Bool(b) => Ok(Datum::Bool(b)),
            Value::Number(n) => n
                .as_f64()
                .map(Datum::Number)
                .ok_or_else(|| Error::Unconvertible(format!("unrepresentable number {n}"))),
            Value::String(s) => Ok(Datum::String(s)),
            Value::Array(arr) => Ok(Datum::Array(
                arr.into_iter()
                    .map(|item| Datum::from_wire(item, opts))
                    .collect::<Result<_>>()?,
            )),
            Value::Object(map) => {
                if let Some(Value::String(kind)) = map.get(PSEUDO_TYPE_KEY) {
                    match kind.as_str() {
                        "TIME" if opts.time_format == TimeFormat::Native => {
                            return decode_time(&map);
                        }
                        "BINARY" if opts.binary_format == BinaryFormat::Native => {
                            return decode_binary(&map);
                        }
                        // GEOMETRY and raw-format pseudo-types pass through
                        _ => {}
                    }
                }
                let mut obj = HashMap::with_capacity(map.len());
                for (key, value) in map {
                    obj.insert(key, Datum::from_wire(value, opts)?);
                }
                Ok(Datum::Object(obj))
            }
        }
    }
}

fn decode_time(map: &serde_json::Map<String, Value>) -> Result<Datum> {
    let epoch = map
        .get("epoch_time")
        .and_then(Value::as_f64)
        .ok_or_else(|| Error::MalformedResponse("TIME object without epoch_time".into()))?;
    let timezone = map
        .get("timezone")
        .and_then(Value::as_str)
        .unwrap_or("+00:00");
    let offset = parse_timezone(timezone)?;
    let secs = epoch.floor();
    let nanos = ((epoch - secs) * 1e9).round() as u32;
    let utc = DateTime::<Utc>::from_timestamp(secs as i64, nanos.min(999_999_999))
        .ok_or_else(|| Error::MalformedResponse(format!("epoch_time {epoch} out of range")))?;
    Ok(Datum::Time(utc.with_timezone(&offset)))
}

fn decode_binary(map: &serde_json::Map<String, Value>) -> Result<Datum> {
    let data = map
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedResponse("BINARY object without data".into()))?;
    let bytes = BASE64
        .decode(data)
        .map_err(|e| Error::MalformedResponse(format!("invalid base64 in BINARY object: {e}")))?;
    Ok(Datum::Binary(Bytes::from(bytes)))
}

/// Parse a `+HH:MM` / `-HH:MM` (or `Z`) timezone string.
fn parse_timezone(tz: &str) -> Result<FixedOffset> {
    let malformed = || Error::MalformedResponse(format!("invalid timezone {tz:?}"));
    if tz == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(malformed);
    }
    let (sign, rest) = match tz.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(malformed()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(malformed)?;
    let hours: i32 = hours.parse().map_err(|_| malformed())?;
    let minutes: i32 = minutes.parse().map_err(|_| malformed())?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(malformed)
}

fn format_timezone(offset_secs: i32) -> String {
    let sign = if offset_secs < 0 { '-' } else { '+' };
    let abs = offset_secs.abs();
    format!("{}{:02}:{:02}", sign, abs / 3600, (abs % 3600) / 60)
}

// Conversions
impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Bool(b)
    }
}

impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Number(n as f64)
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Number(n)
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::String(s)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::String(s.to_string())
    }
}

impl From<Vec<Datum>> for Datum {
    fn from(arr: Vec<Datum>) -> Self {
        Datum::Array(arr)
    }
}

impl From<HashMap<String, Datum>> for Datum {
    fn from(obj: HashMap<String, Datum>) -> Self {
        Datum::Object(obj)
    }
}

impl From<DateTime<FixedOffset>> for Datum {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Datum::Time(dt)
    }
}

impl From<Bytes> for Datum {
    fn from(data: Bytes) -> Self {
        Datum::Binary(data)
    }
}

impl From<Vec<u8>> for Datum {
    fn from(data: Vec<u8>) -> Self {
        Datum::Binary(Bytes::from(data))
    }
}

/// Raw JSON conversion: no pseudo-type decoding.
impl From<Value> for Datum {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(b),
            Value::Number(n) => Datum::Number(n.as_f64().unwrap_or_default()),
            Value::String(s) => Datum::String(s),
            Value::Array(arr) => Datum::Array(arr.into_iter().map(Datum::from).collect()),
            Value::Object(obj) => Datum::Object(
                obj.into_iter()
                    .map(|(k, v)| (k, Datum::from(v)))
                    .collect(),
            ),
        }
    }
}

impl Serialize for Datum {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_wire()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Datum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Datum::from)
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_wire() {
            Ok(value) => write!(f, "{value}"),
            Err(_) => write!(f, "<unconvertible>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(datum: Datum) {
        let wire = datum.to_wire().unwrap();
        let back = Datum::from_wire(wire, FormatOptions::default()).unwrap();
        assert_eq!(back, datum);
    }

    #[test]
    fn test_scalar_roundtrip() {
        roundtrip(Datum::Null);
        roundtrip(Datum::Bool(true));
        roundtrip(Datum::Number(42.0));
        roundtrip(Datum::String("hello".into()));
    }

    #[test]
    fn test_double_precision_roundtrip() {
        for n in [0.1, 1.0 / 3.0, 1e300, f64::MAX, f64::MIN_POSITIVE, -0.0] {
            roundtrip(Datum::Number(n));
        }
    }

    #[test]
    fn test_nonfinite_rejected() {
        assert!(Datum::Number(f64::NAN).to_wire().is_err());
        assert!(Datum::Number(f64::INFINITY).to_wire().is_err());
    }

    #[test]
    fn test_nested_roundtrip() {
        let mut obj = HashMap::new();
        obj.insert("name".to_string(), Datum::String("Alice".into()));
        obj.insert(
            "scores".to_string(),
            Datum::Array(vec![Datum::Number(1.0), Datum::Number(2.5)]),
        );
        roundtrip(Datum::Object(obj));
    }

    #[test]
    fn test_time_roundtrip() {
        let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
        let dt = DateTime::<Utc>::from_timestamp(1_700_000_000, 250_000_000)
            .unwrap()
            .with_timezone(&offset);
        let datum = Datum::Time(dt);
        let wire = datum.to_wire().unwrap();
        assert_eq!(wire[PSEUDO_TYPE_KEY], "TIME");
        assert_eq!(wire["timezone"], "-05:00");
        let back = Datum::from_wire(wire, FormatOptions::default()).unwrap();
        assert_eq!(back, datum);
    }

    #[test]
    fn test_binary_roundtrip() {
        let datum = Datum::Binary(Bytes::from_static(b"\x00\x01\x02hello"));
        let wire = datum.to_wire().unwrap();
        assert_eq!(wire[PSEUDO_TYPE_KEY], "BINARY");
        roundtrip(datum);
    }

    #[test]
    fn test_raw_formats_pass_through() {
        let wire = json!({
            PSEUDO_TYPE_KEY: "TIME",
            "epoch_time": 0.0,
            "timezone": "+00:00",
        });
        let opts = FormatOptions {
            time_format: TimeFormat::Raw,
            binary_format: BinaryFormat::Native,
        };
        let datum = Datum::from_wire(wire, opts).unwrap();
        let obj = datum.as_object().expect("raw time stays an object");
        assert_eq!(
            obj.get(PSEUDO_TYPE_KEY),
            Some(&Datum::String("TIME".into()))
        );
    }

    #[test]
    fn test_geometry_stays_raw() {
        let wire = json!({
            PSEUDO_TYPE_KEY: "GEOMETRY",
            "type": "Point",
            "coordinates": [-73.0, 40.0],
        });
        let datum = Datum::from_wire(wire, FormatOptions::default()).unwrap();
        assert!(datum.as_object().is_some());
    }

    #[test]
    fn test_bad_binary_payload() {
        let wire = json!({ PSEUDO_TYPE_KEY: "BINARY", "data": "not base64!!!" });
        assert!(Datum::from_wire(wire, FormatOptions::default()).is_err());
    }

    #[test]
    fn test_timezone_parsing() {
        assert_eq!(parse_timezone("Z").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("+05:30").unwrap().local_minus_utc(), 19800);
        assert_eq!(parse_timezone("-08:00").unwrap().local_minus_utc(), -28800);
        assert!(parse_timezone("EST").is_err());
    }
}
