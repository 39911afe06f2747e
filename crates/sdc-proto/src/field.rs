//! ---
//! sdc_section: "02-protocol-grammar"
//! sdc_subsection: "module"
//! sdc_type: "source"
//! sdc_scope: "code"
//! sdc_description: "SDP message grammar, multipart assembly and signing."
//! sdc_version: "v0.0.0-prealpha"
//! sdc_owner: "tbd"
//! ---
use std::fmt;

use crate::error::FieldError;

/// Field naming the owning device. At most one per datagram, always first.
pub const ID_FIELD: &str = "id";
/// Field carrying `seq[,timestamp]`; repeated occurrences start multipart
/// pieces.
pub const TIMEBASE_FIELD: &str = "in";
/// Reserved name of the trailing signature line.
pub const SIGNATURE_FIELD: &str = "sha256";
/// Legacy alias that is typed as a hex float despite its `V` suffix.
pub const LEGACY_FLOAT_FIELD: &str = "TOV";
/// Wire value marking a query for the current register value.
pub const QUERY_MARK: &str = "?";

/// Wire type of a field, fully determined by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Suffix `S`: integer in 0..=3.
    Status,
    /// Suffix `V`: scalar value.
    Value,
    /// Suffix `W`: ordered list of optional integers.
    ValueList,
    /// Suffix `F` (or the legacy `TOV` name): opaque hex float string.
    FloatHex,
    /// Everything else: opaque string data.
    Data,
}

impl FieldKind {
    /// Classify a field name.
    pub fn of(name: &str) -> FieldKind {
        if name == LEGACY_FLOAT_FIELD {
            return FieldKind::FloatHex;
        }
        match name.as_bytes().last() {
            Some(b'F') => FieldKind::FloatHex,
            Some(b'S') => FieldKind::Status,
            Some(b'V') => FieldKind::Value,
            Some(b'W') => FieldKind::ValueList,
            _ => FieldKind::Data,
        }
    }
}

/// Scalar payload of a `V` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Text value. Decoded datagrams always carry text scalars; numeric
    /// interpretation is up to the consumer.
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

/// Typed value of one SDP field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Status register, 0..=3.
    Status(u8),
    /// Scalar value register.
    Value(Scalar),
    /// List-of-values register; `None` marks a missing member.
    ValueList(Vec<Option<i64>>),
    /// Opaque hex-encoded float, passed through uninterpreted.
    FloatHex(String),
    /// Opaque string data.
    Data(String),
    /// Request for the current value of the register, not a report.
    Query,
}

impl FieldValue {
    /// Validate a caller-supplied value against the type `name` demands.
    pub fn for_name(name: &str, input: FieldInput) -> Result<FieldValue, FieldError> {
        if matches!(&input, FieldInput::Text(t) if t == QUERY_MARK) {
            return Ok(FieldValue::Query);
        }
        match FieldKind::of(name) {
            FieldKind::Status => match input {
                FieldInput::Int(v) if (0..=3).contains(&v) => Ok(FieldValue::Status(v as u8)),
                FieldInput::Int(v) => Err(FieldError::StatusValue(v.to_string())),
                FieldInput::Text(t) => parse_status(&t),
                other => Err(FieldError::StatusValue(other.describe().to_owned())),
            },
            FieldKind::Value => match input {
                FieldInput::Int(v) => Ok(FieldValue::Value(Scalar::Int(v))),
                FieldInput::Float(v) => Ok(FieldValue::Value(Scalar::Float(v))),
                FieldInput::Text(t) => Ok(FieldValue::Value(Scalar::Text(t))),
                FieldInput::List(_) => Err(FieldError::TypeMismatch {
                    name: name.to_owned(),
                    expected: "scalar",
                }),
            },
            FieldKind::ValueList => match input {
                FieldInput::List(members) => Ok(FieldValue::ValueList(members)),
                FieldInput::Text(t) => parse_value_list(name, &t),
                _ => Err(FieldError::TypeMismatch {
                    name: name.to_owned(),
                    expected: "list of integers",
                }),
            },
            FieldKind::FloatHex => match input {
                FieldInput::Text(t) if t.is_empty() => Err(FieldError::EmptyValue(name.to_owned())),
                FieldInput::Text(t) => Ok(FieldValue::FloatHex(t)),
                _ => Err(FieldError::TypeMismatch {
                    name: name.to_owned(),
                    expected: "hex float string",
                }),
            },
            FieldKind::Data => match input {
                FieldInput::Text(t) => Ok(FieldValue::Data(t)),
                _ => Err(FieldError::TypeMismatch {
                    name: name.to_owned(),
                    expected: "string",
                }),
            },
        }
    }

    /// Parse a raw wire value for the field `name`. Scalar values stay text;
    /// the wire carries no type information beyond the name suffix.
    pub fn parse_wire(name: &str, raw: &str) -> Result<FieldValue, FieldError> {
        if raw == QUERY_MARK {
            return Ok(FieldValue::Query);
        }
        match FieldKind::of(name) {
            FieldKind::Status => parse_status(raw),
            FieldKind::Value => Ok(FieldValue::Value(Scalar::Text(raw.to_owned()))),
            FieldKind::ValueList => parse_value_list(name, raw),
            FieldKind::FloatHex if raw.is_empty() => Err(FieldError::EmptyValue(name.to_owned())),
            FieldKind::FloatHex => Ok(FieldValue::FloatHex(raw.to_owned())),
            FieldKind::Data => Ok(FieldValue::Data(raw.to_owned())),
        }
    }

    /// Wire representation of this value.
    pub fn wire_value(&self) -> String {
        match self {
            FieldValue::Status(v) => v.to_string(),
            FieldValue::Value(scalar) => scalar.to_string(),
            FieldValue::ValueList(members) => members
                .iter()
                .map(list_member_to_str)
                .collect::<Vec<_>>()
                .join(" "),
            FieldValue::FloatHex(v) | FieldValue::Data(v) => v.clone(),
            FieldValue::Query => QUERY_MARK.to_owned(),
        }
    }

    /// Whether this value is a query marker.
    pub fn is_query(&self) -> bool {
        matches!(self, FieldValue::Query)
    }
}

fn parse_status(raw: &str) -> Result<FieldValue, FieldError> {
    match raw {
        "0" => Ok(FieldValue::Status(0)),
        "1" => Ok(FieldValue::Status(1)),
        "2" => Ok(FieldValue::Status(2)),
        "3" => Ok(FieldValue::Status(3)),
        other => Err(FieldError::StatusValue(other.to_owned())),
    }
}

fn parse_value_list(name: &str, raw: &str) -> Result<FieldValue, FieldError> {
    if raw.is_empty() {
        return Err(FieldError::EmptyValue(name.to_owned()));
    }
    let mut members = Vec::new();
    for token in raw.split(' ') {
        members.push(list_member_from_str(name, token)?);
    }
    Ok(FieldValue::ValueList(members))
}

fn list_member_from_str(name: &str, token: &str) -> Result<Option<i64>, FieldError> {
    if token == "null" {
        return Ok(None);
    }
    if token.is_empty() {
        return Err(FieldError::EmptyValue(name.to_owned()));
    }
    token
        .parse::<i64>()
        .map(Some)
        .map_err(|_| FieldError::ListMember(token.to_owned()))
}

fn list_member_to_str(member: &Option<i64>) -> String {
    match member {
        Some(v) => v.to_string(),
        None => "null".to_owned(),
    }
}

/// Caller-supplied value for [`FieldValue::for_name`]; conversions exist for
/// the ordinary Rust types so `add("AAS", 2)` reads naturally.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldInput {
    /// Integer input.
    Int(i64),
    /// Floating point input.
    Float(f64),
    /// Text input.
    Text(String),
    /// Prepared list-of-values input.
    List(Vec<Option<i64>>),
}

impl FieldInput {
    fn describe(&self) -> &'static str {
        match self {
            FieldInput::Int(_) => "integer",
            FieldInput::Float(_) => "float",
            FieldInput::Text(_) => "text",
            FieldInput::List(_) => "list",
        }
    }
}

impl From<i64> for FieldInput {
    fn from(value: i64) -> Self {
        FieldInput::Int(value)
    }
}

impl From<i32> for FieldInput {
    fn from(value: i32) -> Self {
        FieldInput::Int(i64::from(value))
    }
}

impl From<f64> for FieldInput {
    fn from(value: f64) -> Self {
        FieldInput::Float(value)
    }
}

impl From<&str> for FieldInput {
    fn from(value: &str) -> Self {
        FieldInput::Text(value.to_owned())
    }
}

impl From<String> for FieldInput {
    fn from(value: String) -> Self {
        FieldInput::Text(value)
    }
}

impl From<Vec<Option<i64>>> for FieldInput {
    fn from(value: Vec<Option<i64>>) -> Self {
        FieldInput::List(value)
    }
}

impl From<Vec<i64>> for FieldInput {
    fn from(value: Vec<i64>) -> Self {
        FieldInput::List(value.into_iter().map(Some).collect())
    }
}

impl From<&FieldValue> for FieldInput {
    fn from(value: &FieldValue) -> Self {
        match value {
            FieldValue::Status(v) => FieldInput::Int(i64::from(*v)),
            FieldValue::Value(Scalar::Int(v)) => FieldInput::Int(*v),
            FieldValue::Value(Scalar::Float(v)) => FieldInput::Float(*v),
            FieldValue::Value(Scalar::Text(v)) => FieldInput::Text(v.clone()),
            FieldValue::ValueList(members) => FieldInput::List(members.clone()),
            FieldValue::FloatHex(v) | FieldValue::Data(v) => FieldInput::Text(v.clone()),
            FieldValue::Query => FieldInput::Text(QUERY_MARK.to_owned()),
        }
    }
}
