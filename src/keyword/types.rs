//! Keyword type system.
//!
//! Each type turns arbitrary input into its canonical wire form
//! (`translate`), validates that form (`check`), and exposes the native
//! view of a wire value (`cast`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

use super::KeywordError;

const INT_MIN: i64 = i32::MIN as i64;
const INT_MAX: i64 = i32::MAX as i64;

/// Native ("binary") view of a keyword value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Bool(b) => f.write_str(if *b { "1" } else { "0" }),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

/// Ordinal → name table of an enumerated keyword.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Enumerators {
    by_ordinal: BTreeMap<i64, String>,
    by_name: BTreeMap<String, i64>,
}

impl Enumerators {
    pub fn new(table: impl IntoIterator<Item = (i64, String)>) -> Result<Self, KeywordError> {
        let mut enumerators = Self::default();
        for (ordinal, name) in table {
            if name.is_empty() || name.contains([',', '=', ':', '(', ')']) {
                return Err(KeywordError::Type(format!(
                    "invalid enumerator name '{name}'"
                )));
            }
            enumerators.by_name.insert(name.to_lowercase(), ordinal);
            enumerators.by_ordinal.insert(ordinal, name);
        }
        Ok(enumerators)
    }

    pub fn name(&self, ordinal: i64) -> Option<&str> {
        self.by_ordinal.get(&ordinal).map(String::as_str)
    }

    pub fn ordinal(&self, name: &str) -> Option<i64> {
        self.by_name.get(&name.to_lowercase()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &str)> {
        self.by_ordinal.iter().map(|(k, v)| (*k, v.as_str()))
    }
}

/// Tags that are reserved but not implemented; they degrade to `basic`.
const RESERVED: &[&str] = &["mask", "integer array", "float array", "double array"];

static RESERVED_WARNED: AtomicBool = AtomicBool::new(false);

/// A keyword's type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum KeywordType {
    #[default]
    Basic,
    String,
    Boolean,
    Integer,
    Double,
    Float,
    Enumerated(Enumerators),
}

impl KeywordType {
    /// Parse a type tag, including the inline enumerated form
    /// `enumerated(0=COG,1=QUAD)`.
    pub fn from_tag(tag: &str) -> Result<Self, KeywordError> {
        const ENUMERATED: &str = "enumerated";

        let tag = tag.trim();
        let is_enumerated = tag
            .get(..ENUMERATED.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(ENUMERATED));
        if is_enumerated {
            return Self::parse_enumerated(&tag[ENUMERATED.len()..]);
        }

        let lower = tag.to_lowercase();
        Ok(match lower.as_str() {
            "basic" => KeywordType::Basic,
            "string" => KeywordType::String,
            "boolean" => KeywordType::Boolean,
            "integer" => KeywordType::Integer,
            "double" => KeywordType::Double,
            "float" => KeywordType::Float,
            reserved if RESERVED.contains(&reserved) => {
                if !RESERVED_WARNED.swap(true, Ordering::Relaxed) {
                    warn!(tag = %reserved, "Keyword type not implemented, treating as basic");
                }
                KeywordType::Basic
            }
            other => return Err(KeywordError::Type(format!("unknown type tag '{other}'"))),
        })
    }

    fn parse_enumerated(body: &str) -> Result<Self, KeywordError> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(KeywordType::Enumerated(Enumerators::default()));
        }

        let inner = body
            .strip_prefix('(')
            .and_then(|b| b.strip_suffix(')'))
            .ok_or_else(|| KeywordError::Type(format!("malformed enumerated tag '{body}'")))?;

        let mut table = Vec::new();
        for entry in inner.split(',').filter(|e| !e.trim().is_empty()) {
            let (ordinal, name) = entry
                .split_once('=')
                .ok_or_else(|| KeywordError::Type(format!("malformed enumerator '{entry}'")))?;
            let ordinal = ordinal
                .trim()
                .parse::<i64>()
                .map_err(|_| KeywordError::Type(format!("malformed enumerator '{entry}'")))?;
            table.push((ordinal, name.trim().to_string()));
        }
        Ok(KeywordType::Enumerated(Enumerators::new(table)?))
    }

    /// Wire tag for this type.
    pub fn tag(&self) -> String {
        match self {
            KeywordType::Basic => "basic".to_string(),
            KeywordType::String => "string".to_string(),
            KeywordType::Boolean => "boolean".to_string(),
            KeywordType::Integer => "integer".to_string(),
            KeywordType::Double => "double".to_string(),
            KeywordType::Float => "float".to_string(),
            KeywordType::Enumerated(e) => {
                let entries: Vec<String> = e.iter().map(|(k, v)| format!("{k}={v}")).collect();
                format!("enumerated({})", entries.join(","))
            }
        }
    }

    /// Canonicalize `input` to its wire form.
    pub fn translate(&self, input: &str) -> Result<String, KeywordError> {
        match self {
            KeywordType::Basic | KeywordType::String => Ok(input.to_string()),
            KeywordType::Boolean => parse_bool(input).map(|b| if b { "1" } else { "0" }.into()),
            KeywordType::Integer => parse_int(input).map(|i| i.to_string()),
            KeywordType::Double | KeywordType::Float => parse_float(input).map(format_float),
            KeywordType::Enumerated(table) => {
                let trimmed = input.trim();
                if let Some(ordinal) = table.ordinal(trimmed) {
                    return Ok(ordinal.to_string());
                }
                match parse_int(trimmed) {
                    Ok(ordinal) if table.name(ordinal).is_some() => Ok(ordinal.to_string()),
                    _ => Err(KeywordError::Invalid(format!(
                        "'{trimmed}' is not a valid enumerator"
                    ))),
                }
            }
        }
    }

    /// Canonicalize a native value.
    pub fn translate_value(&self, value: &Value) -> Result<String, KeywordError> {
        match (self, value) {
            (KeywordType::Boolean, Value::Bool(b)) => Ok(if *b { "1" } else { "0" }.to_string()),
            (_, Value::Bool(b)) => self.translate(if *b { "1" } else { "0" }),
            (_, other) => self.translate(&other.to_string()),
        }
    }

    /// Validate a translated value.
    pub fn check(&self, wire: &str) -> Result<(), KeywordError> {
        match self {
            KeywordType::Integer => {
                let value = parse_int(wire)?;
                if !(INT_MIN..=INT_MAX).contains(&value) {
                    return Err(KeywordError::Invalid(format!(
                        "{value} is outside the integer range [{INT_MIN}, {INT_MAX}]"
                    )));
                }
                Ok(())
            }
            _ => self.translate(wire).map(|_| ()),
        }
    }

    /// Native view of a value.
    pub fn cast(&self, wire: &str) -> Result<Value, KeywordError> {
        match self {
            KeywordType::Basic | KeywordType::String => Ok(Value::Text(wire.to_string())),
            KeywordType::Boolean => parse_bool(wire).map(Value::Bool),
            KeywordType::Integer => parse_int(wire).map(Value::Int),
            KeywordType::Double | KeywordType::Float => parse_float(wire).map(Value::Float),
            KeywordType::Enumerated(_) => self
                .translate(wire)
                .and_then(|ordinal| parse_int(&ordinal))
                .map(Value::Int),
        }
    }

    /// Human ("ascii") view of a wire value.
    pub fn ascii(&self, wire: &str) -> String {
        match self {
            KeywordType::Enumerated(table) => parse_int(wire)
                .ok()
                .and_then(|ordinal| table.name(ordinal))
                .map(str::to_string)
                .unwrap_or_else(|| wire.to_string()),
            _ => wire.to_string(),
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, KeywordType::Integer)
    }
}

fn parse_bool(input: &str) -> Result<bool, KeywordError> {
    match input.trim().to_lowercase().as_str() {
        "1" | "on" | "yes" | "true" | "t" => Ok(true),
        "0" | "off" | "no" | "false" | "f" => Ok(false),
        other => Err(KeywordError::Invalid(format!(
            "'{other}' is not a boolean value"
        ))),
    }
}

fn parse_float(input: &str) -> Result<f64, KeywordError> {
    input
        .trim()
        .parse::<f64>()
        .map_err(|_| KeywordError::Invalid(format!("'{}' is not a number", input.trim())))
}

/// Parse through a float so `"1e3"` and `"2.0"` are accepted, then truncate.
fn parse_int(input: &str) -> Result<i64, KeywordError> {
    let trimmed = input.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Ok(value);
    }
    let value = parse_float(trimmed)?;
    if value.is_nan() {
        return Err(KeywordError::Invalid(format!(
            "'{trimmed}' is not an integer"
        )));
    }
    if value.abs() >= 9.2e18 {
        return Err(KeywordError::Invalid(format!(
            "'{trimmed}' is outside the integer range [{INT_MIN}, {INT_MAX}]"
        )));
    }
    Ok(value.trunc() as i64)
}

/// Shortest round-trip form: positional for exponents in [-4, 16),
/// otherwise `d.ddde±XX`.
fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    // `{:e}` yields the shortest round-trip digits, e.g. "-1.25e-7".
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if !(-4..16).contains(&exponent) {
        let sign_char = if exponent < 0 { '-' } else { '+' };
        return format!("{sign}{mantissa}e{sign_char}{:02}", exponent.abs());
    }

    let body = if exponent < 0 {
        format!("0.{}{digits}", "0".repeat((-exponent - 1) as usize))
    } else {
        let point = exponent as usize + 1;
        if digits.len() <= point {
            format!("{digits}{}.0", "0".repeat(point - digits.len()))
        } else {
            format!("{}.{}", &digits[..point], &digits[point..])
        }
    };
    format!("{sign}{body}")
}
