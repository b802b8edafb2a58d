//! Driver-neutral result rows.
//!
//! Engine adapters read system views through [`Row`] so they stay
//! independent of the driver that produced the rows. Column names are
//! matched case-insensitively.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::error::{MonitorError, Result};

/// A single column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Any integer type
    Int(i64),
    /// Any floating point or decimal type
    Float(f64),
    /// Character data
    Text(String),
    /// Timestamp, normalized to UTC
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Returns true for SQL NULL
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Timestamp(_) => "timestamp",
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Conversion failure for a single column.
#[derive(Debug, Error)]
pub enum ValueError {
    /// Column not present in the row
    #[error("column is missing")]
    Missing,
    /// Column is NULL where a value is required
    #[error("column is NULL")]
    Null,
    /// Column holds an incompatible value
    #[error("expected {expected}, found {found}")]
    Mismatch {
        expected: &'static str,
        found: String,
    },
}

impl ValueError {
    fn mismatch(expected: &'static str, value: &Value) -> Self {
        Self::Mismatch {
            expected,
            found: match value {
                Value::Text(text) => format!("text '{}'", text.chars().take(32).collect::<String>()),
                other => other.kind().to_string(),
            },
        }
    }
}

/// Types that can be read out of a [`Value`].
pub trait FromValue: Sized {
    /// Converts a non-null value.
    ///
    /// # Errors
    /// Returns [`ValueError::Mismatch`] for incompatible values.
    fn from_value(value: &Value) -> std::result::Result<Self, ValueError>;
}

impl FromValue for String {
    fn from_value(value: &Value) -> std::result::Result<Self, ValueError> {
        match value {
            Value::Text(text) => Ok(text.clone()),
            Value::Int(n) => Ok(n.to_string()),
            Value::Float(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Timestamp(ts) => Ok(ts.to_rfc3339()),
            Value::Null => Err(ValueError::Null),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> std::result::Result<Self, ValueError> {
        match value {
            Value::Int(n) => Ok(*n),
            Value::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| ValueError::mismatch("int", value)),
            Value::Bool(b) => Ok(Self::from(*b)),
            _ => Err(ValueError::mismatch("int", value)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> std::result::Result<Self, ValueError> {
        let wide = i64::from_value(value)?;
        Self::try_from(wide).map_err(|_| ValueError::mismatch("int32", value))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> std::result::Result<Self, ValueError> {
        match value {
            Value::Float(n) => Ok(*n),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(n) => Ok(*n as Self),
            Value::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| ValueError::mismatch("float", value)),
            _ => Err(ValueError::mismatch("float", value)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> std::result::Result<Self, ValueError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            Value::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(true),
                "false" | "f" | "no" | "n" | "0" => Ok(false),
                _ => Err(ValueError::mismatch("bool", value)),
            },
            _ => Err(ValueError::mismatch("bool", value)),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> std::result::Result<Self, ValueError> {
        match value {
            Value::Timestamp(ts) => Ok(*ts),
            Value::Text(text) => parse_timestamp(text).ok_or_else(|| ValueError::mismatch("timestamp", value)),
            _ => Err(ValueError::mismatch("timestamp", value)),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// An ordered row of named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    /// Creates an empty row.
    pub const fn new() -> Self {
        Self {
            columns: Vec::new(),
        }
    }

    /// Appends a column. Names are stored lower-cased.
    #[must_use]
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.push(name, value);
        self
    }

    /// Appends a column in place.
    pub fn push(&mut self, name: &str, value: impl Into<Value>) {
        self.columns.push((name.to_ascii_lowercase(), value.into()));
    }

    /// Number of columns
    pub const fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns true when the row has no columns
    pub const fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Raw column lookup
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Reads a required column.
    ///
    /// # Errors
    /// Returns an extraction error naming the column and view when the column
    /// is missing, NULL or of an incompatible type.
    pub fn get_field<T: FromValue>(&self, name: &str, view_context: Option<&str>) -> Result<T> {
        match self.get(name) {
            None => Err(MonitorError::parse_field(name, view_context, ValueError::Missing)),
            Some(Value::Null) => Err(MonitorError::parse_field(name, view_context, ValueError::Null)),
            Some(value) => T::from_value(value)
                .map_err(|e| MonitorError::parse_field(name, view_context, e)),
        }
    }

    /// Reads an optional column. Missing and NULL columns yield `None`.
    ///
    /// # Errors
    /// Returns an extraction error when the value has an incompatible type.
    pub fn get_opt<T: FromValue>(&self, name: &str, view_context: Option<&str>) -> Result<Option<T>> {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::from_value(value)
                .map(Some)
                .map_err(|e| MonitorError::parse_field(name, view_context, e)),
        }
    }

    /// Reads an optional text column, treating blank text as absent.
    ///
    /// # Errors
    /// Returns an extraction error when the value has an incompatible type.
    pub fn get_text(&self, name: &str, view_context: Option<&str>) -> Result<Option<String>> {
        Ok(self
            .get_opt::<String>(name, view_context)?
            .filter(|text| !text.trim().is_empty()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let row = Row::new().with("NODE_NAME", "v_db_node0001");
        assert_eq!(
            row.get_field::<String>("node_name", None).unwrap(),
            "v_db_node0001"
        );
    }

    #[test]
    fn test_missing_and_null_columns() {
        let row = Row::new().with("info", Value::Null);

        let error = row.get_field::<String>("info", Some("processlist")).unwrap_err();
        assert!(error.to_string().contains("'info'"));
        assert!(error.to_string().contains("processlist"));

        assert!(row.get_field::<String>("user", None).is_err());
        assert_eq!(row.get_opt::<String>("info", None).unwrap(), None);
        assert_eq!(row.get_opt::<String>("user", None).unwrap(), None);
    }

    #[test]
    fn test_numeric_text_is_accepted() {
        let row = Row::new()
            .with("transaction_id", "45035996273705000")
            .with("flag", "t")
            .with("avg", 3_i64);
        assert_eq!(
            row.get_field::<i64>("transaction_id", None).unwrap(),
            45_035_996_273_705_000
        );
        assert!(row.get_field::<bool>("flag", None).unwrap());
        assert!((row.get_field::<f64>("avg", None).unwrap() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_mismatch_is_reported() {
        let row = Row::new().with("id", "abc");
        let error = row.get_field::<i64>("id", None).unwrap_err();
        assert!(matches!(error, MonitorError::Extraction { .. }));
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        for text in [
            "2024-03-01T12:30:00Z",
            "2024-03-01 12:30:00",
            "2024-03-01 12:30:00.000",
            "2024-03-01 13:30:00+01",
        ] {
            let row = Row::new().with("ts", text);
            assert_eq!(
                row.get_field::<DateTime<Utc>>("ts", None).unwrap(),
                expected,
                "failed for {text}"
            );
        }
    }

    #[test]
    fn test_blank_text_is_absent() {
        let row = Row::new().with("current_statement", "   ");
        assert_eq!(row.get_text("current_statement", None).unwrap(), None);
    }
}
