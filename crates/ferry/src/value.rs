//! Source-side values and the batches that carry them.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A sink-compatible record: column name to normalized value, in target column order.
pub type Record = IndexMap<String, serde_json::Value>;

/// A single value as read from the source warehouse.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Arbitrary-precision decimal kept as its source text.
    Decimal(String),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
    /// Wall-clock timestamp without zone.
    DateTime(NaiveDateTime),
    /// Instant in time.
    Timestamp(DateTime<Utc>),
    /// Semi-structured value (VARIANT, OBJECT, ARRAY).
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Calendar date carried by a temporal value, or by text starting with `YYYY-MM-DD`.
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            Value::DateTime(dt) => Some(dt.date()),
            Value::Timestamp(ts) => Some(ts.date_naive()),
            Value::String(s) => parse_leading_date(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => 2,
            Value::String(_) => 3,
            Value::Date(_) | Value::DateTime(_) | Value::Timestamp(_) => 4,
            Value::Time(_) => 5,
            Value::Json(_) => 6,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.parse().ok(),
            _ => None,
        }
    }

    fn as_instant(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Date(d) => d.and_hms_opt(0, 0, 0),
            Value::DateTime(dt) => Some(*dt),
            Value::Timestamp(ts) => Some(ts.naive_utc()),
            _ => None,
        }
    }

    /// Total order used for `ORDER BY` emulation and cursor comparison.
    ///
    /// Nulls sort first; values of different kinds sort by kind.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) if a.rank() == b.rank() && a.rank() == 2 => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => Ordering::Equal,
            },
            (a, b) if a.rank() == b.rank() && a.rank() == 4 => a.as_instant().cmp(&b.as_instant()),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Decimal(d) | Value::String(d) => write!(f, "{d}"),
            Value::Date(d) => write!(f, "{d}"),
            Value::Time(t) => write!(f, "{t}"),
            Value::DateTime(dt) => write!(f, "{dt}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Json(v) => write!(f, "{v}"),
        }
    }
}

/// Parse the `YYYY-MM-DD` prefix of a string.
pub fn parse_leading_date(s: &str) -> Option<NaiveDate> {
    s.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

/// An ordered slice of source rows plus their column names.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Batch {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in the last row, used to advance a cursor.
    pub fn last_value(&self, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c == column)?;
        self.rows.last().and_then(|row| row.get(index))
    }
}

/// An inclusive date window over one column.
///
/// Windows bound incremental syncs, chunked syncs, stale-row cleanup and
/// validation counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeFilter {
    pub column: String,
    pub start: NaiveDate,
    /// `None` leaves the window open-ended.
    pub end: Option<NaiveDate>,
}

impl RangeFilter {
    pub fn between(column: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            column: column.into(),
            start,
            end: Some(end),
        }
    }

    pub fn at_least(column: impl Into<String>, start: NaiveDate) -> Self {
        Self {
            column: column.into(),
            start,
            end: None,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && self.end.is_none_or(|end| date <= end)
    }

    /// Whether a source value falls inside the window. Nulls never match.
    pub fn matches(&self, value: &Value) -> bool {
        value.as_date().is_some_and(|d| self.contains(d))
    }

    /// Whether a normalized (sink-side) value falls inside the window.
    pub fn matches_json(&self, value: &serde_json::Value) -> bool {
        value
            .as_str()
            .and_then(parse_leading_date)
            .is_some_and(|d| self.contains(d))
    }
}

impl fmt::Display for RangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{} in [{}, {}]", self.column, self.start, end),
            None => write!(f, "{} >= {}", self.column, self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_sort_cmp_mixed_numeric() {
        assert_eq!(
            Value::Int(2).sort_cmp(&Value::Decimal("1.5".into())),
            Ordering::Greater
        );
        assert_eq!(Value::Null.sort_cmp(&Value::Int(0)), Ordering::Less);
    }

    #[test]
    fn test_sort_cmp_temporal() {
        let d = Value::Date(date("2024-03-01"));
        let dt = Value::DateTime(date("2024-03-01").and_hms_opt(10, 0, 0).unwrap());
        assert_eq!(d.sort_cmp(&dt), Ordering::Less);
    }

    #[test]
    fn test_range_filter_matches() {
        let window = RangeFilter::between("REPORTING_DATE", date("2024-01-01"), date("2024-01-07"));
        assert!(window.matches(&Value::Date(date("2024-01-07"))));
        assert!(window.matches(&Value::String("2024-01-03T23:59:59".into())));
        assert!(!window.matches(&Value::Date(date("2024-01-08"))));
        assert!(!window.matches(&Value::Null));

        let open = RangeFilter::at_least("LAST_MODIFIED", date("2024-01-01"));
        assert!(open.matches_json(&serde_json::json!("2030-05-05T00:00:00Z")));
        assert!(!open.matches_json(&serde_json::json!(20240101)));
    }

    #[test]
    fn test_batch_last_value() {
        let batch = Batch::new(
            vec!["ID".into(), "NAME".into()],
            vec![
                vec![Value::Int(1), Value::String("a".into())],
                vec![Value::Int(7), Value::String("b".into())],
            ],
        );
        assert_eq!(batch.last_value("ID"), Some(&Value::Int(7)));
        assert_eq!(batch.last_value("MISSING"), None);
    }
}
