//! Row normalization: source values into sink-compatible records.
//!
//! Every table goes through the same routine. Temporal values become ISO-8601
//! strings, decimals become canonical decimal strings (never binary floats),
//! structured values become JSON text, and everything else passes through.

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::error::NormalizeError;
use crate::schema::TableSchema;
use crate::value::{Record, Value};

/// Normalize a single value.
///
/// ```
/// use ferry::normalize::normalize_value;
/// use ferry::value::Value;
///
/// let json = normalize_value("AMOUNT", &Value::Decimal("001234.5678".into())).unwrap();
/// assert_eq!(json, serde_json::json!("1234.5678"));
/// ```
pub fn normalize_value(column: &str, value: &Value) -> Result<JsonValue, NormalizeError> {
    Ok(match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Int(i) => JsonValue::from(*i),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(f.to_string())),
        Value::Decimal(d) => JsonValue::String(canonical_decimal(column, d)?),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
        Value::Time(t) => JsonValue::String(t.format("%H:%M:%S%.f").to_string()),
        Value::DateTime(dt) => JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Value::Timestamp(ts) => JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        Value::Json(v @ (JsonValue::Object(_) | JsonValue::Array(_))) => {
            JsonValue::String(v.to_string())
        }
        Value::Json(v) => v.clone(),
    })
}

/// Normalize one row into a record keyed by column name.
pub fn normalize(columns: &[String], row: &[Value]) -> Result<Record, NormalizeError> {
    columns
        .iter()
        .zip(row)
        .map(|(column, value)| Ok((column.clone(), normalize_value(column, value)?)))
        .collect()
}

/// Largest exponent magnitude accepted in decimal text. Covers the range of
/// SQL NUMERIC/DECIMAL columns.
const MAX_DECIMAL_EXPONENT: u32 = 130;

/// Canonical decimal text: optional `-`, no redundant leading zeros, scale
/// preserved, exponent expanded, negative zero folded to zero.
fn canonical_decimal(column: &str, raw: &str) -> Result<String, NormalizeError> {
    let invalid = || NormalizeError::InvalidDecimal {
        column: column.to_string(),
        value: raw.to_string(),
    };

    let text = raw.trim();
    let (negative, unsigned) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };

    let (mantissa, exponent) = match unsigned.find(['e', 'E']) {
        Some(pos) => {
            let exp: i32 = unsigned[pos + 1..].parse().map_err(|_| invalid())?;
            if exp.unsigned_abs() > MAX_DECIMAL_EXPONENT {
                return Err(invalid());
            }
            (&unsigned[..pos], exp)
        }
        None => (unsigned, 0),
    };

    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if (int_part.is_empty() && frac_part.is_empty())
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    // Shift the decimal point by the exponent over the full digit string.
    let digits = format!("{int_part}{frac_part}");
    let point = i64::try_from(int_part.len()).map_err(|_| invalid())? + i64::from(exponent);
    let (int_digits, frac_digits) = if point <= 0 {
        let zeros = "0".repeat(usize::try_from(-point).map_err(|_| invalid())?);
        ("0".to_string(), format!("{zeros}{digits}"))
    } else {
        let point = usize::try_from(point).map_err(|_| invalid())?;
        if point >= digits.len() {
            let zeros = "0".repeat(point - digits.len());
            (format!("{digits}{zeros}"), String::new())
        } else {
            (digits[..point].to_string(), digits[point..].to_string())
        }
    };

    let int_digits = int_digits.trim_start_matches('0');
    let int_digits = if int_digits.is_empty() { "0" } else { int_digits };
    let is_zero = int_digits == "0" && frac_digits.bytes().all(|b| b == b'0');
    let sign = if negative && !is_zero { "-" } else { "" };

    Ok(if frac_digits.is_empty() {
        format!("{sign}{int_digits}")
    } else {
        format!("{sign}{int_digits}.{frac_digits}")
    })
}

/// What to do with a null in the partition column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullPartitionPolicy {
    /// Fail the batch.
    #[default]
    Reject,
    /// Store a documented placeholder value.
    Bucket(String),
    /// Substitute the run date. Changes historical meaning on re-runs.
    Today,
}

/// Shapes normalized rows to a target schema and enforces key rules.
pub struct RecordShaper {
    target_columns: Vec<String>,
    key_columns: Vec<String>,
    partition: Option<(String, NullPartitionPolicy)>,
    today: String,
    dropped_warned: bool,
}

impl RecordShaper {
    pub fn new(
        schema: &TableSchema,
        key_columns: &[String],
        partition: Option<(String, NullPartitionPolicy)>,
        today: chrono::NaiveDate,
    ) -> Result<Self, NormalizeError> {
        for key in key_columns {
            if schema.column(key).is_none() {
                return Err(NormalizeError::UnknownKeyColumn {
                    column: key.clone(),
                });
            }
        }
        Ok(Self {
            target_columns: schema.column_names().map(str::to_string).collect(),
            key_columns: key_columns.to_vec(),
            partition,
            today: today.format("%Y-%m-%d").to_string(),
            dropped_warned: false,
        })
    }

    /// Normalize a batch and project it onto the target columns.
    ///
    /// `first_row` is the index of the batch's first row within the whole
    /// extraction, used in error messages.
    pub fn shape(
        &mut self,
        columns: &[String],
        rows: &[Vec<Value>],
        first_row: usize,
    ) -> Result<Vec<Record>, NormalizeError> {
        self.warn_dropped(columns);

        let mut aliased_rows = Vec::new();
        let mut records = Vec::with_capacity(rows.len());

        for (offset, row) in rows.iter().enumerate() {
            let row_index = first_row + offset;
            let mut normalized = normalize(columns, row)?;

            let mut record: Record = self
                .target_columns
                .iter()
                .map(|c| (c.clone(), normalized.swap_remove(c).unwrap_or(JsonValue::Null)))
                .collect();

            for key in &self.key_columns {
                if record.get(key).is_none_or(JsonValue::is_null) {
                    return Err(NormalizeError::NullKey {
                        column: key.clone(),
                        row: row_index,
                    });
                }
            }

            if let Some((column, policy)) = &self.partition
                && record.get(column).is_none_or(JsonValue::is_null)
            {
                match policy {
                    NullPartitionPolicy::Reject => {
                        return Err(NormalizeError::NullPartition {
                            column: column.clone(),
                            row: row_index,
                        });
                    }
                    NullPartitionPolicy::Bucket(bucket) => {
                        record.insert(column.clone(), JsonValue::String(bucket.clone()));
                    }
                    NullPartitionPolicy::Today => {
                        record.insert(column.clone(), JsonValue::String(self.today.clone()));
                        aliased_rows.push(row_index);
                    }
                }
            }

            records.push(record);
        }

        if !aliased_rows.is_empty() {
            warn!(
                rows = ?aliased_rows,
                date = %self.today,
                "Null partition values replaced with the run date"
            );
        }
        Ok(records)
    }

    fn warn_dropped(&mut self, columns: &[String]) {
        if self.dropped_warned {
            return;
        }
        let dropped: Vec<&str> = columns
            .iter()
            .filter(|c| !self.target_columns.contains(c))
            .map(String::as_str)
            .collect();
        if !dropped.is_empty() {
            warn!(columns = ?dropped, "Source columns missing from target schema are not synced");
            self.dropped_warned = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType};
    use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

    fn decimal(s: &str) -> String {
        canonical_decimal("c", s).unwrap()
    }

    #[test]
    fn test_canonical_decimal() {
        assert_eq!(decimal("1234.5678"), "1234.5678");
        assert_eq!(decimal("001234.5678"), "1234.5678");
        assert_eq!(decimal("-0.00"), "0.00");
        assert_eq!(decimal("+12.10"), "12.10");
        assert_eq!(decimal(".5"), "0.5");
        assert_eq!(decimal("1.5E3"), "1500");
        assert_eq!(decimal("12345e-7"), "0.0012345");
        assert_eq!(decimal("99999999999999999999.000000001"), "99999999999999999999.000000001");
    }

    #[test]
    fn test_invalid_decimal() {
        assert!(canonical_decimal("c", "12a").is_err());
        assert!(canonical_decimal("c", ".").is_err());
        assert!(canonical_decimal("c", "1e").is_err());
    }

    #[test]
    fn test_decimal_exponent_is_bounded() {
        assert_eq!(decimal("1e130").len(), 131);
        assert_eq!(decimal("1e-130").len(), 132);
        assert!(canonical_decimal("c", "1e131").is_err());
        assert!(canonical_decimal("c", "1e-131").is_err());
        assert!(canonical_decimal("c", "1e2000000000").is_err());
        assert!(canonical_decimal("c", "-1E-2147483648").is_err());
    }

    #[test]
    fn test_temporal_values_are_iso() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            normalize_value("d", &Value::Date(date)).unwrap(),
            JsonValue::from("2024-02-29")
        );

        let time = NaiveTime::from_hms_milli_opt(13, 5, 9, 250).unwrap();
        assert_eq!(
            normalize_value("t", &Value::Time(time)).unwrap(),
            JsonValue::from("13:05:09.250")
        );

        let ts: DateTime<Utc> = "2024-02-29T13:05:09.123456Z".parse().unwrap();
        let normalized = normalize_value("ts", &Value::Timestamp(ts)).unwrap();
        let reparsed: DateTime<Utc> = normalized.as_str().unwrap().parse().unwrap();
        assert_eq!(reparsed, ts);
    }

    #[test]
    fn test_structured_values_become_text() {
        let value = Value::Json(serde_json::json!({"a": [1, 2]}));
        assert_eq!(
            normalize_value("v", &value).unwrap(),
            JsonValue::from(r#"{"a":[1,2]}"#)
        );
        assert_eq!(
            normalize_value("v", &Value::Json(JsonValue::from(3))).unwrap(),
            JsonValue::from(3)
        );
    }

    #[test]
    fn test_passthrough_and_nulls() {
        assert_eq!(normalize_value("n", &Value::Null).unwrap(), JsonValue::Null);
        assert_eq!(normalize_value("i", &Value::Int(7)).unwrap(), JsonValue::from(7));
        assert_eq!(
            normalize_value("f", &Value::Float(f64::NAN)).unwrap(),
            JsonValue::from("NaN")
        );
    }

    fn schema() -> TableSchema {
        TableSchema::new(
            ["ID", "DAY", "AMOUNT"]
                .into_iter()
                .map(|name| ColumnDef {
                    name: name.into(),
                    column_type: ColumnType::String,
                    nullable: true,
                })
                .collect(),
        )
    }

    fn columns() -> Vec<String> {
        vec!["ID".into(), "DAY".into(), "EXTRA".into()]
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_shape_projects_onto_target() {
        let mut shaper = RecordShaper::new(&schema(), &["ID".into()], None, today()).unwrap();
        let rows = vec![vec![Value::Int(1), Value::Null, Value::String("x".into())]];
        let records = shaper.shape(&columns(), &rows, 0).unwrap();

        let keys: Vec<&str> = records[0].keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ID", "DAY", "AMOUNT"]);
        assert_eq!(records[0]["AMOUNT"], JsonValue::Null);
    }

    #[test]
    fn test_null_key_rejected() {
        let mut shaper = RecordShaper::new(&schema(), &["ID".into()], None, today()).unwrap();
        let rows = vec![
            vec![Value::Int(1), Value::Null, Value::Null],
            vec![Value::Null, Value::Null, Value::Null],
        ];
        let err = shaper.shape(&columns(), &rows, 10).unwrap_err();
        assert!(matches!(err, NormalizeError::NullKey { row: 11, .. }));
    }

    #[test]
    fn test_unknown_key_column() {
        assert!(RecordShaper::new(&schema(), &["NOPE".into()], None, today()).is_err());
    }

    #[test]
    fn test_null_partition_policies() {
        let rows = vec![vec![Value::Int(1), Value::Null, Value::Null]];

        let mut reject = RecordShaper::new(
            &schema(),
            &[],
            Some(("DAY".into(), NullPartitionPolicy::Reject)),
            today(),
        )
        .unwrap();
        assert!(matches!(
            reject.shape(&columns(), &rows, 0),
            Err(NormalizeError::NullPartition { .. })
        ));

        let mut bucket = RecordShaper::new(
            &schema(),
            &[],
            Some(("DAY".into(), NullPartitionPolicy::Bucket("1970-01-01".into()))),
            today(),
        )
        .unwrap();
        assert_eq!(bucket.shape(&columns(), &rows, 0).unwrap()[0]["DAY"], "1970-01-01");

        let mut legacy = RecordShaper::new(
            &schema(),
            &[],
            Some(("DAY".into(), NullPartitionPolicy::Today)),
            today(),
        )
        .unwrap();
        assert_eq!(legacy.shape(&columns(), &rows, 0).unwrap()[0]["DAY"], "2024-06-01");
    }
}
