//! Extraction queries and their SQL rendering.

use std::fmt::Write;

use snafu::prelude::*;

use crate::error::{ExtractError, MissingOrderingSnafu};
use crate::source::SourceTableRef;
use crate::value::{RangeFilter, Value};

/// How one query slices the source table.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    /// `LIMIT limit OFFSET offset`.
    Offset { offset: u64, limit: usize },
    /// `WHERE column > after ORDER BY column LIMIT limit`.
    ///
    /// The cursor column must be unique and only ever increase; rows sharing
    /// a cursor value across a batch boundary would be skipped.
    Cursor {
        column: String,
        after: Option<Value>,
        limit: usize,
    },
    /// Every row matching the filter in one call.
    All,
}

/// One ordered query against a source table.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractQuery {
    pub table: SourceTableRef,
    pub filter: Option<RangeFilter>,
    /// Never empty for paginated queries.
    pub order_by: Vec<String>,
    pub page: Page,
}

impl ExtractQuery {
    /// Build a query, rejecting pagination without a deterministic ordering.
    pub fn new(
        table: SourceTableRef,
        filter: Option<RangeFilter>,
        order_by: Vec<String>,
        page: Page,
    ) -> Result<Self, ExtractError> {
        let order_by = match &page {
            Page::Cursor { column, .. } => vec![column.clone()],
            _ => order_by,
        };
        ensure!(
            !order_by.is_empty(),
            MissingOrderingSnafu {
                table: table.to_string()
            }
        );
        Ok(Self {
            table,
            filter,
            order_by,
            page,
        })
    }

    pub fn limit(&self) -> Option<usize> {
        match self.page {
            Page::Offset { limit, .. } | Page::Cursor { limit, .. } => Some(limit),
            Page::All => None,
        }
    }

    /// Render as SQL with quoted identifiers and escaped literals.
    ///
    /// ```
    /// use chrono::NaiveDate;
    /// use ferry::source::{ExtractQuery, Page, SourceTableRef};
    /// use ferry::value::RangeFilter;
    ///
    /// let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    /// let query = ExtractQuery::new(
    ///     SourceTableRef::new("ORDERS").in_schema("main"),
    ///     Some(RangeFilter::between("REPORTING_DATE", day, day)),
    ///     vec!["ORDER_ID".into()],
    ///     Page::Offset { offset: 100, limit: 50 },
    /// )
    /// .unwrap();
    /// assert_eq!(
    ///     query.to_sql(),
    ///     "SELECT * FROM \"main\".\"ORDERS\" WHERE date(\"REPORTING_DATE\") BETWEEN '2024-03-01' AND '2024-03-01' ORDER BY \"ORDER_ID\" LIMIT 50 OFFSET 100"
    /// );
    /// ```
    pub fn to_sql(&self) -> String {
        let mut sql = format!("SELECT * FROM {}", table_sql(&self.table));

        let mut predicates = Vec::new();
        if let Some(filter) = &self.filter {
            predicates.push(filter_sql(filter));
        }
        if let Page::Cursor {
            column,
            after: Some(after),
            ..
        } = &self.page
        {
            predicates.push(format!("{} > {}", quote_ident(column), render_literal(after)));
        }
        if !predicates.is_empty() {
            let _ = write!(sql, " WHERE {}", predicates.join(" AND "));
        }

        let order: Vec<String> = self.order_by.iter().map(|c| quote_ident(c)).collect();
        let _ = write!(sql, " ORDER BY {}", order.join(", "));

        match &self.page {
            Page::Offset { offset, limit } => {
                let _ = write!(sql, " LIMIT {limit} OFFSET {offset}");
            }
            Page::Cursor { limit, .. } => {
                let _ = write!(sql, " LIMIT {limit}");
            }
            Page::All => {}
        }
        sql
    }

    /// `SELECT COUNT(*)` over the same table and window.
    pub fn count_sql(table: &SourceTableRef, filter: Option<&RangeFilter>) -> String {
        let mut sql = format!("SELECT COUNT(*) FROM {}", table_sql(table));
        if let Some(filter) = filter {
            let _ = write!(sql, " WHERE {}", filter_sql(filter));
        }
        sql
    }
}

fn table_sql(table: &SourceTableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
        None => quote_ident(&table.name),
    }
}

fn filter_sql(filter: &RangeFilter) -> String {
    let column = quote_ident(&filter.column);
    match filter.end {
        Some(end) => format!("date({column}) BETWEEN '{}' AND '{end}'", filter.start),
        None => format!("date({column}) >= '{}'", filter.start),
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a value as a SQL literal.
pub fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Decimal(d) if is_numeric_literal(d) => d.clone(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn is_numeric_literal(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        && s.parse::<f64>().is_ok()
}
