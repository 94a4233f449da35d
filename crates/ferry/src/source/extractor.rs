//! Batch extraction over a source table.
//!
//! The extractor turns an [`ExtractPlan`] into a sequence of ordered queries
//! and hands back one [`Batch`] per call. It stops on a zero-row batch, on a
//! short batch (fewer rows than requested), or when the time budget runs out.
//! A budget stop is reported separately so callers never mistake it for a
//! complete extraction.

use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use snafu::prelude::*;
use tracing::debug;

use crate::error::{CursorColumnMissingSnafu, ExtractError, FetchSnafu};
use crate::pool::SourcePool;
use crate::source::{ExtractQuery, Page, SourceTableRef};
use crate::value::{Batch, RangeFilter, Value};

/// How successive queries walk the table.
#[derive(Debug, Clone, PartialEq)]
pub enum Pagination {
    /// Numeric offset advanced by the rows actually returned.
    Offset,
    /// Keyset pagination on a unique, increasing column.
    Cursor { column: String },
    /// One query per date window of `window_days` days over `[start, end]`.
    Range {
        column: String,
        start: NaiveDate,
        end: NaiveDate,
        window_days: u32,
    },
}

/// Everything the extractor needs to know about one table read.
#[derive(Debug, Clone)]
pub struct ExtractPlan {
    pub table: SourceTableRef,
    pub order_by: Vec<String>,
    /// Window applied to offset and cursor queries.
    pub filter: Option<RangeFilter>,
    pub pagination: Pagination,
    pub batch_size: usize,
    pub time_budget: Option<Duration>,
}

/// Result of one [`BatchExtractor::next_batch`] call.
#[derive(Debug)]
pub enum Extracted {
    Batch(Batch),
    /// Nothing left to read.
    Exhausted,
    /// The time budget ran out; the rows read so far are a prefix only.
    BudgetExceeded,
}

/// Counters describing how far extraction got.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractProgress {
    /// Non-empty batches returned.
    pub batches: u64,
    pub rows: u64,
    /// Queries issued, including empty ones.
    pub queries: u64,
    /// Human-readable position of the next query.
    pub position: String,
}

enum Cursor {
    Offset(u64),
    After(Option<Value>),
    Window(NaiveDate),
}

/// Pulls ordered batches from the source pool according to a plan.
pub struct BatchExtractor {
    pool: SourcePool,
    plan: ExtractPlan,
    cursor: Cursor,
    started: Instant,
    progress: ExtractProgress,
    finished: bool,
}

impl BatchExtractor {
    pub fn new(pool: SourcePool, plan: ExtractPlan) -> Self {
        let cursor = match &plan.pagination {
            Pagination::Offset => Cursor::Offset(0),
            Pagination::Cursor { .. } => Cursor::After(None),
            Pagination::Range { start, .. } => Cursor::Window(*start),
        };
        let mut extractor = Self {
            pool,
            plan,
            cursor,
            started: Instant::now(),
            progress: ExtractProgress::default(),
            finished: false,
        };
        extractor.progress.position = extractor.position();
        extractor
    }

    pub fn progress(&self) -> &ExtractProgress {
        &self.progress
    }

    pub fn plan(&self) -> &ExtractPlan {
        &self.plan
    }

    /// Fetch the next non-empty batch.
    pub async fn next_batch(&mut self) -> Result<Extracted, ExtractError> {
        loop {
            if self.finished {
                return Ok(Extracted::Exhausted);
            }
            if self.budget_exhausted() {
                debug!(
                    table = %self.plan.table,
                    position = %self.progress.position,
                    rows = self.progress.rows,
                    "Extraction time budget exceeded"
                );
                self.finished = true;
                return Ok(Extracted::BudgetExceeded);
            }

            let Some(query) = self.next_query()? else {
                self.finished = true;
                return Ok(Extracted::Exhausted);
            };

            let batch = self.pool.fetch(&query).await.context(FetchSnafu {
                position: self.progress.position.clone(),
            })?;
            self.progress.queries += 1;
            self.advance(&query, &batch)?;
            self.progress.position = self.position();

            if batch.is_empty() {
                // Empty range windows are skipped; anything else is the end.
                if !matches!(self.cursor, Cursor::Window(_)) {
                    self.finished = true;
                }
                continue;
            }

            self.progress.batches += 1;
            self.progress.rows += batch.len() as u64;
            debug!(
                table = %self.plan.table,
                batch = self.progress.batches,
                rows = batch.len(),
                total_rows = self.progress.rows,
                "Extracted batch"
            );
            return Ok(Extracted::Batch(batch));
        }
    }

    fn budget_exhausted(&self) -> bool {
        self.plan
            .time_budget
            .is_some_and(|budget| self.started.elapsed() >= budget)
    }

    fn next_query(&self) -> Result<Option<ExtractQuery>, ExtractError> {
        let limit = self.plan.batch_size.max(1);
        let (filter, page) = match (&self.cursor, &self.plan.pagination) {
            (Cursor::Offset(offset), _) => (
                self.plan.filter.clone(),
                Page::Offset {
                    offset: *offset,
                    limit,
                },
            ),
            (Cursor::After(after), Pagination::Cursor { column }) => (
                self.plan.filter.clone(),
                Page::Cursor {
                    column: column.clone(),
                    after: after.clone(),
                    limit,
                },
            ),
            (
                Cursor::Window(start),
                Pagination::Range {
                    column,
                    end,
                    window_days,
                    ..
                },
            ) => {
                if start > end {
                    return Ok(None);
                }
                let window_end = window_end(*start, *window_days).min(*end);
                (
                    Some(RangeFilter::between(column.clone(), *start, window_end)),
                    Page::All,
                )
            }
            _ => return Ok(None),
        };

        ExtractQuery::new(self.plan.table.clone(), filter, self.plan.order_by.clone(), page)
            .map(Some)
    }

    fn advance(&mut self, query: &ExtractQuery, batch: &Batch) -> Result<(), ExtractError> {
        let short = query.limit().is_some_and(|limit| batch.len() < limit);

        match (&mut self.cursor, &self.plan.pagination) {
            (Cursor::Offset(offset), _) => {
                *offset += batch.len() as u64;
                if short && !batch.is_empty() {
                    self.finished = true;
                }
            }
            (Cursor::After(after), Pagination::Cursor { column }) => {
                if !batch.is_empty() {
                    let last = batch
                        .last_value(column)
                        .context(CursorColumnMissingSnafu { column })?;
                    *after = Some(last.clone());
                }
                if short && !batch.is_empty() {
                    self.finished = true;
                }
            }
            (
                Cursor::Window(start),
                Pagination::Range {
                    end, window_days, ..
                },
            ) => {
                let next = window_end(*start, *window_days).min(*end).checked_add_days(Days::new(1));
                match next {
                    Some(next) => *start = next,
                    None => self.finished = true,
                }
            }
            _ => self.finished = true,
        }
        Ok(())
    }

    fn position(&self) -> String {
        match &self.cursor {
            Cursor::Offset(offset) => format!("offset {offset}"),
            Cursor::After(None) => "cursor start".to_string(),
            Cursor::After(Some(after)) => format!("cursor after {after}"),
            Cursor::Window(start) => format!("window starting {start}"),
        }
    }
}

fn window_end(start: NaiveDate, window_days: u32) -> NaiveDate {
    let span = u64::from(window_days.max(1) - 1);
    start.checked_add_days(Days::new(span)).unwrap_or(NaiveDate::MAX)
}
