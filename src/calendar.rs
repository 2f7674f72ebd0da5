//! Expansion of a `(start_month, end_month)` pair into the calendar days to process.

use std::iter::FusedIterator;
use std::ops::RangeInclusive;

use chrono::{Datelike, NaiveDate};

use crate::domain::YearMonth;
use crate::error::PipelineError;

/// An inclusive range of whole months. The start never follows the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    start: YearMonth,
    end: YearMonth,
}

impl DateRange {
    pub fn new(start: YearMonth, end: YearMonth) -> Result<Self, PipelineError> {
        if end < start {
            return Err(PipelineError::InvalidRange(format!(
                "end month {end} precedes start month {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Parses two `YYYY-MM` strings. Performs no I/O.
    pub fn parse(start: &str, end: &str) -> Result<Self, PipelineError> {
        Self::new(start.parse()?, end.parse()?)
    }

    pub fn start(&self) -> YearMonth {
        self.start
    }

    pub fn end(&self) -> YearMonth {
        self.end
    }

    pub fn first_day(&self) -> NaiveDate {
        self.start.first_day()
    }

    pub fn last_day(&self) -> NaiveDate {
        self.end.last_day()
    }

    pub fn years(&self) -> RangeInclusive<i32> {
        self.start.year()..=self.end.year()
    }

    /// Months of `year` covered by the range: `[start, 12]` in the start year,
    /// `[1, end]` in the end year, `[1, 12]` in between, `[start, end]` when both
    /// fall in the same year. Empty outside the range.
    pub fn months_in_year(&self, year: i32) -> Vec<u32> {
        let (start_year, end_year) = (self.start.year(), self.end.year());
        if year < start_year || year > end_year {
            return Vec::new();
        }
        let first = if year == start_year {
            self.start.month()
        } else {
            1
        };
        let last = if year == end_year { self.end.month() } else { 12 };
        (first..=last).collect()
    }

    pub fn months(&self) -> Vec<YearMonth> {
        self.years()
            .flat_map(|year| {
                self.months_in_year(year)
                    .into_iter()
                    .filter_map(move |month| YearMonth::new(year, month).ok())
            })
            .collect()
    }

    /// Lazily yields every day from the first of the start month through the
    /// last day of the end month. Each call starts a fresh sequence.
    pub fn days(&self) -> DayIter {
        DayIter {
            next: Some(self.first_day()),
            last: self.last_day(),
        }
    }

    pub fn day_count(&self) -> usize {
        (self.last_day() - self.first_day()).num_days() as usize + 1
    }

    /// The part of this range falling inside `year`, if any.
    pub fn within_year(&self, year: i32) -> Option<DateRange> {
        let months = self.months_in_year(year);
        let first = *months.first()?;
        let last = *months.last()?;
        Some(DateRange {
            start: YearMonth::new(year, first).ok()?,
            end: YearMonth::new(year, last).ok()?,
        })
    }

    pub fn split_by_year(&self) -> Vec<DateRange> {
        self.years()
            .filter_map(|year| self.within_year(year))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DayIter {
    next: Option<NaiveDate>,
    last: NaiveDate,
}

impl Iterator for DayIter {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let current = self.next.take()?;
        if current > self.last {
            return None;
        }
        self.next = current.succ_opt();
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = match self.next {
            Some(next) if next <= self.last => (self.last - next).num_days() as usize + 1,
            _ => 0,
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for DayIter {}

impl FusedIterator for DayIter {}

/// `(year, month, day)` view of a date.
pub fn ymd(date: NaiveDate) -> (i32, u32, u32) {
    (date.year(), date.month(), date.day())
}
