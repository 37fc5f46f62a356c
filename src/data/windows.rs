//! Period boundaries resolved against a stratum's time index.

use std::ops::Range;

use crate::data::registry::TimeIndex;
use crate::domain::PeriodBoundaries;
use crate::error::AppError;

/// Index ranges used by fitting and aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisWindows {
    /// First index on or after the intervention date. `[0, post_start)` is the
    /// pre-intervention fitting window.
    pub post_start: usize,
    /// First index of the evaluation window.
    pub eval_start: usize,
    /// Last index (inclusive) of the evaluation window.
    pub eval_end: usize,
    /// First index of the cumulative prevented-cases sum.
    pub prevented_start: usize,
    pub len: usize,
}

impl AnalysisWindows {
    pub fn resolve(
        index: &TimeIndex,
        boundaries: &PeriodBoundaries,
        prevented_start: Option<chrono::NaiveDate>,
    ) -> Result<Self, AppError> {
        let len = index.len();
        let post_start = index.position_at_or_after(boundaries.intervention);
        if post_start == 0 {
            return Err(AppError::malformed(format!(
                "no observations before the intervention date {}",
                boundaries.intervention
            )));
        }

        let eval_start = index.position_at_or_after(boundaries.eval_start);
        let eval_end = match boundaries.eval_end {
            Some(end) => {
                if end > index.last() {
                    return Err(AppError::malformed(format!(
                        "evaluation end {end} is after the last observation {}",
                        index.last()
                    )));
                }
                index.position_at_or_before(end).unwrap_or(0)
            }
            None => len - 1,
        };
        if eval_start >= len || eval_start > eval_end {
            return Err(AppError::malformed(format!(
                "evaluation window {}..{:?} contains no observations",
                boundaries.eval_start, boundaries.eval_end
            )));
        }

        let prevented_start = match prevented_start {
            Some(date) => index.position_at_or_after(date),
            None => post_start,
        };

        Ok(Self {
            post_start,
            eval_start,
            eval_end,
            prevented_start,
            len,
        })
    }

    pub fn pre(&self) -> Range<usize> {
        0..self.post_start
    }

    pub fn eval(&self) -> Range<usize> {
        self.eval_start..self.eval_end + 1
    }

    pub fn n_pre(&self) -> usize {
        self.post_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Periodicity;
    use chrono::NaiveDate;

    fn index(n: usize) -> TimeIndex {
        let mut dates = Vec::new();
        let mut d = NaiveDate::from_ymd_opt(2000, 1, 1).unwrap();
        for _ in 0..n {
            dates.push(d);
            d = Periodicity::Monthly.next(d).unwrap();
        }
        TimeIndex::new(dates, Periodicity::Monthly).unwrap()
    }

    fn ymd(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    #[test]
    fn resolves_open_ended_evaluation() {
        let b = PeriodBoundaries {
            intervention: ymd(2003, 1),
            eval_start: ymd(2004, 1),
            eval_end: None,
        };
        let w = AnalysisWindows::resolve(&index(60), &b, None).unwrap();
        assert_eq!(w.post_start, 36);
        assert_eq!(w.eval_start, 48);
        assert_eq!(w.eval_end, 59);
        assert_eq!(w.prevented_start, 36);
        assert_eq!(w.eval().len(), 12);
    }

    #[test]
    fn rejects_intervention_before_data() {
        let b = PeriodBoundaries {
            intervention: ymd(1999, 1),
            eval_start: ymd(2001, 1),
            eval_end: None,
        };
        assert!(AnalysisWindows::resolve(&index(24), &b, None).is_err());
    }

    #[test]
    fn custom_prevented_start() {
        let b = PeriodBoundaries {
            intervention: ymd(2001, 1),
            eval_start: ymd(2001, 1),
            eval_end: Some(ymd(2001, 12)),
        };
        let w = AnalysisWindows::resolve(&index(24), &b, Some(ymd(2001, 7))).unwrap();
        assert_eq!(w.prevented_start, 18);
        assert_eq!(w.eval_end, 23);
    }
}
