use std::collections::HashMap;

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveTime};

use crate::constants::MAX_RECURRENCE_OCCURRENCES;
use crate::error::{AppError, AppResult};
use crate::models::{
    BookingStatus, ExceptionType, RecurrenceEndType, RecurrenceException, RecurrenceRule,
    RepeatFrequency,
};

/// One expanded instance of a recurring booking.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Occurrence {
    /// 1-based position in the unmodified series; skipped instances leave gaps.
    pub sequence: i32,
    pub occurrence_date: NaiveDate,
    pub booking_date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub status: BookingStatus,
}

pub fn validate_rule(rule: &RecurrenceRule) -> AppResult<()> {
    if rule.repeat_interval < 1 {
        return Err(AppError::InvalidInput(
            "repeat_interval must be at least 1".to_string(),
        ));
    }
    if rule.repeat_on_days_of_week.iter().any(|d| !(1..=7).contains(d)) {
        return Err(AppError::InvalidInput(
            "repeat_on_days_of_week must contain ISO weekdays 1..7".to_string(),
        ));
    }
    if let Some(dom) = rule.repeat_on_day_of_month {
        if !(1..=31).contains(&dom) {
            return Err(AppError::InvalidInput(
                "repeat_on_day_of_month must be between 1 and 31".to_string(),
            ));
        }
    }
    match rule.recurrence_end_type {
        RecurrenceEndType::AfterOccurrences => match rule.recurrence_occurrences {
            Some(n) if n >= 1 => Ok(()),
            _ => Err(AppError::MissingRequiredParam(
                "recurrence_occurrences".to_string(),
            )),
        },
        RecurrenceEndType::OnDate => rule
            .recurrence_end_date
            .map(|_| ())
            .ok_or_else(|| AppError::MissingRequiredParam("recurrence_end_date".to_string())),
        RecurrenceEndType::Never => Ok(()),
    }
}

enum Cadence {
    Once,
    Weekly { every: u32, days: Vec<u32> },
    Monthly { every: u32, day: u32 },
}

fn cadence(rule: &RecurrenceRule, anchor: NaiveDate) -> Cadence {
    let every = rule.repeat_interval.max(1) as u32;
    let days = || -> Vec<u32> {
        let mut days: Vec<u32> = rule
            .repeat_on_days_of_week
            .iter()
            .map(|d| *d as u32)
            .collect();
        if days.is_empty() {
            days.push(anchor.weekday().number_from_monday());
        }
        days.sort_unstable();
        days.dedup();
        days
    };
    let day_of_month = rule
        .repeat_on_day_of_month
        .map(|d| d as u32)
        .unwrap_or_else(|| anchor.day());

    match rule.repeat_frequency {
        RepeatFrequency::NotRequired => Cadence::Once,
        RepeatFrequency::Weekly => Cadence::Weekly { every, days: days() },
        RepeatFrequency::Biweekly => Cadence::Weekly { every: 2, days: days() },
        RepeatFrequency::Monthly => Cadence::Monthly {
            every,
            day: day_of_month,
        },
        // Weekdays take precedence over a day of month when both are set.
        RepeatFrequency::Custom => {
            if rule.repeat_on_days_of_week.is_empty() && rule.repeat_on_day_of_month.is_some() {
                Cadence::Monthly {
                    every,
                    day: day_of_month,
                }
            } else {
                Cadence::Weekly { every, days: days() }
            }
        }
    }
}

/// Base series dates (before exceptions), bounded by the rule's end and `horizon_end`
/// for open-ended rules.
pub fn series_dates(rule: &RecurrenceRule, anchor: NaiveDate, horizon_end: NaiveDate) -> Vec<NaiveDate> {
    let (limit_date, limit_count) = match rule.recurrence_end_type {
        RecurrenceEndType::Never => (Some(horizon_end), MAX_RECURRENCE_OCCURRENCES),
        RecurrenceEndType::OnDate => (rule.recurrence_end_date, MAX_RECURRENCE_OCCURRENCES),
        RecurrenceEndType::AfterOccurrences => (
            None,
            (rule.recurrence_occurrences.unwrap_or(1).max(1) as usize)
                .min(MAX_RECURRENCE_OCCURRENCES),
        ),
    };
    let within = |d: NaiveDate| limit_date.map_or(true, |l| d <= l);

    let mut dates = Vec::new();
    match cadence(rule, anchor) {
        Cadence::Once => {
            if within(anchor) {
                dates.push(anchor);
            }
        }
        Cadence::Weekly { every, days } => {
            let week0 = anchor - Duration::days(anchor.weekday().num_days_from_monday() as i64);
            let mut week = 0i64;
            'weeks: loop {
                let week_start = week0 + Duration::weeks(week * every as i64);
                for day in &days {
                    let date = week_start + Duration::days(*day as i64 - 1);
                    if date < anchor {
                        continue;
                    }
                    if !within(date) || dates.len() >= limit_count {
                        break 'weeks;
                    }
                    dates.push(date);
                }
                week += 1;
            }
        }
        Cadence::Monthly { every, day } => {
            let first = anchor.with_day(1).unwrap_or(anchor);
            // Months lacking the day are skipped, so bound the scan by iterations too.
            for step in 0..(limit_count as u32 * 12) {
                let Some(month_start) = first.checked_add_months(Months::new(step * every)) else {
                    break;
                };
                if !within(month_start) || dates.len() >= limit_count {
                    break;
                }
                let Some(date) = month_start.with_day(day) else {
                    continue;
                };
                if date < anchor {
                    continue;
                }
                if !within(date) {
                    break;
                }
                dates.push(date);
            }
        }
    }
    dates
}

/// Expand a recurring booking, applying per-occurrence exceptions.
///
/// `skip` drops the instance, `modify` moves it, `cancel` keeps it with status CANCELLED.
/// Skipped instances still count towards an occurrence limit.
pub fn expand(
    rule: &RecurrenceRule,
    anchor: NaiveDate,
    start_time: NaiveTime,
    end_time: NaiveTime,
    exceptions: &[RecurrenceException],
    horizon_end: NaiveDate,
) -> Vec<Occurrence> {
    let by_date: HashMap<NaiveDate, &RecurrenceException> = exceptions
        .iter()
        .filter(|e| !e.audit.is_deleted())
        .map(|e| (e.occurrence_date, e))
        .collect();

    series_dates(rule, anchor, horizon_end)
        .into_iter()
        .enumerate()
        .filter_map(|(idx, date)| {
            let base = Occurrence {
                sequence: idx as i32 + 1,
                occurrence_date: date,
                booking_date: date,
                start_time,
                end_time,
                status: BookingStatus::Pending,
            };
            match by_date.get(&date).map(|e| (e.exception_type, *e)) {
                None => Some(base),
                Some((ExceptionType::Skip, _)) => None,
                Some((ExceptionType::Cancel, _)) => Some(Occurrence {
                    status: BookingStatus::Cancelled,
                    ..base
                }),
                Some((ExceptionType::Modify, e)) => Some(Occurrence {
                    booking_date: e.new_booking_date.unwrap_or(date),
                    start_time: e.new_start_time.unwrap_or(start_time),
                    end_time: e.new_end_time.unwrap_or(end_time),
                    ..base
                }),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::models::AuditEnvelope;
    use uuid::Uuid;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn t(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn weekly_mondays(n: i32) -> RecurrenceRule {
        RecurrenceRule {
            repeat_frequency: RepeatFrequency::Weekly,
            repeat_interval: 1,
            repeat_on_days_of_week: vec![1],
            recurrence_end_type: RecurrenceEndType::AfterOccurrences,
            recurrence_occurrences: Some(n),
            ..RecurrenceRule::default()
        }
    }

    fn exception(
        date: NaiveDate,
        kind: ExceptionType,
        start: Option<NaiveTime>,
        end: Option<NaiveTime>,
    ) -> RecurrenceException {
        RecurrenceException {
            audit: AuditEnvelope::stamp_create(&RequestContext::system(Uuid::new_v4())),
            parent_booking_id: Uuid::new_v4(),
            occurrence_date: date,
            exception_type: kind,
            new_start_time: start,
            new_end_time: end,
            new_booking_date: None,
        }
    }

    #[test]
    fn weekly_with_modify_exception() {
        let exceptions = vec![exception(
            d(2025, 1, 13),
            ExceptionType::Modify,
            Some(t(11)),
            Some(t(12)),
        )];
        let occ = expand(
            &weekly_mondays(4),
            d(2025, 1, 6),
            t(10),
            t(11),
            &exceptions,
            d(2025, 12, 31),
        );

        let got: Vec<(NaiveDate, NaiveTime, NaiveTime)> = occ
            .iter()
            .map(|o| (o.booking_date, o.start_time, o.end_time))
            .collect();
        assert_eq!(
            got,
            vec![
                (d(2025, 1, 6), t(10), t(11)),
                (d(2025, 1, 13), t(11), t(12)),
                (d(2025, 1, 20), t(10), t(11)),
                (d(2025, 1, 27), t(10), t(11)),
            ]
        );
    }

    #[test]
    fn skip_removes_instance_and_counts_towards_limit() {
        let exceptions = vec![
            exception(d(2025, 1, 13), ExceptionType::Modify, Some(t(11)), Some(t(12))),
            exception(d(2025, 1, 20), ExceptionType::Skip, None, None),
        ];
        let occ = expand(
            &weekly_mondays(4),
            d(2025, 1, 6),
            t(10),
            t(11),
            &exceptions,
            d(2025, 12, 31),
        );
        assert_eq!(occ.len(), 3);
        assert_eq!(occ[2].occurrence_date, d(2025, 1, 27));
        assert_eq!(occ[2].sequence, 4);
    }

    #[test]
    fn cancel_keeps_instance_cancelled() {
        let exceptions = vec![exception(d(2025, 1, 13), ExceptionType::Cancel, None, None)];
        let occ = expand(
            &weekly_mondays(2),
            d(2025, 1, 6),
            t(10),
            t(11),
            &exceptions,
            d(2025, 12, 31),
        );
        assert_eq!(occ[1].status, BookingStatus::Cancelled);
    }

    #[test]
    fn biweekly_is_weekly_every_two() {
        let rule = RecurrenceRule {
            repeat_frequency: RepeatFrequency::Biweekly,
            recurrence_end_type: RecurrenceEndType::OnDate,
            recurrence_end_date: Some(d(2025, 2, 3)),
            ..RecurrenceRule::default()
        };
        let dates = series_dates(&rule, d(2025, 1, 6), d(2025, 12, 31));
        assert_eq!(dates, vec![d(2025, 1, 6), d(2025, 1, 20), d(2025, 2, 3)]);
    }

    #[test]
    fn monthly_skips_short_months() {
        let rule = RecurrenceRule {
            repeat_frequency: RepeatFrequency::Monthly,
            repeat_on_day_of_month: Some(31),
            recurrence_end_type: RecurrenceEndType::AfterOccurrences,
            recurrence_occurrences: Some(3),
            ..RecurrenceRule::default()
        };
        let dates = series_dates(&rule, d(2025, 1, 31), d(2030, 1, 1));
        assert_eq!(dates, vec![d(2025, 1, 31), d(2025, 3, 31), d(2025, 5, 31)]);
    }

    #[test]
    fn never_is_bounded_by_horizon() {
        let rule = RecurrenceRule {
            repeat_frequency: RepeatFrequency::Weekly,
            ..RecurrenceRule::default()
        };
        let dates = series_dates(&rule, d(2025, 1, 6), d(2025, 1, 31));
        assert_eq!(dates.len(), 4);
    }

    #[test]
    fn custom_with_both_prefers_weekdays() {
        let rule = RecurrenceRule {
            repeat_frequency: RepeatFrequency::Custom,
            repeat_on_days_of_week: vec![3],
            repeat_on_day_of_month: Some(15),
            recurrence_end_type: RecurrenceEndType::AfterOccurrences,
            recurrence_occurrences: Some(2),
            ..RecurrenceRule::default()
        };
        let dates = series_dates(&rule, d(2025, 1, 6), d(2030, 1, 1));
        assert_eq!(dates, vec![d(2025, 1, 8), d(2025, 1, 15)]);
    }

    #[test]
    fn after_occurrences_requires_count() {
        let rule = RecurrenceRule {
            repeat_frequency: RepeatFrequency::Weekly,
            recurrence_end_type: RecurrenceEndType::AfterOccurrences,
            recurrence_occurrences: None,
            ..RecurrenceRule::default()
        };
        assert!(validate_rule(&rule).is_err());
    }
}
