// src/recurrence.rs
//
// Pure date generation for recurring appointment series. Given the base
// appointment's start, a recurrence kind and the selected weekday tags,
// produces the start times of every *generated* sibling appointment. The
// base appointment itself is never part of the output.

use chrono::{DateTime, Datelike, Duration, Months, Utc};

use crate::models::{Recurrence, Weekday};

/// Generates the sibling start times for a recurring series.
///
/// Occurrence 0 fills the remaining selected weekdays of the base week
/// (the base's own weekday is the primary appointment, not a generated
/// one). Occurrences 1..N-1 repeat the pattern one interval at a time.
/// Time-of-day always matches the base. Output is neither deduplicated
/// nor sorted; the caller persists the dates as a batch.
///
/// Monthly series keep the base's day-of-month (clamped to shorter
/// months) and emit one date per month; occurrence-0 weekday fills that
/// would leave the base's calendar month are dropped.
pub fn generate_recurrence_dates(
    base: DateTime<Utc>,
    recurrence: Recurrence,
    weekdays: &[Weekday],
    occurrence_count: i32,
) -> Vec<DateTime<Utc>> {
    if matches!(recurrence, Recurrence::None) || occurrence_count <= 1 || weekdays.is_empty() {
        return Vec::new();
    }

    let base_day = i64::from(base.weekday().num_days_from_sunday() as i16);
    let mut dates = Vec::new();

    for i in 0..i64::from(occurrence_count) {
        if i == 0 {
            for &wd in weekdays {
                let target = i64::from(wd.index());
                if target == base_day {
                    continue;
                }
                let shifted = base + Duration::days((target - base_day).rem_euclid(7));
                if matches!(recurrence, Recurrence::Monthly)
                    && (shifted.year(), shifted.month()) != (base.year(), base.month())
                {
                    continue;
                }
                dates.push(shifted);
            }
            continue;
        }

        match recurrence {
            Recurrence::Weekly | Recurrence::Biweekly => {
                let weeks = if matches!(recurrence, Recurrence::Biweekly) { 2 * i } else { i };
                // Adding whole weeks preserves the base weekday, so the
                // shift stays relative to base_day.
                let anchor = base + Duration::weeks(weeks);
                for &wd in weekdays {
                    let target = i64::from(wd.index());
                    dates.push(anchor + Duration::days((target - base_day).rem_euclid(7)));
                }
            }
            Recurrence::Monthly => {
                // Same day-of-month, clamped by chrono when the target
                // month is shorter. One date per month period.
                if let Some(anchor) = base.checked_add_months(Months::new(i as u32)) {
                    dates.push(anchor);
                }
            }
            Recurrence::None => {}
        }
    }

    dates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn no_recurrence_yields_nothing() {
        let base = dt(2024, 3, 4, 9, 0);
        assert!(generate_recurrence_dates(base, Recurrence::None, &[Weekday::Monday], 5).is_empty());
        assert!(generate_recurrence_dates(base, Recurrence::Weekly, &[Weekday::Monday], 1).is_empty());
        assert!(generate_recurrence_dates(base, Recurrence::Weekly, &[Weekday::Monday], 0).is_empty());
        assert!(generate_recurrence_dates(base, Recurrence::Weekly, &[], 5).is_empty());
    }

    #[test]
    fn weekly_fills_base_week_and_following_weeks() {
        // 2024-03-04 is a Monday; Monday's slot is the base appointment.
        let base = dt(2024, 3, 4, 9, 0);
        let dates = generate_recurrence_dates(
            base,
            Recurrence::Weekly,
            &[Weekday::Wednesday, Weekday::Friday],
            2,
        );
        assert_eq!(
            dates,
            vec![
                dt(2024, 3, 6, 9, 0),
                dt(2024, 3, 8, 9, 0),
                dt(2024, 3, 13, 9, 0),
                dt(2024, 3, 15, 9, 0),
            ]
        );
    }

    #[test]
    fn base_weekday_is_skipped_in_base_week_only() {
        let base = dt(2024, 3, 4, 9, 0); // Monday
        let dates =
            generate_recurrence_dates(base, Recurrence::Weekly, &[Weekday::Monday], 3);
        // Occurrence 0 contributes nothing; weeks 1 and 2 land on Mondays.
        assert_eq!(dates, vec![dt(2024, 3, 11, 9, 0), dt(2024, 3, 18, 9, 0)]);
    }

    #[test]
    fn biweekly_spaces_occurrences_two_weeks_apart() {
        let base = dt(2024, 3, 4, 14, 30); // Monday
        let dates =
            generate_recurrence_dates(base, Recurrence::Biweekly, &[Weekday::Thursday], 3);
        assert_eq!(
            dates,
            vec![
                dt(2024, 3, 7, 14, 30),
                dt(2024, 3, 21, 14, 30),
                dt(2024, 4, 4, 14, 30),
            ]
        );
    }

    #[test]
    fn monthly_keeps_day_of_month_and_clamps() {
        let base = dt(2024, 1, 31, 10, 0); // Wednesday
        let dates =
            generate_recurrence_dates(base, Recurrence::Monthly, &[Weekday::Friday], 3);
        // Occurrence 0: Friday Feb 2 falls outside January and is dropped.
        // Occurrences 1 and 2 clamp/restore the day-of-month.
        assert_eq!(dates, vec![dt(2024, 2, 29, 10, 0), dt(2024, 3, 31, 10, 0)]);
    }

    #[test]
    fn monthly_keeps_same_month_weekday_fill() {
        let base = dt(2024, 3, 4, 9, 0); // Monday
        let dates =
            generate_recurrence_dates(base, Recurrence::Monthly, &[Weekday::Wednesday], 2);
        assert_eq!(dates, vec![dt(2024, 3, 6, 9, 0), dt(2024, 4, 4, 9, 0)]);
    }

    #[test]
    fn time_of_day_always_matches_base() {
        let base = dt(2024, 6, 11, 16, 45); // Tuesday
        let dates = generate_recurrence_dates(
            base,
            Recurrence::Weekly,
            &[Weekday::Saturday, Weekday::Sunday],
            4,
        );
        assert!(!dates.is_empty());
        for d in dates {
            assert_eq!(d.time(), base.time());
        }
    }

    #[test]
    fn weekday_shift_wraps_backwards_selections_forward() {
        // Base Thursday; Sunday/Tuesday land in the *next* week days
        // forward of the base, never behind it.
        let base = dt(2024, 3, 7, 9, 0);
        let dates = generate_recurrence_dates(
            base,
            Recurrence::Weekly,
            &[Weekday::Sunday, Weekday::Tuesday],
            2,
        );
        assert_eq!(
            dates,
            vec![
                dt(2024, 3, 10, 9, 0),
                dt(2024, 3, 12, 9, 0),
                dt(2024, 3, 17, 9, 0),
                dt(2024, 3, 19, 9, 0),
            ]
        );
    }
}
