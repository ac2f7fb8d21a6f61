//! Maps an upload instant to its GFS tier.

use crate::models::{RotationPolicy, Tier};
use chrono::{DateTime, Datelike, Utc, Weekday};

/// Highest tier wins: the first of the month is monthly, any other Monday is
/// weekly, everything else is daily. Evaluated in UTC.
pub fn classify(instant: DateTime<Utc>) -> Tier {
    if instant.day() == 1 {
        Tier::Monthly
    } else if instant.weekday() == Weekday::Mon {
        Tier::Weekly
    } else {
        Tier::Daily
    }
}

/// Tier prefix the policy assigns to `instant`.
pub fn tier_prefix(policy: &RotationPolicy, instant: DateTime<Utc>) -> &str {
    policy.prefix(classify(instant))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 0, 0).unwrap()
    }

    #[rstest]
    #[case::first_of_month(at(2024, 3, 1), Tier::Monthly)]
    #[case::first_is_monday(at(2024, 4, 1), Tier::Monthly)]
    #[case::monday(at(2024, 3, 4), Tier::Weekly)]
    #[case::tuesday(at(2024, 3, 5), Tier::Daily)]
    #[case::sunday(at(2024, 3, 31), Tier::Daily)]
    #[case::leap_day(at(2024, 2, 29), Tier::Daily)]
    fn classifies_by_calendar(#[case] instant: DateTime<Utc>, #[case] expected: Tier) {
        assert_eq!(classify(instant), expected);
    }

    #[test]
    fn prefix_follows_policy() {
        let policy = RotationPolicy::default();
        assert_eq!(tier_prefix(&policy, at(2024, 3, 5)), "daily_");
        assert_eq!(tier_prefix(&policy, at(2024, 3, 4)), "weekly_");
        assert_eq!(tier_prefix(&policy, at(2024, 3, 1)), "monthly_");
    }

    #[test]
    fn every_day_of_a_leap_year_has_exactly_one_tier() {
        let start = at(2024, 1, 1);
        for offset in 0..366 {
            let instant = start + Duration::days(offset);
            let tier = classify(instant);
            let monthly = instant.day() == 1;
            let weekly = !monthly && instant.weekday() == Weekday::Mon;
            assert_eq!(tier == Tier::Monthly, monthly, "{instant}");
            assert_eq!(tier == Tier::Weekly, weekly, "{instant}");
            assert_eq!(tier == Tier::Daily, !monthly && !weekly, "{instant}");
        }
    }

    #[test]
    fn classification_ignores_time_of_day() {
        let midnight = Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 3, 4, 23, 59, 59).unwrap();
        assert_eq!(classify(midnight), classify(late));
    }
}
