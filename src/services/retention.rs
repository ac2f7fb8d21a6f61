//! Count- and age-based pruning of a single tier.
//!
//! Pure computation over a listing; deleting the chosen keys is the caller's
//! job.

use crate::models::{BucketEntry, RotationPolicy, Tier, entry::sort_newest_first};
use chrono::{DateTime, Utc};

/// Outcome of evaluating one tier, every list in newest-first order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    /// Within the retention count.
    pub keep: Vec<String>,
    /// Past the count but younger than the retention period.
    pub deferred: Vec<String>,
    /// Eligible for deletion.
    pub prune: Vec<String>,
}

/// Split `entries` (already restricted to the tier's prefix) into kept,
/// deferred and prunable keys.
///
/// The newest `retention_count` entries survive. Older ones are pruned, unless
/// the policy enforces a retention period and the entry is younger than it,
/// in which case it is deferred to a later run. Monthly objects are never
/// pruned.
pub fn plan(
    policy: &RotationPolicy,
    tier: Tier,
    mut entries: Vec<BucketEntry>,
    now: DateTime<Utc>,
) -> RetentionPlan {
    sort_newest_first(&mut entries);

    let Some(keep_count) = policy.retention_count(tier) else {
        return RetentionPlan {
            keep: entries.into_iter().map(|e| e.key).collect(),
            ..RetentionPlan::default()
        };
    };
    let min_age = policy.retention_period(tier);

    let mut plan = RetentionPlan::default();
    for (index, entry) in entries.into_iter().enumerate() {
        if index < keep_count {
            plan.keep.push(entry.key);
        } else if policy.enforce_retention_period && now - entry.last_modified < min_age {
            plan.deferred.push(entry.key);
        } else {
            plan.prune.push(entry.key);
        }
    }
    plan
}

/// Keys to delete from a tier, newest first.
pub fn compute_prunable(
    policy: &RotationPolicy,
    tier: Tier,
    entries: Vec<BucketEntry>,
    now: DateTime<Utc>,
) -> Vec<String> {
    plan(policy, tier, entries, now).prune
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap()
    }

    /// `n` entries, one per day, the newest one day old.
    fn daily_entries(n: i64) -> Vec<BucketEntry> {
        (1..=n)
            .map(|age| BucketEntry::new(format!("daily_db_{:03}", n - age), now() - Duration::days(age)))
            .collect()
    }

    fn policy(enforce: bool) -> RotationPolicy {
        RotationPolicy {
            daily_retention_count: 6,
            weekly_retention_count: 4,
            daily_retention_period: Duration::days(7),
            weekly_retention_period: Duration::days(28),
            enforce_retention_period: enforce,
            ..RotationPolicy::default()
        }
    }

    #[test]
    fn count_only_prunes_everything_past_the_count() {
        let entries = daily_entries(10);
        let prunable = compute_prunable(&policy(false), Tier::Daily, entries.clone(), now());

        assert_eq!(prunable.len(), 4);
        let survivors: Vec<_> = entries
            .iter()
            .filter(|e| !prunable.contains(&e.key))
            .collect();
        assert_eq!(survivors.len(), 6);
        let oldest_survivor = survivors.iter().map(|e| e.last_modified).min().unwrap();
        for key in &prunable {
            let pruned = entries.iter().find(|e| &e.key == key).unwrap();
            assert!(pruned.last_modified < oldest_survivor);
        }
    }

    #[test]
    fn prunable_keys_are_newest_first() {
        let prunable = compute_prunable(&policy(false), Tier::Daily, daily_entries(9), now());
        assert_eq!(prunable, vec!["daily_db_002", "daily_db_001", "daily_db_000"]);
    }

    #[test]
    fn enforced_period_defers_young_entries() {
        // ages 1..=10 days, the period is 7 days: ages 7..=10 are prunable
        let plan = plan(&policy(true), Tier::Daily, daily_entries(10), now());
        assert_eq!(plan.keep.len(), 6);
        assert_eq!(plan.prune.len(), 4);
        assert!(plan.deferred.is_empty());

        let young: Vec<_> = (0..10)
            .map(|i| BucketEntry::new(format!("daily_young_{i}"), now() - Duration::hours(i)))
            .collect();
        let plan = super::plan(&policy(true), Tier::Daily, young, now());
        assert_eq!(plan.keep.len(), 6);
        assert_eq!(plan.deferred.len(), 4);
        assert!(plan.prune.is_empty());
    }

    #[test]
    fn no_key_younger_than_the_period_is_pruned() {
        let policy = policy(true);
        let entries: Vec<_> = (0..40)
            .map(|i| BucketEntry::new(format!("weekly_{i:02}"), now() - Duration::days(i)))
            .collect();
        let prunable = compute_prunable(&policy, Tier::Weekly, entries.clone(), now());
        assert!(!prunable.is_empty());
        for key in prunable {
            let entry = entries.iter().find(|e| e.key == key).unwrap();
            assert!(now() - entry.last_modified >= policy.weekly_retention_period);
        }
    }

    #[test]
    fn age_exactly_at_the_period_is_prunable() {
        let mut entries = daily_entries(6);
        entries.push(BucketEntry::new("daily_edge", now() - Duration::days(7)));
        let prunable = compute_prunable(&policy(true), Tier::Daily, entries, now());
        assert_eq!(prunable, vec!["daily_edge"]);
    }

    #[test]
    fn monthly_tier_is_never_pruned() {
        let entries: Vec<_> = (0..50)
            .map(|i| BucketEntry::new(format!("monthly_{i}"), now() - Duration::days(i * 30)))
            .collect();
        assert!(compute_prunable(&policy(false), Tier::Monthly, entries, now()).is_empty());
    }

    #[test]
    fn zero_count_prunes_all_eligible() {
        let policy = RotationPolicy {
            daily_retention_count: 0,
            ..policy(false)
        };
        assert_eq!(
            compute_prunable(&policy, Tier::Daily, daily_entries(3), now()).len(),
            3
        );
    }

    #[test]
    fn ties_break_on_key() {
        let t = now() - Duration::days(30);
        let entries = vec![
            BucketEntry::new("daily_c", t),
            BucketEntry::new("daily_a", t),
            BucketEntry::new("daily_b", t),
        ];
        let policy = RotationPolicy {
            daily_retention_count: 1,
            ..policy(false)
        };
        assert_eq!(
            compute_prunable(&policy, Tier::Daily, entries, now()),
            vec!["daily_b", "daily_c"]
        );
    }
}
