//! GFS rotation policy and the tiers it classifies backups into.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Rotation category a backup belongs to. Derived per classification call,
/// never stored.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Monthly,
    Weekly,
    Daily,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Monthly, Tier::Weekly, Tier::Daily];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Monthly => "monthly",
            Tier::Weekly => "weekly",
            Tier::Daily => "daily",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("{tier} prefix must not be empty")]
    EmptyPrefix { tier: Tier },
    #[error("{first} and {second} tiers share the prefix `{prefix}`")]
    DuplicatePrefix {
        first: Tier,
        second: Tier,
        prefix: String,
    },
    #[error("{tier} retention period must not be negative")]
    NegativePeriod { tier: Tier },
}

/// Grandfather-Father-Son retention settings for one run.
///
/// Monthly objects carry no count limit; their expiry is left to store-side
/// lifecycle rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RotationPolicy {
    pub daily_prefix: String,
    pub weekly_prefix: String,
    pub monthly_prefix: String,

    pub daily_retention_count: usize,
    pub weekly_retention_count: usize,

    /// Minimum age before a daily object may be pruned.
    pub daily_retention_period: Duration,
    /// Minimum age before a weekly object may be pruned.
    pub weekly_retention_period: Duration,

    /// When false, only the retention counts govern pruning.
    pub enforce_retention_period: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            daily_prefix: "daily_".into(),
            weekly_prefix: "weekly_".into(),
            monthly_prefix: "monthly_".into(),
            daily_retention_count: 6,
            weekly_retention_count: 4,
            daily_retention_period: Duration::hours(168),
            weekly_retention_period: Duration::hours(672),
            enforce_retention_period: true,
        }
    }
}

impl RotationPolicy {
    /// Check that the three prefixes are non-empty and pairwise distinct.
    pub fn validate(&self) -> Result<(), PolicyError> {
        for tier in Tier::ALL {
            if self.prefix(tier).is_empty() {
                return Err(PolicyError::EmptyPrefix { tier });
            }
        }
        for (i, first) in Tier::ALL.iter().enumerate() {
            for second in &Tier::ALL[i + 1..] {
                if self.prefix(*first) == self.prefix(*second) {
                    return Err(PolicyError::DuplicatePrefix {
                        first: *first,
                        second: *second,
                        prefix: self.prefix(*first).to_string(),
                    });
                }
            }
        }
        for tier in [Tier::Daily, Tier::Weekly] {
            if self.retention_period(tier) < Duration::zero() {
                return Err(PolicyError::NegativePeriod { tier });
            }
        }
        Ok(())
    }

    pub fn prefix(&self, tier: Tier) -> &str {
        match tier {
            Tier::Monthly => &self.monthly_prefix,
            Tier::Weekly => &self.weekly_prefix,
            Tier::Daily => &self.daily_prefix,
        }
    }

    /// Number of objects kept in a tier, `None` for the unbounded monthly tier.
    pub fn retention_count(&self, tier: Tier) -> Option<usize> {
        match tier {
            Tier::Monthly => None,
            Tier::Weekly => Some(self.weekly_retention_count),
            Tier::Daily => Some(self.daily_retention_count),
        }
    }

    pub fn retention_period(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Monthly => Duration::zero(),
            Tier::Weekly => self.weekly_retention_period,
            Tier::Daily => self.daily_retention_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert_eq!(RotationPolicy::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_empty_prefix() {
        let policy = RotationPolicy {
            weekly_prefix: String::new(),
            ..RotationPolicy::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyError::EmptyPrefix { tier: Tier::Weekly })
        );
    }

    #[test]
    fn rejects_shared_prefix() {
        let policy = RotationPolicy {
            daily_prefix: "monthly_".into(),
            ..RotationPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::DuplicatePrefix { .. })
        ));
    }

    #[test]
    fn monthly_tier_has_no_count() {
        let policy = RotationPolicy::default();
        assert_eq!(policy.retention_count(Tier::Monthly), None);
        assert_eq!(policy.retention_count(Tier::Daily), Some(6));
        assert_eq!(policy.retention_count(Tier::Weekly), Some(4));
    }
}
