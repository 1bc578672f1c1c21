//! Quota bucket key and upstream usage metadata.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Feature, MonthKey, StudentId};

/// One quota bucket: a student's use of one feature in one UTC month.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct QuotaKey {
    pub student_id: StudentId,
    pub feature: Feature,
    pub month: MonthKey,
}

impl QuotaKey {
    pub fn new(student_id: StudentId, feature: Feature, month: MonthKey) -> Self {
        Self {
            student_id,
            feature,
            month,
        }
    }

    /// Bucket that `now` falls into.
    pub fn current(student_id: &StudentId, feature: Feature, now: DateTime<Utc>) -> Self {
        Self::new(student_id.clone(), feature, MonthKey::of(now))
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.month.resets_at()
    }

    /// When the volatile counter for this bucket may be dropped.
    pub fn expire_at(&self, retention: Duration) -> DateTime<Utc> {
        self.resets_at() + retention
    }
}

impl std::fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.student_id, self.feature, self.month)
    }
}

/// Token and cost metadata reported by an upstream call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: Decimal,
}

impl TokenUsage {
    pub fn new(tokens_in: u64, tokens_out: u64, cost_usd: Decimal) -> Self {
        Self {
            tokens_in,
            tokens_out,
            cost_usd,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.tokens_in + self.tokens_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_quota_key_scoped_to_month() {
        let student = StudentId::new("s1");
        let oct = Utc.with_ymd_and_hms(2026, 10, 31, 23, 0, 0).unwrap();
        let nov = Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap();

        let a = QuotaKey::current(&student, Feature::PathGeneration, oct);
        let b = QuotaKey::current(&student, Feature::PathGeneration, nov);
        assert_ne!(a, b);
        assert_eq!(a.resets_at(), nov);
        assert_eq!(a.to_string(), "s1:path_generation:2026-10");
        assert_eq!(a.expire_at(Duration::days(7)), nov + Duration::days(7));
    }
}
