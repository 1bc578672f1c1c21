//! Durable record types.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Feature, MonthKey, PathId, QuotaKey, StudentId, TokenUsage};

/// Monthly usage of one feature by one student. Never deleted; the next
/// month gets its own record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub student_id: StudentId,
    pub feature: Feature,
    pub month: MonthKey,
    pub used_count: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaRecord {
    pub fn fresh(key: &QuotaKey, limit: u32, at: DateTime<Utc>) -> Self {
        Self {
            student_id: key.student_id.clone(),
            feature: key.feature,
            month: key.month,
            used_count: 0,
            limit,
            reset_at: key.resets_at(),
            created_at: at,
            updated_at: at,
        }
    }

    pub fn key(&self) -> QuotaKey {
        QuotaKey::new(self.student_id.clone(), self.feature, self.month)
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used_count)
    }

    /// Reconciliation merge: counts only move forward and never past the limit.
    pub fn merge_observed(&mut self, observed: u32, limit: u32, at: DateTime<Utc>) {
        self.limit = limit;
        self.used_count = self.used_count.max(observed).min(limit);
        self.updated_at = at;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Active,
    Expired,
    Superseded,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Superseded => "superseded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "superseded" => Ok(Self::Superseded),
            other => Err(format!("unknown cache status '{}'", other)),
        }
    }
}

/// A generated learning path retained for reuse within its validity window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path_id: PathId,
    pub student_id: StudentId,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: CacheStatus,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub recommendations: serde_json::Value,
    pub reasoning: String,
    pub usage: TokenUsage,
    pub confidence: Option<f32>,
}

impl CacheEntry {
    /// New active entry. A non-positive `ttl` is bumped to one second so
    /// `expires_at > generated_at` always holds.
    pub fn active(
        student_id: StudentId,
        generated_at: DateTime<Utc>,
        ttl: Duration,
        recommendations: serde_json::Value,
        reasoning: String,
        usage: TokenUsage,
    ) -> Self {
        let ttl = if ttl > Duration::zero() {
            ttl
        } else {
            Duration::seconds(1)
        };
        Self {
            path_id: PathId::new(),
            student_id,
            generated_at,
            expires_at: generated_at + ttl,
            status: CacheStatus::Active,
            status_changed_at: None,
            recommendations,
            reasoning,
            usage,
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: Option<f32>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Active and still inside its validity window.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == CacheStatus::Active && !self.is_expired_at(now)
    }

    pub(crate) fn transition(&mut self, status: CacheStatus, at: DateTime<Utc>) {
        self.status = status;
        self.status_changed_at = Some(at);
    }
}

/// One completed upstream call. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: Uuid,
    pub student_id: StudentId,
    pub feature: Feature,
    pub occurred_at: DateTime<Utc>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: Decimal,
}

impl UsageEvent {
    pub fn new(
        student_id: StudentId,
        feature: Feature,
        occurred_at: DateTime<Utc>,
        tokens_in: u64,
        tokens_out: u64,
        cost_usd: Decimal,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            student_id,
            feature,
            occurred_at,
            tokens_in,
            tokens_out,
            cost_usd,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, h, 0, 0).unwrap()
    }

    #[test]
    fn test_cache_entry_window() {
        let entry = CacheEntry::active(
            StudentId::new("s"),
            at(0),
            Duration::hours(24),
            serde_json::json!(["unit-1"]),
            "because".into(),
            TokenUsage::new(10, 20, dec!(0.01)),
        );
        assert!(entry.expires_at > entry.generated_at);
        assert!(entry.is_live(at(23)));
        assert!(!entry.is_live(at(0) + Duration::hours(24)));
    }

    #[test]
    fn test_cache_entry_non_positive_ttl() {
        let entry = CacheEntry::active(
            StudentId::new("s"),
            at(0),
            Duration::zero(),
            serde_json::Value::Null,
            String::new(),
            TokenUsage::default(),
        );
        assert!(entry.expires_at > entry.generated_at);
    }

    #[test]
    fn test_quota_record_merge_clamps() {
        let key = QuotaKey::new(
            StudentId::new("s"),
            Feature::PathGeneration,
            MonthKey::new(2026, 10).unwrap(),
        );
        let mut record = QuotaRecord::fresh(&key, 10, at(0));
        record.merge_observed(4, 10, at(1));
        assert_eq!(record.used_count, 4);

        // Never moves backwards
        record.merge_observed(2, 10, at(2));
        assert_eq!(record.used_count, 4);

        // Never exceeds the limit
        record.merge_observed(12, 10, at(3));
        assert_eq!(record.used_count, 10);
        assert_eq!(record.remaining(), 0);
    }

    #[test]
    fn test_cache_status_parse() {
        for status in [
            CacheStatus::Active,
            CacheStatus::Expired,
            CacheStatus::Superseded,
        ] {
            assert_eq!(status.as_str().parse::<CacheStatus>().unwrap(), status);
        }
        assert!(CacheStatus::Superseded.is_terminal());
        assert!(!CacheStatus::Active.is_terminal());
    }
}
