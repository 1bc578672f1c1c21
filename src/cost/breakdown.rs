//! Aggregated cost reports over a time window.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::CostConfig;
use crate::domain::{Feature, MonthKey, StudentId};
use crate::store::UsageEvent;

/// Half-open UTC range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn month(month: MonthKey) -> Self {
        Self {
            start: month.starts_at(),
            end: month.resets_at(),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureCost {
    pub feature: Feature,
    pub cost_usd: Decimal,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub event_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StudentCost {
    pub student_id: StudentId,
    pub cost_usd: Decimal,
    pub event_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AlertScope {
    Student(StudentId),
    Feature(Feature),
    Total,
}

/// Advisory record for an external notification collaborator. Not an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThresholdAlert {
    pub scope: AlertScope,
    pub observed_usd: Decimal,
    pub threshold_usd: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub period: Period,
    pub total_cost_usd: Decimal,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub event_count: u64,
    /// One row per feature with events in the period, in feature order.
    pub by_feature: Vec<FeatureCost>,
    /// Highest cost first, ties broken by student id.
    pub top_students: Vec<StudentCost>,
    pub alerts: Vec<ThresholdAlert>,
}

impl CostBreakdown {
    pub(crate) fn from_events(period: Period, events: &[UsageEvent], config: &CostConfig) -> Self {
        let mut by_feature: BTreeMap<Feature, FeatureCost> = BTreeMap::new();
        let mut by_student: HashMap<&StudentId, StudentCost> = HashMap::new();
        let mut total_cost_usd = Decimal::ZERO;
        let mut total_tokens_in = 0u64;
        let mut total_tokens_out = 0u64;
        let mut event_count = 0u64;

        for event in events.iter().filter(|e| period.contains(e.occurred_at)) {
            total_cost_usd += event.cost_usd;
            total_tokens_in += event.tokens_in;
            total_tokens_out += event.tokens_out;
            event_count += 1;

            let feature = by_feature.entry(event.feature).or_insert(FeatureCost {
                feature: event.feature,
                cost_usd: Decimal::ZERO,
                tokens_in: 0,
                tokens_out: 0,
                event_count: 0,
            });
            feature.cost_usd += event.cost_usd;
            feature.tokens_in += event.tokens_in;
            feature.tokens_out += event.tokens_out;
            feature.event_count += 1;

            let student = by_student
                .entry(&event.student_id)
                .or_insert_with(|| StudentCost {
                    student_id: event.student_id.clone(),
                    cost_usd: Decimal::ZERO,
                    event_count: 0,
                });
            student.cost_usd += event.cost_usd;
            student.event_count += 1;
        }

        let mut students: Vec<StudentCost> = by_student.into_values().collect();
        students.sort_by(|a, b| {
            b.cost_usd
                .cmp(&a.cost_usd)
                .then_with(|| a.student_id.cmp(&b.student_id))
        });

        let mut alerts = Vec::new();
        if let Some(threshold) = config.student_monthly_alert_usd {
            alerts.extend(
                students
                    .iter()
                    .filter(|s| s.cost_usd > threshold)
                    .map(|s| ThresholdAlert {
                        scope: AlertScope::Student(s.student_id.clone()),
                        observed_usd: s.cost_usd,
                        threshold_usd: threshold,
                    }),
            );
        }
        for (feature, threshold) in &config.feature_alert_usd {
            if let Some(cost) = by_feature.get(feature)
                && cost.cost_usd > *threshold
            {
                alerts.push(ThresholdAlert {
                    scope: AlertScope::Feature(*feature),
                    observed_usd: cost.cost_usd,
                    threshold_usd: *threshold,
                });
            }
        }
        if let Some(threshold) = config.total_alert_usd
            && total_cost_usd > threshold
        {
            alerts.push(ThresholdAlert {
                scope: AlertScope::Total,
                observed_usd: total_cost_usd,
                threshold_usd: threshold,
            });
        }

        students.truncate(config.top_n);

        Self {
            period,
            total_cost_usd,
            total_tokens_in,
            total_tokens_out,
            event_count,
            by_feature: by_feature.into_values().collect(),
            top_students: students,
            alerts,
        }
    }

    pub fn feature(&self, feature: Feature) -> Option<&FeatureCost> {
        self.by_feature.iter().find(|f| f.feature == feature)
    }

    pub fn has_alerts(&self) -> bool {
        !self.alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn october() -> Period {
        Period::month(MonthKey::new(2026, 10).unwrap())
    }

    fn event(student: &str, feature: Feature, day: u32, cost: Decimal) -> UsageEvent {
        UsageEvent::new(
            StudentId::new(student),
            feature,
            Utc.with_ymd_and_hms(2026, 10, day, 12, 0, 0).unwrap(),
            1_000,
            500,
            cost,
        )
    }

    #[test]
    fn test_period_is_half_open() {
        let period = october();
        assert!(period.contains(period.start));
        assert!(!period.contains(period.end));
        assert!(period.contains(period.end - Duration::seconds(1)));
        assert!(!period.is_empty());
    }

    #[test]
    fn test_breakdown_aggregates_and_ranks() {
        let events = vec![
            event("b", Feature::PathGeneration, 1, dec!(0.50)),
            event("a", Feature::PathGeneration, 2, dec!(0.25)),
            event("a", Feature::OpenAnswerGrading, 3, dec!(0.25)),
            event("c", Feature::OpenAnswerGrading, 4, dec!(0.10)),
        ];
        let config = CostConfig {
            student_monthly_alert_usd: None,
            top_n: 2,
            ..Default::default()
        };

        let breakdown = CostBreakdown::from_events(october(), &events, &config);
        assert_eq!(breakdown.total_cost_usd, dec!(1.10));
        assert_eq!(breakdown.event_count, 4);
        assert_eq!(breakdown.total_tokens_in, 4_000);
        assert_eq!(
            breakdown.feature(Feature::PathGeneration).unwrap().cost_usd,
            dec!(0.75)
        );

        // a and b tie at 0.50; ties break by student id
        let ranked: Vec<&str> = breakdown
            .top_students
            .iter()
            .map(|s| s.student_id.as_str())
            .collect();
        assert_eq!(ranked, vec!["a", "b"]);
        assert!(!breakdown.has_alerts());
    }

    #[test]
    fn test_breakdown_alerts() {
        let events = vec![
            event("heavy", Feature::PathGeneration, 1, dec!(6)),
            event("light", Feature::OpenAnswerGrading, 1, dec!(1)),
        ];
        let mut config = CostConfig {
            total_alert_usd: Some(dec!(5)),
            ..Default::default()
        };
        config
            .feature_alert_usd
            .insert(Feature::OpenAnswerGrading, dec!(0.5));

        let breakdown = CostBreakdown::from_events(october(), &events, &config);
        assert_eq!(breakdown.alerts.len(), 3);
        assert!(breakdown.alerts.contains(&ThresholdAlert {
            scope: AlertScope::Student(StudentId::new("heavy")),
            observed_usd: dec!(6),
            threshold_usd: dec!(5),
        }));
        assert!(
            breakdown
                .alerts
                .iter()
                .any(|a| a.scope == AlertScope::Feature(Feature::OpenAnswerGrading))
        );
        assert!(breakdown.alerts.iter().any(|a| a.scope == AlertScope::Total));
    }

    #[test]
    fn test_breakdown_ignores_events_outside_period() {
        let mut late = event("a", Feature::PathGeneration, 31, dec!(1));
        late.occurred_at = october().end;
        let breakdown = CostBreakdown::from_events(october(), &[late], &CostConfig::default());
        assert_eq!(breakdown.event_count, 0);
        assert!(breakdown.by_feature.is_empty());
    }
}
