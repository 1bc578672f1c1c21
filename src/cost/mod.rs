//! Per-student and per-feature cost accounting for upstream AI calls.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;

mod breakdown;
mod tracker;

pub use breakdown::{AlertScope, CostBreakdown, FeatureCost, Period, StudentCost, ThresholdAlert};
pub use tracker::CostTracker;

/// Scale factor for storing Decimal costs as AtomicU64 (6 decimal places precision).
pub(crate) const COST_SCALE_FACTOR: Decimal = dec!(1_000_000);

/// Negative or out-of-range amounts count as zero.
pub(crate) fn cost_to_micros(cost_usd: Decimal) -> u64 {
    (cost_usd * COST_SCALE_FACTOR)
        .trunc()
        .to_u64()
        .unwrap_or(0)
}

pub(crate) fn cost_from_micros(micros: u64) -> Decimal {
    Decimal::from(micros) / COST_SCALE_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_micros_conversion() {
        assert_eq!(cost_to_micros(dec!(0.0015)), 1_500);
        assert_eq!(cost_from_micros(1_500), dec!(0.0015));
        // Sub-micro precision is truncated
        assert_eq!(cost_to_micros(dec!(0.0000009)), 0);
        assert_eq!(cost_to_micros(dec!(-1)), 0);
    }
}
