//! Fixed-point helpers shared by evaluators and invoicing.
//!
//! Percentages and energy stay at full `Decimal` precision through every
//! intermediate step; money is rounded exactly once, at the final step, to
//! cents with midpoint-away-from-zero.

use rust_decimal::{Decimal, RoundingStrategy};
use time::Duration;

pub const MONEY_DP: u32 = 2;

pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Exact hours in a duration (nanosecond resolution).
pub fn hours(d: Duration) -> Decimal {
    Decimal::from_i128_with_scale(d.whole_nanoseconds(), 9) / Decimal::from(3600)
}

/// `part / whole × 100`, or `None` when `whole` is zero.
pub fn percent_of(part: Decimal, whole: Decimal) -> Option<Decimal> {
    (part * Decimal::ONE_HUNDRED).checked_div(whole)
}

pub fn clamp(value: Decimal, lo: Decimal, hi: Decimal) -> Decimal {
    value.max(lo).min(hi)
}

/// Applies an optional cap, returning the capped value and whether it bit.
pub fn apply_cap(value: Decimal, cap: Option<Decimal>) -> (Decimal, bool) {
    match cap {
        Some(cap) if value > cap => (cap, true),
        _ => (value, false),
    }
}

/// Stable textual form used in traces and digests.
pub fn canonical(value: Decimal) -> String {
    value.normalize().to_string()
}
