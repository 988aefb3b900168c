//! Meter aggregation: raw interval readings → one aggregate per (meter, period).
//!
//! Aggregates are always recomputed from the readings handed in; nothing is
//! updated incrementally.

pub mod series;

use compliance_client::domain::MeterReading;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub use series::{IntervalSeries, IntervalValue};

use crate::{
    config::{AggregationConfig, MeterKind, MeterProfile},
    error::{EngineError, EngineResult},
    model::BillingPeriod,
    money,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterAggregate {
    pub period: BillingPeriod,
    pub meter_id: String,
    pub total_production: Decimal,
    pub peak_value: Decimal,
    pub off_peak_value: Decimal,
    pub operating_hours: Decimal,
    pub total_hours: Decimal,
    pub expected_intervals: u32,
    pub observed_intervals: u32,
    pub duplicate_readings: u32,
    pub coverage_pct: Decimal,
    pub complete: bool,
}

impl MeterAggregate {
    /// Evaluators call this before touching any figure of the aggregate.
    pub fn ensure_complete(&self, contract_id: &str, clause_id: &str) -> EngineResult<()> {
        if self.complete {
            return Ok(());
        }
        Err(EngineError::data_unavailable(
            contract_id,
            self.period.id(),
            Some(clause_id),
            format!(
                "meter {} coverage {}% ({} of {} intervals) is below tolerance",
                self.meter_id,
                money::canonical(self.coverage_pct.round_dp(2)),
                self.observed_intervals,
                self.expected_intervals
            ),
        ))
    }
}

fn is_operating(profile: &MeterProfile, value: Decimal) -> bool {
    match profile.kind {
        MeterKind::Generation => value > profile.operating_threshold,
        MeterKind::Irradiance => true,
    }
}

pub fn aggregate(
    profile: &MeterProfile,
    period: &BillingPeriod,
    readings: &[MeterReading],
    cfg: &AggregationConfig,
) -> MeterAggregate {
    let series = IntervalSeries::from_readings(
        &profile.meter_id,
        period.start,
        period.end,
        cfg.interval(),
        readings,
    );

    let mut total = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut off_peak = Decimal::ZERO;
    let mut operating_hours = Decimal::ZERO;

    for v in &series.values {
        total += v.value;
        if cfg.peak_window.contains(v.start) {
            peak += v.value;
        } else {
            off_peak += v.value;
        }
        if is_operating(profile, v.value) {
            let (lo, hi) = series.slot_bounds(v.slot);
            operating_hours += money::hours(hi - lo);
        }
    }

    let expected = series.expected_slots();
    let observed = series.values.len() as u32;
    let coverage_pct = money::percent_of(Decimal::from(observed), Decimal::from(expected))
        .unwrap_or(Decimal::ZERO);
    let missing_pct = Decimal::ONE_HUNDRED - coverage_pct;
    let complete = expected > 0 && missing_pct <= cfg.coverage_tolerance_pct;

    if !complete {
        tracing::warn!(
            meter_id = %profile.meter_id,
            period = %period,
            observed,
            expected,
            "meter aggregate incomplete"
        );
        metrics::counter!("aggregates_incomplete_total").increment(1);
    }
    if series.duplicates > 0 {
        tracing::debug!(meter_id = %profile.meter_id, duplicates = series.duplicates, "duplicate readings ignored");
    }

    MeterAggregate {
        period: *period,
        meter_id: profile.meter_id.clone(),
        total_production: total,
        peak_value: peak,
        off_peak_value: off_peak,
        operating_hours,
        total_hours: period.total_hours(),
        expected_intervals: expected,
        observed_intervals: observed,
        duplicate_readings: series.duplicates,
        coverage_pct,
        complete,
    }
}
