//! Builders shared by unit tests.

use compliance_client::domain::{ExternalRecord, MarketPrice, MeterReading, ReadingUnit, RecordKind};
use rust_decimal::Decimal;
use time::{Duration, OffsetDateTime};

use crate::config::{HourWindow, MeterKind, MeterProfile};

pub fn reading(meter: &str, ts: OffsetDateTime, value: i64) -> MeterReading {
    MeterReading {
        ts,
        meter_id: meter.to_string(),
        value: Decimal::from(value),
        unit: ReadingUnit::Kwh,
        quality_flag: None,
        source_system: None,
    }
}

/// One reading per hour starting at `start`.
pub fn hourly_readings(meter: &str, start: OffsetDateTime, values: &[i64]) -> Vec<MeterReading> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| reading(meter, start + Duration::hours(i as i64), *v))
        .collect()
}

/// Same value every hour in `[start, end)`.
pub fn flat_hourly(meter: &str, start: OffsetDateTime, end: OffsetDateTime, value: i64) -> Vec<MeterReading> {
    let hours = (end - start).whole_hours();
    (0..hours)
        .map(|h| reading(meter, start + Duration::hours(h), value))
        .collect()
}

pub fn generation_meter(id: &str) -> MeterProfile {
    MeterProfile {
        meter_id: id.to_string(),
        kind: MeterKind::Generation,
        operating_threshold: Decimal::ZERO,
        expected_interval_kwh: None,
        operating_window: HourWindow::ALL_DAY,
    }
}

pub fn irradiance_meter(id: &str) -> MeterProfile {
    MeterProfile {
        kind: MeterKind::Irradiance,
        ..generation_meter(id)
    }
}

/// Site-wide external record.
pub fn record(id: &str, kind: RecordKind, start: OffsetDateTime, end: OffsetDateTime) -> ExternalRecord {
    ExternalRecord {
        id: id.to_string(),
        kind,
        start,
        end,
        meter_id: None,
        reference: None,
    }
}

pub fn price(market: &str, ts: OffsetDateTime, cents_per_kwh: i64) -> MarketPrice {
    MarketPrice {
        market: market.to_string(),
        ts,
        price_per_kwh: Decimal::new(cents_per_kwh, 2),
    }
}

pub fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

/// A breached result carrying `penalty`, as an evaluator would seal it.
pub fn breach_result(
    clause_id: &str,
    guarantee_type: crate::contract::GuaranteeType,
    period: crate::model::BillingPeriod,
    penalty: Decimal,
) -> crate::rules::RuleResult {
    crate::rules::RuleResult {
        id: crate::model::idempotency_key("c-1", clause_id, &period),
        contract_id: "c-1".to_string(),
        clause_id: clause_id.to_string(),
        clause_version: 1,
        guarantee_type,
        period,
        breach: true,
        computed_value: dec("91.5"),
        threshold: dec("95"),
        shortfall: dec("3.5"),
        penalty_amount: penalty,
        penalty_capped: false,
        excused: false,
        trace: crate::rules::CalculationTrace::new(guarantee_type.as_str()),
        digest: String::new(),
    }
}
