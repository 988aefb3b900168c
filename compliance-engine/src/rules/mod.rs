//! Guarantee evaluators: one (clause, period) in, one [`RuleResult`] out.

pub mod availability;
pub mod capacity_factor;
pub mod performance;

use std::collections::BTreeMap;

use compliance_client::domain::MarketPrice;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{IntervalSeries, MeterAggregate},
    contract::{GuaranteeClause, GuaranteeType},
    detect::{Event, EventClass},
    error::{EngineError, EngineResult},
    excusal::ExcusedPeriod,
    formulas::FormulaError,
    model::{digest_json, idempotency_key, BillingPeriod},
    money,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStep {
    pub name: String,
    pub value: String,
}

/// Inputs, chosen formulas and intermediate values of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationTrace {
    pub evaluator: String,
    /// Formula type code by role.
    pub formulas: BTreeMap<String, String>,
    pub inputs: BTreeMap<String, String>,
    pub steps: Vec<TraceStep>,
}

impl CalculationTrace {
    pub fn new(evaluator: &str) -> Self {
        Self {
            evaluator: evaluator.to_string(),
            ..Self::default()
        }
    }

    pub fn formula(&mut self, role: &str, type_code: &str) -> &mut Self {
        self.formulas.insert(role.to_string(), type_code.to_string());
        self
    }

    pub fn input(&mut self, name: &str, value: Decimal) -> &mut Self {
        self.inputs.insert(name.to_string(), money::canonical(value));
        self
    }

    pub fn input_text(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.inputs.insert(name.to_string(), value.into());
        self
    }

    pub fn step(&mut self, name: &str, value: Decimal) -> &mut Self {
        self.steps.push(TraceStep {
            name: name.to_string(),
            value: money::canonical(value),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    /// Idempotency key of (contract, clause, period).
    pub id: String,
    pub contract_id: String,
    pub clause_id: String,
    pub clause_version: u32,
    pub guarantee_type: GuaranteeType,
    pub period: BillingPeriod,
    pub breach: bool,
    /// Percent for availability, capacity factor and performance ratio.
    pub computed_value: Decimal,
    pub threshold: Decimal,
    /// Percentage points for availability and capacity factor, kWh for performance.
    pub shortfall: Decimal,
    pub penalty_amount: Decimal,
    pub penalty_capped: bool,
    /// Excused periods changed the computation.
    pub excused: bool,
    pub trace: CalculationTrace,
    pub digest: String,
}

impl RuleResult {
    /// blake3 over everything except the digest itself.
    pub fn content_digest(&self) -> Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.digest.clear();
        digest_json(&unsealed)
    }
}

/// Market prices, tariff rate and interval series an evaluation may need.
#[derive(Debug, Clone, Default)]
pub struct SeriesInputs<'a> {
    pub production: Option<&'a IntervalSeries>,
    pub irradiance: Option<&'a IntervalSeries>,
    pub market_prices: Option<&'a [MarketPrice]>,
    pub tariff_rate: Option<Decimal>,
}

/// Everything one clause evaluation reads.
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    pub contract_id: &'a str,
    pub period: BillingPeriod,
    /// Aggregate of the clause's meter.
    pub aggregate: &'a MeterAggregate,
    /// Closed events on the clause's meter that overlap the period.
    pub events: &'a [Event],
    /// Excused periods resolved with the clause's excusable kinds.
    pub excused: &'a [ExcusedPeriod],
    pub series: SeriesInputs<'a>,
}

impl EvaluationContext<'_> {
    pub fn event_hours(&self, meter_id: &str, class: EventClass) -> Decimal {
        self.events
            .iter()
            .filter(|e| e.meter_id == meter_id && e.classification == class)
            .map(|e| self.period.overlap_hours(e.start, e.end))
            .sum()
    }

    pub(crate) fn data_error(&self, clause: &GuaranteeClause, reason: impl Into<String>) -> EngineError {
        EngineError::data_unavailable(self.contract_id, self.period.id(), Some(&clause.clause_id), reason)
    }

    pub(crate) fn formula_error(&self, clause: &GuaranteeClause, role: &str, err: FormulaError) -> EngineError {
        if err.is_data_error() {
            self.data_error(clause, err.to_string())
        } else {
            EngineError::config(&clause.clause_id, format!("{role}.params"), err.to_string())
        }
    }
}

pub trait RuleEvaluator: Send + Sync {
    fn guarantee_type(&self) -> GuaranteeType;

    fn evaluate(&self, clause: &GuaranteeClause, ctx: &EvaluationContext<'_>) -> EngineResult<RuleResult>;
}

/// Figures an evaluator hands to [`finish`].
pub(crate) struct Assessment {
    pub breach: bool,
    pub computed_value: Decimal,
    pub shortfall: Decimal,
    /// Penalty before cap and rounding.
    pub raw_penalty: Decimal,
    pub excused: bool,
    pub trace: CalculationTrace,
}

/// Applies the cap, rounds once, and seals the result with its digest.
pub(crate) fn finish(clause: &GuaranteeClause, ctx: &EvaluationContext<'_>, a: Assessment) -> EngineResult<RuleResult> {
    let Assessment {
        breach,
        computed_value,
        shortfall,
        raw_penalty,
        excused,
        mut trace,
    } = a;

    let (capped, penalty_capped) = if breach {
        money::apply_cap(raw_penalty, clause.penalty_cap)
    } else {
        (Decimal::ZERO, false)
    };
    let penalty_amount = money::round_money(capped);
    trace.step("penalty_before_cap", raw_penalty);
    if let Some(cap) = clause.penalty_cap {
        trace.input("penalty_cap", cap);
    }
    trace.step("penalty_amount", penalty_amount);

    let mut result = RuleResult {
        id: idempotency_key(ctx.contract_id, &clause.clause_id, &ctx.period),
        contract_id: ctx.contract_id.to_string(),
        clause_id: clause.clause_id.clone(),
        clause_version: clause.version,
        guarantee_type: clause.guarantee_type,
        period: ctx.period,
        breach,
        computed_value,
        threshold: clause.threshold_pct,
        shortfall,
        penalty_amount,
        penalty_capped,
        excused,
        trace,
        digest: String::new(),
    };
    result.digest = result.content_digest()?;
    Ok(result)
}

static AVAILABILITY: availability::AvailabilityEvaluator = availability::AvailabilityEvaluator;
static CAPACITY_FACTOR: capacity_factor::CapacityFactorEvaluator = capacity_factor::CapacityFactorEvaluator;
static PERFORMANCE: performance::PerformanceEvaluator = performance::PerformanceEvaluator;

pub fn evaluator_for(guarantee_type: GuaranteeType) -> &'static dyn RuleEvaluator {
    match guarantee_type {
        GuaranteeType::Availability => &AVAILABILITY,
        GuaranteeType::CapacityFactor => &CAPACITY_FACTOR,
        GuaranteeType::Performance => &PERFORMANCE,
    }
}

/// Checks window coverage and aggregate completeness, then dispatches.
pub fn evaluate_clause(clause: &GuaranteeClause, ctx: &EvaluationContext<'_>) -> EngineResult<RuleResult> {
    clause.ensure_covers(&ctx.period)?;
    if ctx.aggregate.meter_id != clause.meter_id {
        return Err(EngineError::InvalidRequest(format!(
            "aggregate for meter {} handed to clause {} on meter {}",
            ctx.aggregate.meter_id, clause.clause_id, clause.meter_id
        )));
    }
    ctx.aggregate.ensure_complete(ctx.contract_id, &clause.clause_id)?;
    evaluator_for(clause.guarantee_type).evaluate(clause, ctx)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::detect::{EventSource, Severity};
    use time::OffsetDateTime;

    pub fn outage(meter: &str, start: OffsetDateTime, end: OffsetDateTime) -> Event {
        event(meter, EventClass::Outage, start, end)
    }

    pub fn event(meter: &str, class: EventClass, start: OffsetDateTime, end: OffsetDateTime) -> Event {
        Event {
            id: format!("{meter}-{}", start.unix_timestamp()),
            meter_id: meter.to_string(),
            classification: class,
            start,
            end: Some(end),
            severity: Severity::Medium,
            source: EventSource::Detector,
            time_boxed: false,
        }
    }

    pub fn complete_aggregate(meter: &str, period: BillingPeriod, production: Decimal) -> MeterAggregate {
        MeterAggregate {
            period,
            meter_id: meter.to_string(),
            total_production: production,
            peak_value: Decimal::ZERO,
            off_peak_value: production,
            operating_hours: period.total_hours(),
            total_hours: period.total_hours(),
            expected_intervals: 720,
            observed_intervals: 720,
            duplicate_readings: 0,
            coverage_pct: Decimal::ONE_HUNDRED,
            complete: true,
        }
    }
}
