//! Tariff escalation models.
//!
//! All models are evaluated at the start date of the billing period.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::Date;

use super::{
    missing, parse_params, require_positive, wrong_inputs, Calculator, FormulaDomain, FormulaError, FormulaInputs,
    FormulaParams, InputKind, ValidateParams,
};

#[derive(Debug, Clone)]
pub struct EscalationInputs {
    pub base_rate: Decimal,
    pub contract_start: Date,
    pub period_start: Date,
}

/// Whole contract years elapsed between `from` and `to`.
pub fn whole_years(from: Date, to: Date) -> u32 {
    if to <= from {
        return 0;
    }
    let mut years = to.year() - from.year();
    if (to.month() as u8, to.day()) < (from.month() as u8, from.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoEscalationParams {}

impl ValidateParams for NoEscalationParams {}

fn compounding_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedPercentParams {
    pub annual_percent: Decimal,
    #[serde(default = "compounding_default")]
    pub compounding: bool,
}

impl ValidateParams for FixedPercentParams {
    fn validate(&self) -> Result<(), String> {
        if self.annual_percent <= Decimal::from(-100) || self.annual_percent > Decimal::ONE_HUNDRED {
            return Err(format!("annual_percent out of range: {}", self.annual_percent));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateStep {
    pub effective: Date,
    pub rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepScheduleParams {
    pub steps: Vec<RateStep>,
}

impl ValidateParams for StepScheduleParams {
    fn validate(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("steps must not be empty".to_string());
        }
        if self.steps.windows(2).any(|w| w[0].effective >= w[1].effective) {
            return Err("steps must be in strictly increasing effective order".to_string());
        }
        for s in &self.steps {
            require_positive("steps[].rate", s.rate)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexPoint {
    pub effective: Date,
    pub value: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexLinkedParams {
    pub base_index: Decimal,
    pub points: Vec<IndexPoint>,
    /// Lowest allowed change against base, in percent (e.g. `-5`).
    #[serde(default)]
    pub floor_percent: Option<Decimal>,
    /// Highest allowed change against base, in percent.
    #[serde(default)]
    pub cap_percent: Option<Decimal>,
}

impl ValidateParams for IndexLinkedParams {
    fn validate(&self) -> Result<(), String> {
        require_positive("base_index", self.base_index)?;
        if self.points.windows(2).any(|w| w[0].effective >= w[1].effective) {
            return Err("points must be in strictly increasing effective order".to_string());
        }
        for p in &self.points {
            require_positive("points[].value", p.value)?;
        }
        if let (Some(floor), Some(cap)) = (self.floor_percent, self.cap_percent) {
            if floor > cap {
                return Err(format!("floor_percent {floor} exceeds cap_percent {cap}"));
            }
        }
        Ok(())
    }
}

pub struct NoEscalation;

impl Calculator for NoEscalation {
    fn type_code(&self) -> &'static str {
        "ESC_NONE"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::Escalation
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::EscNone)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::EscNone(_), FormulaInputs::Escalation(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        Ok(i.base_rate)
    }
}

/// `base × (1 + p)^years`, or `base × max(1 + p × years, 0)` when not compounding.
pub struct FixedPercent;

impl Calculator for FixedPercent {
    fn type_code(&self) -> &'static str {
        "ESC_FIXED_PERCENT"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::Escalation
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::EscFixedPercent)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::EscFixedPercent(p), FormulaInputs::Escalation(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let years = whole_years(i.contract_start, i.period_start);
        let step = p.annual_percent / Decimal::ONE_HUNDRED;
        if !p.compounding {
            // A negative simple rate bottoms out at zero.
            let factor = (Decimal::ONE + step * Decimal::from(years)).max(Decimal::ZERO);
            return Ok(i.base_rate * factor);
        }
        let factor = (0..years).fold(Decimal::ONE, |acc, _| acc * (Decimal::ONE + step));
        Ok(i.base_rate * factor)
    }
}

/// Rate of the latest step effective on or before the period start.
pub struct StepSchedule;

impl Calculator for StepSchedule {
    fn type_code(&self) -> &'static str {
        "ESC_STEP_SCHEDULE"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::Escalation
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::EscStepSchedule)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::EscStepSchedule(p), FormulaInputs::Escalation(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        Ok(p.steps
            .iter()
            .rev()
            .find(|s| s.effective <= i.period_start)
            .map_or(i.base_rate, |s| s.rate))
    }
}

/// `base × index / base_index`, with the change bounded by floor and cap.
pub struct IndexLinked;

impl Calculator for IndexLinked {
    fn type_code(&self) -> &'static str {
        "ESC_INDEX_LINKED"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::Escalation
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::EscIndexLinked)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::EscIndexLinked(p), FormulaInputs::Escalation(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let index = p
            .points
            .iter()
            .rev()
            .find(|pt| pt.effective <= i.period_start)
            .ok_or_else(|| missing(self.type_code(), InputKind::EscalationIndex))?;
        let mut ratio = index.value / p.base_index;
        if let Some(floor) = p.floor_percent {
            ratio = ratio.max(Decimal::ONE + floor / Decimal::ONE_HUNDRED);
        }
        if let Some(cap) = p.cap_percent {
            ratio = ratio.min(Decimal::ONE + cap / Decimal::ONE_HUNDRED);
        }
        Ok(i.base_rate * ratio)
    }
}

pub(crate) fn calculators() -> Vec<Arc<dyn Calculator>> {
    vec![
        Arc::new(NoEscalation),
        Arc::new(FixedPercent),
        Arc::new(StepSchedule),
        Arc::new(IndexLinked),
    ]
}
