//! Expected ("available") energy models used by performance guarantees.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{
    missing, parse_params, require_non_negative, require_positive, wrong_inputs, Calculator, FormulaDomain,
    FormulaError, FormulaInputs, FormulaParams, InputKind, ValidateParams,
};

/// Inputs over the non-excused intervals of the billing period.
#[derive(Debug, Clone)]
pub struct AvailableEnergyInputs<'a> {
    /// Irradiance per non-excused interval, when an irradiance meter is configured.
    pub irradiance: Option<&'a [Decimal]>,
    pub interval_hours: Decimal,
    pub intervals: u32,
    pub curtailed_intervals: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IrradianceIntervalParams {
    /// Energy produced over the historical baseline.
    pub historical_energy_kwh: Decimal,
    /// Mean per-interval irradiance over the same baseline.
    pub historical_irradiance: Decimal,
    pub baseline_intervals: u32,
}

impl ValidateParams for IrradianceIntervalParams {
    fn validate(&self) -> Result<(), String> {
        require_non_negative("historical_energy_kwh", self.historical_energy_kwh)?;
        require_positive("historical_irradiance", self.historical_irradiance)?;
        if self.baseline_intervals == 0 {
            return Err("baseline_intervals must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonthlyAvgIrradianceParams {
    pub average_energy_kwh: Decimal,
    /// Reference irradiance total for an average month.
    pub reference_irradiance: Decimal,
}

impl ValidateParams for MonthlyAvgIrradianceParams {
    fn validate(&self) -> Result<(), String> {
        require_non_negative("average_energy_kwh", self.average_energy_kwh)?;
        require_positive("reference_irradiance", self.reference_irradiance)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedDeemedParams {
    /// Deemed energy per curtailed interval.
    pub deemed_rate_kwh: Decimal,
}

impl ValidateParams for FixedDeemedParams {
    fn validate(&self) -> Result<(), String> {
        require_non_negative("deemed_rate_kwh", self.deemed_rate_kwh)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NameplateYieldParams {
    pub capacity_kw: Decimal,
    /// Share of nameplate output expected on average, 0..=1.
    pub yield_factor: Decimal,
}

impl ValidateParams for NameplateYieldParams {
    fn validate(&self) -> Result<(), String> {
        require_positive("capacity_kw", self.capacity_kw)?;
        if self.yield_factor <= Decimal::ZERO || self.yield_factor > Decimal::ONE {
            return Err(format!("yield_factor must be in (0, 1], got {}", self.yield_factor));
        }
        Ok(())
    }
}

/// `Σx (E_hist / Irr_hist) × (1 / Intervals) × Irr(x)`
pub struct IrradianceInterval;

impl Calculator for IrradianceInterval {
    fn type_code(&self) -> &'static str {
        "AE_IRRADIANCE_INTERVAL"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::AvailableEnergy
    }

    fn required_inputs(&self) -> &'static [InputKind] {
        &[InputKind::Irradiance]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::AeIrradianceInterval)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::AeIrradianceInterval(p), FormulaInputs::AvailableEnergy(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let irradiance = i.irradiance.ok_or_else(|| missing(self.type_code(), InputKind::Irradiance))?;
        let per_unit = p.historical_energy_kwh / p.historical_irradiance / Decimal::from(p.baseline_intervals);
        Ok(irradiance.iter().map(|irr| per_unit * irr).sum())
    }
}

/// `E_avg × Irr_actual / Irr_ref`
pub struct MonthlyAvgIrradiance;

impl Calculator for MonthlyAvgIrradiance {
    fn type_code(&self) -> &'static str {
        "AE_MONTHLY_AVG_IRRADIANCE"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::AvailableEnergy
    }

    fn required_inputs(&self) -> &'static [InputKind] {
        &[InputKind::Irradiance]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::AeMonthlyAvgIrradiance)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::AeMonthlyAvgIrradiance(p), FormulaInputs::AvailableEnergy(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let irradiance = i.irradiance.ok_or_else(|| missing(self.type_code(), InputKind::Irradiance))?;
        let actual: Decimal = irradiance.iter().sum();
        Ok(p.average_energy_kwh * actual / p.reference_irradiance)
    }
}

/// `deemed_rate × curtailed_intervals`
pub struct FixedDeemed;

impl Calculator for FixedDeemed {
    fn type_code(&self) -> &'static str {
        "AE_FIXED_DEEMED"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::AvailableEnergy
    }

    fn required_inputs(&self) -> &'static [InputKind] {
        &[InputKind::CurtailedIntervals]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::AeFixedDeemed)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::AeFixedDeemed(p), FormulaInputs::AvailableEnergy(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        Ok(p.deemed_rate_kwh * Decimal::from(i.curtailed_intervals))
    }
}

/// `capacity_kw × interval_hours × intervals × yield_factor`
pub struct NameplateYield;

impl Calculator for NameplateYield {
    fn type_code(&self) -> &'static str {
        "AE_NAMEPLATE_YIELD"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::AvailableEnergy
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::AeNameplateYield)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::AeNameplateYield(p), FormulaInputs::AvailableEnergy(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        Ok(p.capacity_kw * i.interval_hours * Decimal::from(i.intervals) * p.yield_factor)
    }
}

pub(crate) fn calculators() -> Vec<Arc<dyn Calculator>> {
    vec![
        Arc::new(IrradianceInterval),
        Arc::new(MonthlyAvgIrradiance),
        Arc::new(FixedDeemed),
        Arc::new(NameplateYield),
    ]
}
