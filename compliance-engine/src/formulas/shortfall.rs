//! Shortfall payment pricing for performance guarantees.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{
    missing, parse_params, require_non_negative, require_positive, wrong_inputs, Calculator, FormulaDomain,
    FormulaError, FormulaInputs, FormulaParams, InputKind, ValidateParams,
};

#[derive(Debug, Clone)]
pub struct ShortfallInputs {
    pub shortfall_kwh: Decimal,
    /// Escalated tariff rate for the period.
    pub tariff_rate: Option<Decimal>,
    pub reference_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedRateParams {
    pub rate_per_kwh: Decimal,
}

impl ValidateParams for FixedRateParams {
    fn validate(&self) -> Result<(), String> {
        require_non_negative("rate_per_kwh", self.rate_per_kwh)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TariffMultipleParams {
    pub multiplier: Decimal,
}

impl ValidateParams for TariffMultipleParams {
    fn validate(&self) -> Result<(), String> {
        require_positive("multiplier", self.multiplier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferencePriceDifferenceParams {
    /// Smallest per-kWh difference paid even when the reference is below tariff.
    #[serde(default)]
    pub minimum_difference: Decimal,
}

impl ValidateParams for ReferencePriceDifferenceParams {
    fn validate(&self) -> Result<(), String> {
        require_non_negative("minimum_difference", self.minimum_difference)
    }
}

pub struct FixedRate;

impl Calculator for FixedRate {
    fn type_code(&self) -> &'static str {
        "SP_FIXED_RATE"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::ShortfallPayment
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::SpFixedRate)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::SpFixedRate(p), FormulaInputs::Shortfall(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        Ok(i.shortfall_kwh * p.rate_per_kwh)
    }
}

pub struct TariffMultiple;

impl Calculator for TariffMultiple {
    fn type_code(&self) -> &'static str {
        "SP_TARIFF_MULTIPLE"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::ShortfallPayment
    }

    fn required_inputs(&self) -> &'static [InputKind] {
        &[InputKind::TariffRate]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::SpTariffMultiple)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::SpTariffMultiple(p), FormulaInputs::Shortfall(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let rate = i.tariff_rate.ok_or_else(|| missing(self.type_code(), InputKind::TariffRate))?;
        Ok(i.shortfall_kwh * rate * p.multiplier)
    }
}

/// `shortfall × max(reference − tariff, minimum_difference)`
pub struct ReferencePriceDifference;

impl Calculator for ReferencePriceDifference {
    fn type_code(&self) -> &'static str {
        "SP_REFERENCE_PRICE_DIFFERENCE"
    }

    fn domain(&self) -> FormulaDomain {
        FormulaDomain::ShortfallPayment
    }

    fn required_inputs(&self) -> &'static [InputKind] {
        &[InputKind::TariffRate, InputKind::ReferencePrice]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError> {
        parse_params(self.type_code(), raw).map(FormulaParams::SpReferencePriceDifference)
    }

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError> {
        let (FormulaParams::SpReferencePriceDifference(p), FormulaInputs::Shortfall(i)) = (params, inputs) else {
            return Err(wrong_inputs(self.type_code()));
        };
        let tariff = i.tariff_rate.ok_or_else(|| missing(self.type_code(), InputKind::TariffRate))?;
        let reference = i
            .reference_price
            .ok_or_else(|| missing(self.type_code(), InputKind::ReferencePrice))?;
        let diff = (reference - tariff).max(p.minimum_difference);
        Ok(i.shortfall_kwh * diff)
    }
}

pub(crate) fn calculators() -> Vec<Arc<dyn Calculator>> {
    vec![
        Arc::new(FixedRate),
        Arc::new(TariffMultiple),
        Arc::new(ReferencePriceDifference),
    ]
}
