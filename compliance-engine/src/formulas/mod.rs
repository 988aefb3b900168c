//! Closed, registered set of pricing and energy calculators.
//!
//! A contract document names a calculator by type code and carries raw JSON
//! params. [`FormulaRegistry::resolve`] turns that pair into a
//! [`ResolvedFormula`]: the calculator plus its params parsed into the
//! [`FormulaParams`] variant for that code. Calculators are pure functions of
//! their params and a domain-specific input record.

pub mod available_energy;
pub mod escalation;
pub mod reference_price;
mod registry;
pub mod shortfall;

use std::fmt;

use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use available_energy::AvailableEnergyInputs;
pub use escalation::EscalationInputs;
pub use reference_price::ReferencePriceInputs;
pub use registry::{FormulaRegistry, ResolvedFormula};
pub use shortfall::ShortfallInputs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormulaDomain {
    AvailableEnergy,
    GridReferencePrice,
    Escalation,
    ShortfallPayment,
}

impl FormulaDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AvailableEnergy => "available_energy",
            Self::GridReferencePrice => "grid_reference_price",
            Self::Escalation => "escalation",
            Self::ShortfallPayment => "shortfall_payment",
        }
    }
}

impl fmt::Display for FormulaDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Formula selection as it appears in a contract document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaRef {
    pub type_code: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Series data a calculator needs from the evaluation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Irradiance,
    MarketPrices,
    EnergySplit,
    TariffRate,
    ReferencePrice,
    CurtailedIntervals,
    EscalationIndex,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Irradiance => "irradiance",
            Self::MarketPrices => "market_prices",
            Self::EnergySplit => "energy_split",
            Self::TariffRate => "tariff_rate",
            Self::ReferencePrice => "reference_price",
            Self::CurtailedIntervals => "curtailed_intervals",
            Self::EscalationIndex => "escalation_index",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("unknown formula type code '{0}'")]
    UnknownTypeCode(String),

    #[error("formula {type_code} is a {actual} formula, expected {expected}")]
    DomainMismatch {
        type_code: String,
        expected: FormulaDomain,
        actual: FormulaDomain,
    },

    #[error("invalid params for {type_code}: {reason}")]
    InvalidParams { type_code: String, reason: String },

    #[error("formula {type_code} needs {} which is not available", .input.as_str())]
    MissingInput { type_code: String, input: InputKind },

    #[error("formula {type_code} was given inputs for another domain")]
    WrongInputs { type_code: String },

    #[error("formula type code '{0}' is already registered")]
    DuplicateRegistration(String),
}

impl FormulaError {
    /// True when the error stems from missing series data rather than config.
    pub fn is_data_error(&self) -> bool {
        matches!(self, Self::MissingInput { .. })
    }
}

/// Typed params, one variant per registered type code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type_code", content = "params")]
pub enum FormulaParams {
    #[serde(rename = "AE_IRRADIANCE_INTERVAL")]
    AeIrradianceInterval(available_energy::IrradianceIntervalParams),
    #[serde(rename = "AE_MONTHLY_AVG_IRRADIANCE")]
    AeMonthlyAvgIrradiance(available_energy::MonthlyAvgIrradianceParams),
    #[serde(rename = "AE_FIXED_DEEMED")]
    AeFixedDeemed(available_energy::FixedDeemedParams),
    #[serde(rename = "AE_NAMEPLATE_YIELD")]
    AeNameplateYield(available_energy::NameplateYieldParams),
    #[serde(rename = "GRP_FIXED")]
    GrpFixed(reference_price::FixedPriceParams),
    #[serde(rename = "GRP_MARKET_AVERAGE")]
    GrpMarketAverage(reference_price::MarketAverageParams),
    #[serde(rename = "GRP_PEAK_OFFPEAK")]
    GrpPeakOffPeak(reference_price::PeakOffPeakParams),
    #[serde(rename = "ESC_NONE")]
    EscNone(escalation::NoEscalationParams),
    #[serde(rename = "ESC_FIXED_PERCENT")]
    EscFixedPercent(escalation::FixedPercentParams),
    #[serde(rename = "ESC_STEP_SCHEDULE")]
    EscStepSchedule(escalation::StepScheduleParams),
    #[serde(rename = "ESC_INDEX_LINKED")]
    EscIndexLinked(escalation::IndexLinkedParams),
    #[serde(rename = "SP_FIXED_RATE")]
    SpFixedRate(shortfall::FixedRateParams),
    #[serde(rename = "SP_TARIFF_MULTIPLE")]
    SpTariffMultiple(shortfall::TariffMultipleParams),
    #[serde(rename = "SP_REFERENCE_PRICE_DIFFERENCE")]
    SpReferencePriceDifference(shortfall::ReferencePriceDifferenceParams),
}

impl FormulaParams {
    /// Market whose prices this formula reads, if any.
    pub fn market(&self) -> Option<&str> {
        match self {
            Self::GrpMarketAverage(p) => Some(&p.market),
            _ => None,
        }
    }
}

/// Inputs handed to a calculator, tagged by domain.
#[derive(Debug, Clone)]
pub enum FormulaInputs<'a> {
    AvailableEnergy(AvailableEnergyInputs<'a>),
    ReferencePrice(ReferencePriceInputs<'a>),
    Escalation(EscalationInputs),
    Shortfall(ShortfallInputs),
}

/// One registered formula implementation.
///
/// New variants are added by implementing this trait under a new type code
/// and registering it; existing calculators are never touched.
pub trait Calculator: Send + Sync {
    fn type_code(&self) -> &'static str;

    fn domain(&self) -> FormulaDomain;

    fn required_inputs(&self) -> &'static [InputKind] {
        &[]
    }

    fn parse_params(&self, raw: &serde_json::Value) -> Result<FormulaParams, FormulaError>;

    fn compute(&self, params: &FormulaParams, inputs: &FormulaInputs<'_>) -> Result<Decimal, FormulaError>;
}

/// Schema checks that serde alone cannot express.
pub(crate) trait ValidateParams {
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Parses raw params into `T` and validates them. Absent params are `{}`.
pub(crate) fn parse_params<T>(type_code: &str, raw: &serde_json::Value) -> Result<T, FormulaError>
where
    T: DeserializeOwned + ValidateParams,
{
    let raw = if raw.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        raw.clone()
    };
    let params: T = serde_json::from_value(raw).map_err(|e| FormulaError::InvalidParams {
        type_code: type_code.to_string(),
        reason: e.to_string(),
    })?;
    params.validate().map_err(|reason| FormulaError::InvalidParams {
        type_code: type_code.to_string(),
        reason,
    })?;
    Ok(params)
}

pub(crate) fn wrong_inputs(type_code: &str) -> FormulaError {
    FormulaError::WrongInputs {
        type_code: type_code.to_string(),
    }
}

pub(crate) fn missing(type_code: &str, input: InputKind) -> FormulaError {
    FormulaError::MissingInput {
        type_code: type_code.to_string(),
        input,
    }
}

pub(crate) fn require_positive(field: &str, value: Decimal) -> Result<(), String> {
    if value <= Decimal::ZERO {
        return Err(format!("{field} must be positive, got {value}"));
    }
    Ok(())
}

pub(crate) fn require_non_negative(field: &str, value: Decimal) -> Result<(), String> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(format!("{field} must not be negative, got {value}"));
    }
    Ok(())
}
