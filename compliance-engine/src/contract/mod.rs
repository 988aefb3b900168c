//! Guarantee and tariff configuration.
//!
//! Collaborator documents (`*Doc`) are untrusted input. They are validated
//! once into typed [`GuaranteeClause`] and [`Tariff`] values; evaluators only
//! ever see the typed form.

mod cache;

pub use cache::ConfigCache;

use std::collections::{BTreeMap, BTreeSet};

use compliance_client::domain::RecordKind;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use crate::{
    config::{EngineSettings, MeterKind},
    error::{EngineError, EngineResult},
    formulas::{
        EscalationInputs, FormulaDomain, FormulaError, FormulaInputs, FormulaRef, FormulaRegistry, InputKind,
        ResolvedFormula,
    },
    model::BillingPeriod,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuaranteeType {
    Availability,
    CapacityFactor,
    Performance,
}

impl GuaranteeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Availability => "availability",
            Self::CapacityFactor => "capacity_factor",
            Self::Performance => "performance",
        }
    }
}

fn default_cure_period_days() -> u32 {
    30
}

/// Versioned guarantee clause as delivered by contract digitization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuaranteeConfigDoc {
    pub contract_id: String,
    pub clause_id: String,
    pub version: u32,
    pub guarantee_type: GuaranteeType,
    /// Guaranteed level in percent.
    pub threshold_pct: Decimal,
    #[serde(with = "time::serde::rfc3339")]
    pub window_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub window_end: OffsetDateTime,
    pub meter_id: String,
    #[serde(default)]
    pub irradiance_meter_id: Option<String>,
    /// Money per percentage point below threshold.
    #[serde(default)]
    pub penalty_rate: Option<Decimal>,
    #[serde(default)]
    pub penalty_cap: Option<Decimal>,
    #[serde(default)]
    pub nameplate_kw: Option<Decimal>,
    #[serde(default)]
    pub available_energy: Option<FormulaRef>,
    #[serde(default)]
    pub deemed_energy: Option<FormulaRef>,
    #[serde(default)]
    pub shortfall_payment: Option<FormulaRef>,
    #[serde(default)]
    pub reference_price: Option<FormulaRef>,
    /// Record kinds that may excuse events; all kinds when absent.
    #[serde(default)]
    pub excusable_kinds: Option<Vec<RecordKind>>,
    #[serde(default = "default_cure_period_days")]
    pub cure_period_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TariffConfigDoc {
    pub contract_id: String,
    pub version: u32,
    pub base_rate: Decimal,
    pub currency: String,
    pub escalation: FormulaRef,
    #[serde(with = "time::serde::rfc3339")]
    pub valid_from: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub valid_to: Option<OffsetDateTime>,
    pub contract_start: Date,
    /// Meter whose delivered energy is billed.
    pub billing_meter_id: String,
}

impl GuaranteeConfigDoc {
    /// `(domain, type code)` for every formula this clause references.
    pub fn formula_refs(&self) -> Vec<(FormulaDomain, &str)> {
        [
            (FormulaDomain::AvailableEnergy, &self.available_energy),
            (FormulaDomain::AvailableEnergy, &self.deemed_energy),
            (FormulaDomain::ShortfallPayment, &self.shortfall_payment),
            (FormulaDomain::GridReferencePrice, &self.reference_price),
        ]
        .into_iter()
        .filter_map(|(domain, f)| f.as_ref().map(|f| (domain, f.type_code.as_str())))
        .collect()
    }
}

impl TariffConfigDoc {
    pub fn formula_refs(&self) -> Vec<(FormulaDomain, &str)> {
        vec![(FormulaDomain::Escalation, self.escalation.type_code.as_str())]
    }
}

/// Document versions for one contract; a change invalidates cached config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigVersions {
    pub clauses: BTreeMap<String, u32>,
    pub tariff: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceTerms {
    pub available_energy: ResolvedFormula,
    pub deemed_energy: Option<ResolvedFormula>,
    pub shortfall_payment: ResolvedFormula,
    pub reference_price: Option<ResolvedFormula>,
    pub irradiance_meter_id: Option<String>,
}

impl PerformanceTerms {
    /// Formulas by role, in a fixed order.
    pub fn formulas(&self) -> Vec<(&'static str, &ResolvedFormula)> {
        let mut out = vec![("available_energy", &self.available_energy)];
        if let Some(f) = &self.deemed_energy {
            out.push(("deemed_energy", f));
        }
        out.push(("shortfall_payment", &self.shortfall_payment));
        if let Some(f) = &self.reference_price {
            out.push(("reference_price", f));
        }
        out
    }

    pub fn requires(&self, input: InputKind) -> bool {
        self.formulas().iter().any(|(_, f)| f.requires(input))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuaranteeTerms {
    Availability { penalty_rate: Decimal },
    CapacityFactor { penalty_rate: Decimal, nameplate_kw: Decimal },
    Performance(PerformanceTerms),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuaranteeClause {
    pub contract_id: String,
    pub clause_id: String,
    pub version: u32,
    pub guarantee_type: GuaranteeType,
    pub threshold_pct: Decimal,
    pub window_start: OffsetDateTime,
    pub window_end: OffsetDateTime,
    pub meter_id: String,
    pub penalty_cap: Option<Decimal>,
    pub excusable_kinds: BTreeSet<RecordKind>,
    pub cure_period_days: u32,
    pub terms: GuaranteeTerms,
}

fn formula_error(clause_id: &str, role: &str, err: FormulaError) -> EngineError {
    let field = match err {
        FormulaError::InvalidParams { .. } => format!("{role}.params"),
        _ => format!("{role}.type_code"),
    };
    EngineError::config(clause_id, field, err.to_string())
}

fn resolve(
    registry: &FormulaRegistry,
    clause_id: &str,
    role: &str,
    domain: FormulaDomain,
    formula: &FormulaRef,
) -> EngineResult<ResolvedFormula> {
    registry
        .resolve(domain, formula)
        .map_err(|e| formula_error(clause_id, role, e))
}

impl GuaranteeClause {
    pub fn from_doc(doc: &GuaranteeConfigDoc, registry: &FormulaRegistry, settings: &EngineSettings) -> EngineResult<Self> {
        let clause = doc.clause_id.as_str();
        let reject = |field: &str, reason: String| Err(EngineError::config(clause, field, reason));

        if doc.threshold_pct <= Decimal::ZERO || doc.threshold_pct > Decimal::ONE_HUNDRED {
            return reject("threshold_pct", format!("must be in (0, 100], got {}", doc.threshold_pct));
        }
        if doc.window_start >= doc.window_end {
            return reject("window_start", "calculation window is empty".to_string());
        }
        if !settings.meters.contains_key(&doc.meter_id) {
            return reject("meter_id", format!("meter '{}' has no configured profile", doc.meter_id));
        }
        if let Some(cap) = doc.penalty_cap {
            if cap.is_sign_negative() {
                return reject("penalty_cap", format!("must not be negative, got {cap}"));
            }
        }

        let not_applicable = |field: &str, present: bool| -> EngineResult<()> {
            if present {
                return Err(EngineError::config(
                    clause,
                    field,
                    format!("not applicable to {} guarantees", doc.guarantee_type.as_str()),
                ));
            }
            Ok(())
        };
        let positive = |field: &str, value: Option<Decimal>| -> EngineResult<Decimal> {
            match value {
                Some(v) if v > Decimal::ZERO => Ok(v),
                Some(v) => Err(EngineError::config(clause, field, format!("must be positive, got {v}"))),
                None => Err(EngineError::config(clause, field, "required".to_string())),
            }
        };

        let terms = match doc.guarantee_type {
            GuaranteeType::Availability | GuaranteeType::CapacityFactor => {
                not_applicable("available_energy", doc.available_energy.is_some())?;
                not_applicable("deemed_energy", doc.deemed_energy.is_some())?;
                not_applicable("shortfall_payment", doc.shortfall_payment.is_some())?;
                not_applicable("reference_price", doc.reference_price.is_some())?;
                not_applicable("irradiance_meter_id", doc.irradiance_meter_id.is_some())?;
                let penalty_rate = positive("penalty_rate", doc.penalty_rate)?;
                if doc.guarantee_type == GuaranteeType::Availability {
                    not_applicable("nameplate_kw", doc.nameplate_kw.is_some())?;
                    GuaranteeTerms::Availability { penalty_rate }
                } else {
                    GuaranteeTerms::CapacityFactor {
                        penalty_rate,
                        nameplate_kw: positive("nameplate_kw", doc.nameplate_kw)?,
                    }
                }
            }
            GuaranteeType::Performance => {
                not_applicable("penalty_rate", doc.penalty_rate.is_some())?;
                not_applicable("nameplate_kw", doc.nameplate_kw.is_some())?;
                let Some(ae) = &doc.available_energy else {
                    return reject("available_energy", "required for performance guarantees".to_string());
                };
                let Some(sp) = &doc.shortfall_payment else {
                    return reject("shortfall_payment", "required for performance guarantees".to_string());
                };
                let terms = PerformanceTerms {
                    available_energy: resolve(registry, clause, "available_energy", FormulaDomain::AvailableEnergy, ae)?,
                    deemed_energy: doc
                        .deemed_energy
                        .as_ref()
                        .map(|f| resolve(registry, clause, "deemed_energy", FormulaDomain::AvailableEnergy, f))
                        .transpose()?,
                    shortfall_payment: resolve(registry, clause, "shortfall_payment", FormulaDomain::ShortfallPayment, sp)?,
                    reference_price: doc
                        .reference_price
                        .as_ref()
                        .map(|f| resolve(registry, clause, "reference_price", FormulaDomain::GridReferencePrice, f))
                        .transpose()?,
                    irradiance_meter_id: doc.irradiance_meter_id.clone(),
                };
                check_inputs(clause, &terms, settings)?;
                GuaranteeTerms::Performance(terms)
            }
        };

        let excusable_kinds = match &doc.excusable_kinds {
            Some(kinds) => kinds.iter().copied().collect(),
            None => RecordKind::ALL.into_iter().collect(),
        };

        Ok(Self {
            contract_id: doc.contract_id.clone(),
            clause_id: doc.clause_id.clone(),
            version: doc.version,
            guarantee_type: doc.guarantee_type,
            threshold_pct: doc.threshold_pct,
            window_start: doc.window_start,
            window_end: doc.window_end,
            meter_id: doc.meter_id.clone(),
            penalty_cap: doc.penalty_cap,
            excusable_kinds,
            cure_period_days: doc.cure_period_days,
            terms,
        })
    }

    /// The calculation window must fully cover the billing period.
    pub fn ensure_covers(&self, period: &BillingPeriod) -> EngineResult<()> {
        if self.window_start <= period.start && period.end <= self.window_end {
            return Ok(());
        }
        Err(EngineError::config(
            &self.clause_id,
            "window",
            format!(
                "calculation window [{} .. {}) does not cover billing period {period}",
                self.window_start, self.window_end
            ),
        ))
    }

    /// Meters this clause reads, primary first.
    pub fn meter_ids(&self) -> Vec<&str> {
        let mut ids = vec![self.meter_id.as_str()];
        if let GuaranteeTerms::Performance(PerformanceTerms {
            irradiance_meter_id: Some(irr),
            ..
        }) = &self.terms
        {
            ids.push(irr.as_str());
        }
        ids
    }

    /// Market whose prices the clause's formulas need.
    pub fn price_market(&self) -> Option<&str> {
        match &self.terms {
            GuaranteeTerms::Performance(p) => p.formulas().into_iter().find_map(|(_, f)| f.params().market()),
            _ => None,
        }
    }
}

fn check_inputs(clause: &str, terms: &PerformanceTerms, settings: &EngineSettings) -> EngineResult<()> {
    if terms.requires(InputKind::Irradiance) {
        let Some(meter_id) = &terms.irradiance_meter_id else {
            return Err(EngineError::config(
                clause,
                "irradiance_meter_id",
                "selected formula needs irradiance but no irradiance meter is configured",
            ));
        };
        match settings.meters.get(meter_id) {
            Some(p) if p.kind == MeterKind::Irradiance => {}
            _ => {
                return Err(EngineError::config(
                    clause,
                    "irradiance_meter_id",
                    format!("'{meter_id}' is not a configured irradiance meter"),
                ))
            }
        }
    }
    if terms.requires(InputKind::ReferencePrice) && terms.reference_price.is_none() {
        return Err(EngineError::config(
            clause,
            "reference_price",
            "shortfall formula needs a reference price formula",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tariff {
    pub contract_id: String,
    pub version: u32,
    pub base_rate: Decimal,
    pub currency: String,
    pub escalation: ResolvedFormula,
    pub valid_from: OffsetDateTime,
    pub valid_to: Option<OffsetDateTime>,
    pub contract_start: Date,
    pub billing_meter_id: String,
}

impl Tariff {
    pub fn from_doc(doc: &TariffConfigDoc, registry: &FormulaRegistry) -> EngineResult<Self> {
        let scope = format!("tariff:{}", doc.contract_id);
        if doc.base_rate <= Decimal::ZERO {
            return Err(EngineError::config(&scope, "base_rate", format!("must be positive, got {}", doc.base_rate)));
        }
        let currency = doc.currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(EngineError::config(&scope, "currency", format!("'{}' is not an ISO 4217 code", doc.currency)));
        }
        if let Some(to) = doc.valid_to {
            if to <= doc.valid_from {
                return Err(EngineError::config(&scope, "valid_to", "validity window is empty"));
            }
        }
        let escalation = resolve(registry, &scope, "escalation", FormulaDomain::Escalation, &doc.escalation)?;
        Ok(Self {
            contract_id: doc.contract_id.clone(),
            version: doc.version,
            base_rate: doc.base_rate,
            currency,
            escalation,
            valid_from: doc.valid_from,
            valid_to: doc.valid_to,
            contract_start: doc.contract_start,
            billing_meter_id: doc.billing_meter_id.clone(),
        })
    }

    pub fn ensure_covers(&self, period: &BillingPeriod) -> EngineResult<()> {
        let ends_ok = self.valid_to.map_or(true, |to| period.end <= to);
        if self.valid_from <= period.start && ends_ok {
            return Ok(());
        }
        Err(EngineError::config(
            format!("tariff:{}", self.contract_id),
            "valid_from",
            format!("tariff validity does not cover billing period {period}"),
        ))
    }

    /// Escalated rate in force at the start of `period`.
    pub fn rate_for(&self, period: &BillingPeriod) -> Result<Decimal, FormulaError> {
        self.escalation.compute(&FormulaInputs::Escalation(EscalationInputs {
            base_rate: self.base_rate,
            contract_start: self.contract_start,
            period_start: period.start.date(),
        }))
    }
}

/// Everything configured for one contract, validated.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractConfig {
    pub contract_id: String,
    pub versions: ConfigVersions,
    pub clauses: Vec<GuaranteeClause>,
    pub tariff: Option<Tariff>,
}

impl ContractConfig {
    /// Validates every clause before any is used; clauses are ordered by id.
    pub fn from_docs(
        contract_id: &str,
        versions: ConfigVersions,
        guarantees: &[GuaranteeConfigDoc],
        tariff: Option<&TariffConfigDoc>,
        registry: &FormulaRegistry,
        settings: &EngineSettings,
    ) -> EngineResult<Self> {
        let mut clauses = Vec::with_capacity(guarantees.len());
        let mut seen = BTreeSet::new();
        for doc in guarantees {
            if doc.contract_id != contract_id {
                return Err(EngineError::config(
                    &doc.clause_id,
                    "contract_id",
                    format!("belongs to contract '{}', not '{contract_id}'", doc.contract_id),
                ));
            }
            if !seen.insert(doc.clause_id.as_str()) {
                return Err(EngineError::config(&doc.clause_id, "clause_id", "clause delivered twice"));
            }
            clauses.push(GuaranteeClause::from_doc(doc, registry, settings)?);
        }
        clauses.sort_by(|a, b| a.clause_id.cmp(&b.clause_id));

        let tariff = tariff.map(|t| Tariff::from_doc(t, registry)).transpose()?;
        if let Some(t) = &tariff {
            if !settings.meters.contains_key(&t.billing_meter_id) {
                return Err(EngineError::config(
                    format!("tariff:{contract_id}"),
                    "billing_meter_id",
                    format!("meter '{}' has no configured profile", t.billing_meter_id),
                ));
            }
        }

        if tariff.is_none() {
            for clause in &clauses {
                if let GuaranteeTerms::Performance(p) = &clause.terms {
                    if p.requires(InputKind::TariffRate) {
                        return Err(EngineError::config(
                            &clause.clause_id,
                            "shortfall_payment",
                            "formula needs a tariff rate but the contract has no tariff",
                        ));
                    }
                }
            }
        }

        Ok(Self {
            contract_id: contract_id.to_string(),
            versions,
            clauses,
            tariff,
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;
    use time::macros::{date, datetime};

    pub fn availability_doc(clause_id: &str) -> GuaranteeConfigDoc {
        GuaranteeConfigDoc {
            contract_id: "c-1".to_string(),
            clause_id: clause_id.to_string(),
            version: 1,
            guarantee_type: GuaranteeType::Availability,
            threshold_pct: Decimal::from(95),
            window_start: datetime!(2024-01-01 00:00:00 UTC),
            window_end: datetime!(2025-01-01 00:00:00 UTC),
            meter_id: "plant-1".to_string(),
            irradiance_meter_id: None,
            penalty_rate: Some(Decimal::from(50_000)),
            penalty_cap: Some(Decimal::from(500_000)),
            nameplate_kw: None,
            available_energy: None,
            deemed_energy: None,
            shortfall_payment: None,
            reference_price: None,
            excusable_kinds: None,
            cure_period_days: 30,
        }
    }

    pub fn performance_doc(clause_id: &str) -> GuaranteeConfigDoc {
        GuaranteeConfigDoc {
            guarantee_type: GuaranteeType::Performance,
            threshold_pct: Decimal::from(90),
            irradiance_meter_id: Some("plant-1-pyr".to_string()),
            penalty_rate: None,
            available_energy: Some(FormulaRef {
                type_code: "AE_IRRADIANCE_INTERVAL".to_string(),
                params: json!({
                    "historical_energy_kwh": "1000",
                    "historical_irradiance": "1",
                    "baseline_intervals": 10
                }),
            }),
            shortfall_payment: Some(FormulaRef {
                type_code: "SP_TARIFF_MULTIPLE".to_string(),
                params: json!({"multiplier": "1.5"}),
            }),
            ..availability_doc(clause_id)
        }
    }

    pub fn tariff_doc() -> TariffConfigDoc {
        TariffConfigDoc {
            contract_id: "c-1".to_string(),
            version: 1,
            base_rate: Decimal::new(45, 3),
            currency: "USD".to_string(),
            escalation: FormulaRef {
                type_code: "ESC_NONE".to_string(),
                params: serde_json::Value::Null,
            },
            valid_from: datetime!(2024-01-01 00:00:00 UTC),
            valid_to: None,
            contract_start: date!(2024-01-01),
            billing_meter_id: "plant-1".to_string(),
        }
    }
}
