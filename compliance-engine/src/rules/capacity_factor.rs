use rust_decimal::Decimal;

use super::{finish, Assessment, CalculationTrace, EvaluationContext, RuleEvaluator, RuleResult};
use crate::{
    contract::{GuaranteeClause, GuaranteeTerms, GuaranteeType},
    detect::EventClass,
    error::{EngineError, EngineResult},
    excusal::excused_hours,
    money,
};

/// `production / (nameplate_kw × (T − excused_h)) × 100`
pub struct CapacityFactorEvaluator;

impl RuleEvaluator for CapacityFactorEvaluator {
    fn guarantee_type(&self) -> GuaranteeType {
        GuaranteeType::CapacityFactor
    }

    fn evaluate(&self, clause: &GuaranteeClause, ctx: &EvaluationContext<'_>) -> EngineResult<RuleResult> {
        let GuaranteeTerms::CapacityFactor {
            penalty_rate,
            nameplate_kw,
        } = &clause.terms
        else {
            return Err(EngineError::config(
                &clause.clause_id,
                "guarantee_type",
                "terms are not capacity factor terms",
            ));
        };
        let meter = clause.meter_id.as_str();

        let total_hours = ctx.period.total_hours();
        let excused = excused_hours(
            ctx.excused,
            &ctx.period,
            meter,
            &[EventClass::Outage, EventClass::Curtailment, EventClass::Degradation],
        );
        let available_hours = total_hours - excused;
        let production = ctx.aggregate.total_production;
        let ideal = *nameplate_kw * available_hours;

        let mut trace = CalculationTrace::new("capacity_factor");
        trace
            .input("total_hours", total_hours)
            .input("excused_hours", excused)
            .input("production_kwh", production)
            .input("nameplate_kw", *nameplate_kw)
            .input("threshold_pct", clause.threshold_pct)
            .input("penalty_rate_per_point", *penalty_rate)
            .step("available_hours", available_hours)
            .step("ideal_production_kwh", ideal);

        let Some(raw) = money::percent_of(production, ideal).filter(|_| ideal > Decimal::ZERO) else {
            trace.step("capacity_factor_pct", Decimal::ONE_HUNDRED);
            return finish(
                clause,
                ctx,
                Assessment {
                    breach: false,
                    computed_value: Decimal::ONE_HUNDRED,
                    shortfall: Decimal::ZERO,
                    raw_penalty: Decimal::ZERO,
                    excused: true,
                    trace,
                },
            );
        };

        let capacity_factor = money::clamp(raw, Decimal::ZERO, Decimal::ONE_HUNDRED);
        let breach = capacity_factor < clause.threshold_pct;
        let shortfall = if breach {
            clause.threshold_pct - capacity_factor
        } else {
            Decimal::ZERO
        };
        trace
            .step("capacity_factor_pct", capacity_factor)
            .step("shortfall_points", shortfall);

        finish(
            clause,
            ctx,
            Assessment {
                breach,
                computed_value: capacity_factor,
                shortfall,
                raw_penalty: shortfall * *penalty_rate,
                excused: excused > Decimal::ZERO,
                trace,
            },
        )
    }
}
