use rust_decimal::Decimal;

use super::{finish, Assessment, CalculationTrace, EvaluationContext, RuleEvaluator, RuleResult};
use crate::{
    contract::{GuaranteeClause, GuaranteeTerms, GuaranteeType},
    detect::EventClass,
    error::{EngineError, EngineResult},
    excusal::excused_hours,
    money,
};

/// `(T − unexcused_outage_h) / (T − excused_outage_h) × 100`, clamped to [0, 100].
pub struct AvailabilityEvaluator;

impl RuleEvaluator for AvailabilityEvaluator {
    fn guarantee_type(&self) -> GuaranteeType {
        GuaranteeType::Availability
    }

    fn evaluate(&self, clause: &GuaranteeClause, ctx: &EvaluationContext<'_>) -> EngineResult<RuleResult> {
        let GuaranteeTerms::Availability { penalty_rate } = &clause.terms else {
            return Err(EngineError::config(&clause.clause_id, "guarantee_type", "terms are not availability terms"));
        };
        let meter = clause.meter_id.as_str();

        let total_hours = ctx.period.total_hours();
        let outage_hours = ctx.event_hours(meter, EventClass::Outage);
        let excused_outage = excused_hours(ctx.excused, &ctx.period, meter, &[EventClass::Outage]);
        let unexcused_outage = (outage_hours - excused_outage).max(Decimal::ZERO);
        let denominator = total_hours - excused_outage;

        let mut trace = CalculationTrace::new("availability");
        trace
            .input("total_hours", total_hours)
            .input("outage_hours", outage_hours)
            .input("excused_outage_hours", excused_outage)
            .input("threshold_pct", clause.threshold_pct)
            .input("penalty_rate_per_point", *penalty_rate)
            .input("operating_hours", ctx.aggregate.operating_hours)
            .step("unexcused_outage_hours", unexcused_outage)
            .step("denominator_hours", denominator);

        // Whole period excused: nothing left to measure, so no breach.
        let Some(raw) = money::percent_of(total_hours - unexcused_outage, denominator).filter(|_| denominator > Decimal::ZERO)
        else {
            trace.step("availability_pct", Decimal::ONE_HUNDRED);
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

        let availability = money::clamp(raw, Decimal::ZERO, Decimal::ONE_HUNDRED);
        let breach = availability < clause.threshold_pct;
        let shortfall = if breach {
            clause.threshold_pct - availability
        } else {
            Decimal::ZERO
        };
        trace.step("availability_pct", availability).step("shortfall_points", shortfall);

        finish(
            clause,
            ctx,
            Assessment {
                breach,
                computed_value: availability,
                shortfall,
                raw_penalty: shortfall * *penalty_rate,
                excused: excused_outage > Decimal::ZERO,
                trace,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::contract::fixtures::availability_doc;
    use crate::excusal::ExcusedPeriod;
    use crate::formulas::FormulaRegistry;
    use crate::model::BillingPeriod;
    use crate::rules::{evaluate_clause, test_support::*, SeriesInputs};
    use crate::testutil::{dec, generation_meter};
    use compliance_client::domain::RecordKind;
    use time::{macros::datetime, Duration};

    fn june() -> BillingPeriod {
        BillingPeriod::new(datetime!(2024-06-01 00:00:00 UTC), datetime!(2024-07-01 00:00:00 UTC)).unwrap()
    }

    fn clause(cap: Option<Decimal>) -> GuaranteeClause {
        let doc = crate::contract::GuaranteeConfigDoc {
            penalty_cap: cap,
            ..availability_doc("AV-1")
        };
        let settings = EngineSettings::default().with_meter(generation_meter("plant-1"));
        GuaranteeClause::from_doc(&doc, &FormulaRegistry::with_builtin(), &settings).unwrap()
    }

    fn run(clause: &GuaranteeClause, outage: Duration, excused: &[ExcusedPeriod]) -> RuleResult {
        let period = june();
        let start = datetime!(2024-06-01 00:00:00 UTC);
        let events = [outage_event(start, outage)];
        let agg = complete_aggregate("plant-1", period, dec("4850000"));
        let ctx = EvaluationContext {
            contract_id: "c-1",
            period,
            aggregate: &agg,
            events: if outage.is_zero() { &events[..0] } else { &events[..] },
            excused,
            series: SeriesInputs::default(),
        };
        evaluate_clause(clause, &ctx).unwrap()
    }

    fn outage_event(start: time::OffsetDateTime, d: Duration) -> crate::detect::Event {
        outage("plant-1", start, start + d)
    }

    #[test]
    fn documented_scenario_yields_175k_liquidated_damages() {
        // 61.2 h = 61 h 12 min of unexcused outage in a 720 h month.
        let result = run(&clause(Some(dec("500000"))), Duration::minutes(61 * 60 + 12), &[]);
        assert!(result.breach);
        assert_eq!(result.computed_value, dec("91.5"));
        assert_eq!(result.shortfall, dec("3.5"));
        assert_eq!(result.penalty_amount, dec("175000.00"));
        assert!(!result.penalty_capped);
        assert!(!result.excused);
        assert_eq!(result.trace.evaluator, "availability");
        assert_eq!(result.trace.inputs["total_hours"], "720");
    }

    #[test]
    fn availability_never_increases_with_more_unexcused_outage() {
        let clause = clause(None);
        let mut last = Decimal::ONE_HUNDRED;
        let mut last_penalty = Decimal::ZERO;
        for hours in [0, 1, 10, 36, 37, 100, 400, 720] {
            let r = run(&clause, Duration::hours(hours), &[]);
            assert!(r.computed_value <= last, "{hours}h");
            assert!(r.penalty_amount >= last_penalty, "{hours}h");
            last = r.computed_value;
            last_penalty = r.penalty_amount;
        }
        assert_eq!(last, Decimal::ZERO);
    }

    #[test]
    fn penalty_is_capped() {
        let r = run(&clause(Some(dec("100000"))), Duration::hours(100), &[]);
        assert!(r.breach);
        assert_eq!(r.penalty_amount, dec("100000"));
        assert!(r.penalty_capped);
    }

    #[test]
    fn excused_outage_leaves_both_numerator_and_denominator() {
        let start = datetime!(2024-06-01 00:00:00 UTC);
        let excused = [ExcusedPeriod {
            event_id: "plant-1-x".to_string(),
            record_id: "r-1".to_string(),
            meter_id: "plant-1".to_string(),
            classification: EventClass::Outage,
            start,
            end: start + Duration::hours(20),
            reason: RecordKind::GridOutage,
        }];
        let r = run(&clause(None), Duration::hours(56), &excused);
        // (720 − 36) / (720 − 20) × 100
        assert_eq!(r.computed_value.round_dp(4), dec("97.7143"));
        assert!(!r.breach);
        assert!(r.excused);
        assert_eq!(r.penalty_amount, Decimal::ZERO);
    }

    #[test]
    fn fully_excused_period_is_not_a_breach() {
        let period = june();
        let excused = [ExcusedPeriod {
            event_id: "e".to_string(),
            record_id: "r".to_string(),
            meter_id: "plant-1".to_string(),
            classification: EventClass::Outage,
            start: period.start,
            end: period.end,
            reason: RecordKind::ForceMajeure,
        }];
        let events = [outage("plant-1", period.start, period.end)];
        let agg = complete_aggregate("plant-1", period, Decimal::ZERO);
        let ctx = EvaluationContext {
            contract_id: "c-1",
            period,
            aggregate: &agg,
            events: &events,
            excused: &excused,
            series: SeriesInputs::default(),
        };
        let r = evaluate_clause(&clause(None), &ctx).unwrap();
        assert!(!r.breach);
        assert!(r.excused);
        assert_eq!(r.computed_value, Decimal::ONE_HUNDRED);
    }

    #[test]
    fn incomplete_aggregate_is_refused() {
        let period = june();
        let mut agg = complete_aggregate("plant-1", period, Decimal::ZERO);
        agg.complete = false;
        let ctx = EvaluationContext {
            contract_id: "c-1",
            period,
            aggregate: &agg,
            events: &[],
            excused: &[],
            series: SeriesInputs::default(),
        };
        let err = evaluate_clause(&clause(None), &ctx).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { clause_id: Some(ref c), .. } if c == "AV-1"));
    }

    #[test]
    fn identical_inputs_give_identical_results() {
        let clause = clause(Some(dec("500000")));
        let a = run(&clause, Duration::hours(40), &[]);
        let b = run(&clause, Duration::hours(40), &[]);
        assert_eq!(a, b);
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
        assert_eq!(a.digest, a.content_digest().unwrap());
    }
}
