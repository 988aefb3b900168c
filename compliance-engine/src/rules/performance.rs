//! Production guarantee: actual (plus deemed) energy against the guaranteed
//! share of formula-derived expected energy, over non-excused intervals.

use rust_decimal::Decimal;

use super::{finish, Assessment, CalculationTrace, EvaluationContext, RuleEvaluator, RuleResult};
use crate::{
    contract::{GuaranteeClause, GuaranteeTerms, GuaranteeType},
    detect::EventClass,
    error::{EngineError, EngineResult},
    formulas::{AvailableEnergyInputs, FormulaInputs, ReferencePriceInputs, ShortfallInputs},
    money,
};

pub struct PerformanceEvaluator;

impl RuleEvaluator for PerformanceEvaluator {
    fn guarantee_type(&self) -> GuaranteeType {
        GuaranteeType::Performance
    }

    fn evaluate(&self, clause: &GuaranteeClause, ctx: &EvaluationContext<'_>) -> EngineResult<RuleResult> {
        let GuaranteeTerms::Performance(terms) = &clause.terms else {
            return Err(EngineError::config(&clause.clause_id, "guarantee_type", "terms are not performance terms"));
        };
        let meter = clause.meter_id.as_str();
        let production = ctx
            .series
            .production
            .ok_or_else(|| ctx.data_error(clause, format!("production series for {meter} not loaded")))?;

        let overlaps = |slot: i64, class: Option<EventClass>| {
            let (lo, hi) = production.slot_bounds(slot);
            match class {
                None => ctx
                    .excused
                    .iter()
                    .any(|p| p.meter_id == meter && p.start < hi && lo < p.end),
                Some(class) => ctx.events.iter().any(|e| {
                    e.meter_id == meter
                        && e.classification == class
                        && e.start < hi
                        && e.end.map_or(true, |end| lo < end)
                }),
            }
        };

        let slots = i64::from(production.expected_slots());
        let open_slots: Vec<i64> = (0..slots).filter(|s| !overlaps(*s, None)).collect();
        let excused_slots = slots - open_slots.len() as i64;
        let curtailed = open_slots
            .iter()
            .filter(|s| overlaps(**s, Some(EventClass::Curtailment)))
            .count() as u32;

        let actual: Decimal = production
            .values
            .iter()
            .filter(|v| !overlaps(v.slot, None))
            .map(|v| v.value)
            .sum();
        let irradiance: Option<Vec<Decimal>> = ctx.series.irradiance.map(|irr| {
            irr.values
                .iter()
                .filter(|v| !overlaps(v.slot, None))
                .map(|v| v.value)
                .collect()
        });

        let ae_inputs = FormulaInputs::AvailableEnergy(AvailableEnergyInputs {
            irradiance: irradiance.as_deref(),
            interval_hours: money::hours(production.interval),
            intervals: open_slots.len() as u32,
            curtailed_intervals: curtailed,
        });

        let mut trace = CalculationTrace::new("performance");
        for (role, formula) in terms.formulas() {
            trace.formula(role, formula.type_code());
        }
        trace
            .input("intervals", Decimal::from(slots))
            .input("excused_intervals", Decimal::from(excused_slots))
            .input("curtailed_intervals", Decimal::from(curtailed))
            .input("actual_kwh", actual)
            .input("threshold_pct", clause.threshold_pct);
        if let Some(irr) = &irradiance {
            trace.input("irradiance_total", irr.iter().sum());
        }

        let expected = terms
            .available_energy
            .compute(&ae_inputs)
            .map_err(|e| ctx.formula_error(clause, "available_energy", e))?;
        let deemed = match &terms.deemed_energy {
            Some(f) => f
                .compute(&ae_inputs)
                .map_err(|e| ctx.formula_error(clause, "deemed_energy", e))?,
            None => Decimal::ZERO,
        };
        let credited = actual + deemed;
        trace
            .step("expected_kwh", expected)
            .step("deemed_kwh", deemed)
            .step("credited_kwh", credited);

        let Some(ratio) = money::percent_of(credited, expected).filter(|_| expected > Decimal::ZERO) else {
            // No expected energy left to guarantee.
            trace.step("performance_pct", Decimal::ONE_HUNDRED);
            return finish(
                clause,
                ctx,
                Assessment {
                    breach: false,
                    computed_value: Decimal::ONE_HUNDRED,
                    shortfall: Decimal::ZERO,
                    raw_penalty: Decimal::ZERO,
                    excused: excused_slots > 0,
                    trace,
                },
            );
        };

        let guaranteed = expected * clause.threshold_pct / Decimal::ONE_HUNDRED;
        let breach = credited < guaranteed;
        let shortfall = if breach { guaranteed - credited } else { Decimal::ZERO };
        trace
            .step("performance_pct", ratio)
            .step("guaranteed_kwh", guaranteed)
            .step("shortfall_kwh", shortfall);

        let raw_penalty = if breach {
            let reference_price = match &terms.reference_price {
                Some(f) => {
                    let price = f
                        .compute(&FormulaInputs::ReferencePrice(ReferencePriceInputs {
                            prices: ctx.series.market_prices,
                            peak_energy: ctx.aggregate.peak_value,
                            off_peak_energy: ctx.aggregate.off_peak_value,
                        }))
                        .map_err(|e| ctx.formula_error(clause, "reference_price", e))?;
                    trace.step("reference_price", price);
                    Some(price)
                }
                None => None,
            };
            if let Some(rate) = ctx.series.tariff_rate {
                trace.input("tariff_rate", rate);
            }
            terms
                .shortfall_payment
                .compute(&FormulaInputs::Shortfall(ShortfallInputs {
                    shortfall_kwh: shortfall,
                    tariff_rate: ctx.series.tariff_rate,
                    reference_price,
                }))
                .map_err(|e| ctx.formula_error(clause, "shortfall_payment", e))?
        } else {
            Decimal::ZERO
        };

        finish(
            clause,
            ctx,
            Assessment {
                breach,
                computed_value: ratio,
                shortfall,
                raw_penalty,
                excused: excused_slots > 0,
                trace,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::IntervalSeries;
    use crate::config::EngineSettings;
    use crate::contract::{fixtures::performance_doc, GuaranteeConfigDoc};
    use crate::excusal::ExcusedPeriod;
    use crate::formulas::{FormulaRef, FormulaRegistry};
    use crate::model::BillingPeriod;
    use crate::rules::{evaluate_clause, test_support::*, SeriesInputs};
    use crate::testutil::{dec, flat_hourly, generation_meter, irradiance_meter};
    use compliance_client::domain::RecordKind;
    use time::{macros::datetime, Duration};

    fn day() -> BillingPeriod {
        BillingPeriod::new(datetime!(2024-06-03 00:00:00 UTC), datetime!(2024-06-04 00:00:00 UTC)).unwrap()
    }

    fn clause_from(doc: GuaranteeConfigDoc) -> GuaranteeClause {
        let settings = EngineSettings::default()
            .with_meter(generation_meter("plant-1"))
            .with_meter(irradiance_meter("plant-1-pyr"));
        GuaranteeClause::from_doc(&doc, &FormulaRegistry::with_builtin(), &settings).unwrap()
    }

    struct Fixture {
        production: IntervalSeries,
        irradiance: IntervalSeries,
    }

    fn fixture() -> Fixture {
        let p = day();
        let hour = Duration::hours(1);
        Fixture {
            production: IntervalSeries::from_readings("plant-1", p.start, p.end, hour, &flat_hourly("plant-1", p.start, p.end, 80)),
            irradiance: IntervalSeries::from_readings("plant-1-pyr", p.start, p.end, hour, &flat_hourly("plant-1-pyr", p.start, p.end, 1)),
        }
    }

    fn evaluate(
        clause: &GuaranteeClause,
        f: &Fixture,
        events: &[crate::detect::Event],
        excused: &[ExcusedPeriod],
        tariff_rate: Option<Decimal>,
    ) -> EngineResult<RuleResult> {
        let period = day();
        let agg = complete_aggregate("plant-1", period, f.production.sum());
        let ctx = EvaluationContext {
            contract_id: "c-1",
            period,
            aggregate: &agg,
            events,
            excused,
            series: SeriesInputs {
                production: Some(&f.production),
                irradiance: Some(&f.irradiance),
                market_prices: None,
                tariff_rate,
            },
        };
        evaluate_clause(clause, &ctx)
    }

    #[test]
    fn shortfall_is_priced_by_the_registered_formula() {
        let clause = clause_from(performance_doc("PG-1"));
        let r = evaluate(&clause, &fixture(), &[], &[], Some(dec("0.045"))).unwrap();
        // expected 24 × 100 = 2400, actual 1920, guaranteed 2160
        assert_eq!(r.computed_value, dec("80"));
        assert!(r.breach);
        assert_eq!(r.shortfall, dec("240"));
        assert_eq!(r.penalty_amount, dec("16.20"));
        assert_eq!(r.trace.formulas["available_energy"], "AE_IRRADIANCE_INTERVAL");
        assert_eq!(r.trace.formulas["shortfall_payment"], "SP_TARIFF_MULTIPLE");
    }

    #[test]
    fn excused_intervals_leave_expected_and_actual() {
        let clause = clause_from(performance_doc("PG-1"));
        let p = day();
        let excused = [ExcusedPeriod {
            event_id: "e".to_string(),
            record_id: "r".to_string(),
            meter_id: "plant-1".to_string(),
            classification: EventClass::Outage,
            start: p.start,
            end: p.start + Duration::hours(6),
            reason: RecordKind::GridOutage,
        }];
        let r = evaluate(&clause, &fixture(), &[], &excused, Some(dec("0.045"))).unwrap();
        assert_eq!(r.shortfall, dec("180"));
        assert_eq!(r.penalty_amount, dec("12.15"));
        assert!(r.excused);
        assert_eq!(r.trace.inputs["excused_intervals"], "6");
    }

    #[test]
    fn deemed_energy_is_credited_for_curtailed_intervals() {
        let mut doc = performance_doc("PG-1");
        doc.deemed_energy = Some(FormulaRef {
            type_code: "AE_FIXED_DEEMED".to_string(),
            params: serde_json::json!({"deemed_rate_kwh": "100"}),
        });
        let clause = clause_from(doc);
        let p = day();
        let curtailment = [event("plant-1", EventClass::Curtailment, p.start + Duration::hours(10), p.start + Duration::hours(14))];
        let r = evaluate(&clause, &fixture(), &curtailment, &[], Some(dec("0.045"))).unwrap();
        assert!(!r.breach);
        assert_eq!(r.trace.steps.iter().find(|s| s.name == "deemed_kwh").unwrap().value, "400");
    }

    #[test]
    fn missing_tariff_rate_blocks_pricing() {
        let clause = clause_from(performance_doc("PG-1"));
        let err = evaluate(&clause, &fixture(), &[], &[], None).unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
    }

    #[test]
    fn penalty_grows_with_shortfall_and_respects_cap() {
        let mut doc = performance_doc("PG-1");
        doc.penalty_cap = Some(dec("20"));
        let clause = clause_from(doc);
        let p = day();
        let mut last = Decimal::ZERO;
        for value in [100, 90, 80, 60, 0] {
            let f = Fixture {
                production: IntervalSeries::from_readings("plant-1", p.start, p.end, Duration::hours(1), &flat_hourly("plant-1", p.start, p.end, value)),
                ..fixture()
            };
            let r = evaluate(&clause, &f, &[], &[], Some(dec("0.045"))).unwrap();
            assert!(r.penalty_amount >= last);
            assert!(r.penalty_amount <= dec("20"));
            last = r.penalty_amount;
        }
        assert_eq!(last, dec("20"));
    }
}
