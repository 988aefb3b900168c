//! One (contract, billing period) evaluation, end to end.
//!
//! Every clause is computed before anything is written, so a clause that
//! fails leaves no partial results behind. Writes go through the store's
//! insert-if-absent operations; a replay returns what was stored the first
//! time.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use compliance_client::domain::{ExternalRecord, MeterReading};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::{
    aggregate::{aggregate, IntervalSeries, MeterAggregate},
    config::EngineSettings,
    contract::{ConfigCache, ContractConfig, GuaranteeClause, GuaranteeTerms, Tariff},
    defaults::{DefaultAction, DefaultEvent},
    detect::{detect, events_for_period, DetectionInput},
    error::{EngineError, EngineResult},
    excusal,
    formulas::{FormulaError, FormulaRegistry, InputKind},
    invoice::{build_expected_invoice, reconcile, ExpectedInvoice, InvoiceComparison, ReceivedInvoice},
    model::BillingPeriod,
    rules::{evaluate_clause, EvaluationContext, RuleResult, SeriesInputs},
    store::{with_timeout, EvaluationStore, InsertOutcome, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingNote {
    pub level: NoteLevel,
    pub clause_id: Option<String>,
    pub message: String,
}

impl ProcessingNote {
    fn info(clause_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: NoteLevel::Info,
            clause_id: clause_id.map(str::to_string),
            message: message.into(),
        }
    }

    fn warning(clause_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            level: NoteLevel::Warning,
            ..Self::info(clause_id, message)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub contract_id: String,
    pub period: BillingPeriod,
    pub rule_results: Vec<RuleResult>,
    /// Only the defaults this call opened; replays open none.
    pub default_events_created: Vec<DefaultEvent>,
    pub processing_notes: Vec<ProcessingNote>,
    pub expected_invoice: Option<ExpectedInvoice>,
}

/// Telemetry read for one evaluation, keyed by meter.
struct PeriodData {
    records: Vec<ExternalRecord>,
    readings: BTreeMap<String, Vec<MeterReading>>,
}

pub struct ComplianceEngine {
    store: Arc<dyn EvaluationStore>,
    settings: Arc<EngineSettings>,
    cache: ConfigCache,
}

impl ComplianceEngine {
    pub fn new(store: Arc<dyn EvaluationStore>, registry: Arc<FormulaRegistry>, settings: Arc<EngineSettings>) -> Self {
        let cache = ConfigCache::new(registry, Arc::clone(&settings));
        Self { store, settings, cache }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Loads each contract once and checks its formula type codes against
    /// the registry. The first failure is returned.
    pub async fn validate_contracts(&self, contract_ids: &[String]) -> EngineResult<()> {
        for contract_id in contract_ids {
            let config = self
                .cache
                .preflight(self.store.as_ref(), contract_id, self.settings.read_timeout)
                .await
                .map_err(|e| {
                    tracing::error!(contract_id = %contract_id, error = %e, "contract failed validation");
                    e
                })?;
            tracing::info!(
                contract_id = %contract_id,
                clauses = config.clauses.len(),
                tariff = config.tariff.is_some(),
                "contract validated"
            );
        }
        Ok(())
    }

    pub async fn evaluate(
        &self,
        contract_id: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> EngineResult<EvaluationOutcome> {
        let started = Instant::now();
        let res = self.evaluate_inner(contract_id, period_start, period_end).await;
        metrics::histogram!("evaluation_duration_seconds").record(started.elapsed().as_secs_f64());
        match &res {
            Ok(outcome) => {
                metrics::counter!("evaluations_total").increment(1);
                tracing::info!(
                    contract_id = %contract_id,
                    period = %outcome.period,
                    results = outcome.rule_results.len(),
                    defaults_created = outcome.default_events_created.len(),
                    notes = outcome.processing_notes.len(),
                    "evaluation complete"
                );
            }
            Err(e) => {
                metrics::counter!("evaluation_failures_total", "category" => e.category().as_str()).increment(1);
                tracing::error!(contract_id = %contract_id, error = %e, "evaluation failed");
            }
        }
        res
    }

    async fn evaluate_inner(
        &self,
        contract_id: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> EngineResult<EvaluationOutcome> {
        let period = BillingPeriod::new(period_start, period_end)?;
        let read_err = |clause: Option<&str>, e: StoreError| {
            EngineError::data_unavailable(contract_id, period.id(), clause, e.to_string())
        };

        let config = self
            .cache
            .get(self.store.as_ref(), contract_id, self.settings.read_timeout)
            .await
            .map_err(|e| match e {
                EngineError::Store(e) => read_err(None, e),
                other => other,
            })?;

        let scan_end = period.end + Duration::minutes(i64::from(self.settings.detection.lookahead_minutes));
        let records = self
            .read("external records", self.store.load_external_records(period.start, scan_end))
            .await
            .map_err(|e| read_err(None, e))?;
        let mut data = PeriodData {
            records,
            readings: BTreeMap::new(),
        };

        let mut computed = Vec::with_capacity(config.clauses.len());
        for clause in &config.clauses {
            let result = self.evaluate_one(&config, clause, &period, scan_end, &mut data).await?;
            computed.push(result);
        }

        let delivered = match &config.tariff {
            Some(tariff) => Some(self.delivered_energy(&config, tariff, &period, scan_end, &mut data).await?),
            None => None,
        };

        let mut notes = Vec::new();
        let mut rule_results = Vec::with_capacity(computed.len());
        let mut created = Vec::new();
        for (clause, result) in config.clauses.iter().zip(computed) {
            let stored = self.persist_result(result, &mut notes).await?;
            if let Some(default) = DefaultEvent::from_breach(&stored, clause) {
                match self.store.insert_default_event(&default).await? {
                    InsertOutcome::Inserted => {
                        metrics::counter!("default_events_created_total").increment(1);
                        tracing::info!(
                            contract_id = %contract_id,
                            clause_id = %clause.clause_id,
                            default_event_id = %default.id,
                            accrued_penalty = %default.accrued_penalty,
                            "default event opened"
                        );
                        created.push(default);
                    }
                    InsertOutcome::Existing(existing) => notes.push(ProcessingNote::info(
                        Some(&clause.clause_id),
                        format!("default event {} already exists with status {}", existing.id, existing.status),
                    )),
                }
            }
            rule_results.push(stored);
        }

        let expected_invoice = match (&config.tariff, delivered) {
            (Some(tariff), Some(kwh)) => {
                let invoice = build_expected_invoice(contract_id, &period, tariff, kwh, &rule_results)
                    .map_err(|e| tariff_error(contract_id, &period, e))?;
                self.store.put_expected_invoice(&invoice).await?;
                Some(invoice)
            }
            _ => None,
        };

        Ok(EvaluationOutcome {
            contract_id: contract_id.to_string(),
            period,
            rule_results,
            default_events_created: created,
            processing_notes: notes,
            expected_invoice,
        })
    }

    async fn evaluate_one(
        &self,
        config: &ContractConfig,
        clause: &GuaranteeClause,
        period: &BillingPeriod,
        scan_end: OffsetDateTime,
        data: &mut PeriodData,
    ) -> EngineResult<RuleResult> {
        let contract_id = config.contract_id.as_str();
        clause.ensure_covers(period)?;
        let profile = self.settings.meters.get(&clause.meter_id).ok_or_else(|| {
            EngineError::config(&clause.clause_id, "meter_id", format!("meter '{}' has no configured profile", clause.meter_id))
        })?;

        for meter in clause.meter_ids() {
            self.ensure_readings(contract_id, &clause.clause_id, meter, period, scan_end, data)
                .await?;
        }
        let readings = data.readings.get(&clause.meter_id).map(Vec::as_slice).unwrap_or_default();

        let agg = aggregate(profile, period, readings, &self.settings.aggregation);
        let detected = detect(
            DetectionInput {
                profile,
                readings,
                records: &data.records,
                window_start: period.start,
                window_end: scan_end,
            },
            &self.settings.aggregation,
            &self.settings.detection,
        );
        let events = events_for_period(detected, period, self.settings.detection.open_event_policy, contract_id)
            .map_err(|e| with_clause(e, &clause.clause_id))?;
        let excused = excusal::resolve(&events, &data.records, &clause.excusable_kinds);

        let interval = self.settings.aggregation.interval();
        let production = IntervalSeries::from_readings(&clause.meter_id, period.start, period.end, interval, readings);
        // Irradiance is held to the same coverage tolerance as production.
        let irradiance = match &clause.terms {
            GuaranteeTerms::Performance(p) => match p.irradiance_meter_id.as_deref() {
                Some(m) => {
                    let irr_profile = self.settings.meters.get(m).ok_or_else(|| {
                        EngineError::config(&clause.clause_id, "irradiance_meter_id", format!("meter '{m}' has no configured profile"))
                    })?;
                    let rs = data.readings.get(m).map(Vec::as_slice).unwrap_or_default();
                    aggregate(irr_profile, period, rs, &self.settings.aggregation)
                        .ensure_complete(contract_id, &clause.clause_id)?;
                    Some(IntervalSeries::from_readings(m, period.start, period.end, interval, rs))
                }
                None => None,
            },
            _ => None,
        };

        let prices = match clause.price_market() {
            Some(market) => Some(
                self.read("market prices", self.store.load_market_prices(market, period.start, period.end))
                    .await
                    .map_err(|e| {
                        EngineError::data_unavailable(contract_id, period.id(), Some(&clause.clause_id), e.to_string())
                    })?,
            ),
            None => None,
        };

        let needs_tariff = matches!(&clause.terms, GuaranteeTerms::Performance(p) if p.requires(InputKind::TariffRate));
        let tariff_rate = match (&config.tariff, needs_tariff) {
            (Some(t), true) => {
                t.ensure_covers(period)?;
                Some(t.rate_for(period).map_err(|e| tariff_error(contract_id, period, e))?)
            }
            _ => None,
        };

        let ctx = EvaluationContext {
            contract_id,
            period: *period,
            aggregate: &agg,
            events: &events,
            excused: &excused,
            series: SeriesInputs {
                production: Some(&production),
                irradiance: irradiance.as_ref(),
                market_prices: prices.as_deref(),
                tariff_rate,
            },
        };
        let result = evaluate_clause(clause, &ctx)?;
        if result.breach {
            metrics::counter!("rule_breaches_total", "guarantee_type" => clause.guarantee_type.as_str()).increment(1);
        }
        tracing::debug!(
            contract_id = %contract_id,
            clause_id = %clause.clause_id,
            events = events.len(),
            excused_periods = excused.len(),
            breach = result.breach,
            computed_value = %result.computed_value,
            "clause evaluated"
        );
        Ok(result)
    }

    /// Energy on the tariff's billing meter; an incomplete aggregate is refused.
    async fn delivered_energy(
        &self,
        config: &ContractConfig,
        tariff: &Tariff,
        period: &BillingPeriod,
        scan_end: OffsetDateTime,
        data: &mut PeriodData,
    ) -> EngineResult<Decimal> {
        tariff.ensure_covers(period)?;
        let scope = format!("tariff:{}", config.contract_id);
        let profile = self.settings.meters.get(&tariff.billing_meter_id).ok_or_else(|| {
            EngineError::config(&scope, "billing_meter_id", format!("meter '{}' has no configured profile", tariff.billing_meter_id))
        })?;
        self.ensure_readings(&config.contract_id, &scope, &tariff.billing_meter_id, period, scan_end, data)
            .await?;
        let readings = data
            .readings
            .get(&tariff.billing_meter_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let agg: MeterAggregate = aggregate(profile, period, readings, &self.settings.aggregation);
        agg.ensure_complete(&config.contract_id, &scope)?;
        Ok(agg.total_production)
    }

    async fn ensure_readings(
        &self,
        contract_id: &str,
        clause_id: &str,
        meter_id: &str,
        period: &BillingPeriod,
        scan_end: OffsetDateTime,
        data: &mut PeriodData,
    ) -> EngineResult<()> {
        if data.readings.contains_key(meter_id) {
            return Ok(());
        }
        let readings = self
            .read("meter readings", self.store.load_readings(meter_id, period.start, scan_end))
            .await
            .map_err(|e| EngineError::data_unavailable(contract_id, period.id(), Some(clause_id), e.to_string()))?;
        data.readings.insert(meter_id.to_string(), readings);
        Ok(())
    }

    async fn read<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        with_timeout(self.settings.read_timeout, operation, fut).await
    }

    /// Stores a result, or returns the one stored first for the same key.
    async fn persist_result(&self, result: RuleResult, notes: &mut Vec<ProcessingNote>) -> EngineResult<RuleResult> {
        match self.store.insert_rule_result(&result).await? {
            InsertOutcome::Inserted => Ok(result),
            InsertOutcome::Existing(stored) => {
                metrics::counter!("idempotent_replays_total").increment(1);
                if stored.digest == result.digest {
                    notes.push(ProcessingNote::info(
                        Some(&result.clause_id),
                        format!("result {} already recorded; returning stored result", stored.id),
                    ));
                } else {
                    tracing::warn!(
                        contract_id = %result.contract_id,
                        clause_id = %result.clause_id,
                        stored_digest = %stored.digest,
                        recomputed_digest = %result.digest,
                        "recomputed result differs from stored result"
                    );
                    notes.push(ProcessingNote::warning(
                        Some(&result.clause_id),
                        format!(
                            "recomputation of {} differs from the stored result (digest {} vs {}); stored result kept",
                            stored.id, stored.digest, result.digest
                        ),
                    ));
                }
                Ok(stored)
            }
        }
    }

    pub async fn cure_default(&self, default_event_id: &str, cure_timestamp: OffsetDateTime) -> EngineResult<DefaultEvent> {
        self.transition(default_event_id, DefaultAction::Cure { at: cure_timestamp }).await
    }

    pub async fn waive_default(&self, default_event_id: &str, justification: &str) -> EngineResult<DefaultEvent> {
        self.transition(
            default_event_id,
            DefaultAction::Waive {
                justification: justification.to_string(),
            },
        )
        .await
    }

    async fn transition(&self, id: &str, action: DefaultAction) -> EngineResult<DefaultEvent> {
        let mut event = self.load_default(id).await?;
        let before = event.status;
        let action_name = action.name();
        event.apply(action)?;

        match self.store.update_default_event(before, &event).await {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => {
                let current = self.load_default(id).await?;
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from: current.status.to_string(),
                    action: action_name,
                });
            }
            Err(e) => return Err(e.into()),
        }

        metrics::counter!("default_transitions_total", "status" => event.status.as_str()).increment(1);
        tracing::info!(
            default_event_id = %id,
            contract_id = %event.contract_id,
            clause_id = %event.clause_id,
            status = %event.status,
            final_penalty = ?event.final_penalty,
            cured_after_deadline = event.cured_after_deadline,
            "default event transitioned"
        );
        Ok(event)
    }

    async fn load_default(&self, id: &str) -> EngineResult<DefaultEvent> {
        self.read("default event", self.store.load_default_event(id))
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "default event",
                id: id.to_string(),
            })
    }

    pub async fn load_default_event(&self, id: &str) -> EngineResult<DefaultEvent> {
        self.load_default(id).await
    }

    /// Records an invoice received from the counterparty for later reconciliation.
    pub async fn submit_received_invoice(&self, invoice: &ReceivedInvoice) -> EngineResult<()> {
        if invoice.id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("received invoice needs an id".to_string()));
        }
        BillingPeriod::new(invoice.period.start, invoice.period.end)?;
        self.store.put_received_invoice(invoice).await?;
        Ok(())
    }

    pub async fn reconcile_invoices(
        &self,
        expected_invoice_id: &str,
        received_invoice_id: &str,
    ) -> EngineResult<InvoiceComparison> {
        let expected = self
            .read("expected invoice", self.store.load_expected_invoice(expected_invoice_id))
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "expected invoice",
                id: expected_invoice_id.to_string(),
            })?;
        let received = self
            .read("received invoice", self.store.load_received_invoice(received_invoice_id))
            .await?
            .ok_or_else(|| EngineError::NotFound {
                kind: "received invoice",
                id: received_invoice_id.to_string(),
            })?;
        if expected.contract_id != received.contract_id {
            return Err(EngineError::InvalidRequest(format!(
                "expected invoice is for contract {} but received invoice is for {}",
                expected.contract_id, received.contract_id
            )));
        }

        let comparison = reconcile(&expected, &received, &self.settings.reconciliation);
        self.store.put_invoice_comparison(&comparison).await?;
        tracing::info!(
            contract_id = %comparison.contract_id,
            expected_invoice_id = %expected_invoice_id,
            received_invoice_id = %received_invoice_id,
            header_variance = %comparison.header_variance,
            findings = comparison.findings.len(),
            review_required = comparison.review_required,
            "invoices reconciled"
        );
        Ok(comparison)
    }
}

fn with_clause(err: EngineError, clause_id: &str) -> EngineError {
    match err {
        EngineError::DataUnavailable {
            contract_id,
            period,
            clause_id: None,
            reason,
        } => EngineError::DataUnavailable {
            contract_id,
            period,
            clause_id: Some(clause_id.to_string()),
            reason,
        },
        other => other,
    }
}

fn tariff_error(contract_id: &str, period: &BillingPeriod, err: FormulaError) -> EngineError {
    let scope = format!("tariff:{contract_id}");
    if err.is_data_error() {
        EngineError::data_unavailable(contract_id, period.id(), Some(&scope), err.to_string())
    } else {
        EngineError::config(scope, "escalation", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregationConfig, OpenEventPolicy};
    use crate::contract::fixtures::{availability_doc, performance_doc, tariff_doc};
    use crate::defaults::DefaultStatus;
    use crate::invoice::{FindingKind, InvoiceLine, LineType};
    use crate::store::MemoryStore;
    use crate::testutil::{dec, generation_meter, irradiance_meter, price, reading, record};
    use compliance_client::domain::RecordKind;
    use serde_json::json;
    use time::macros::datetime;

    const JUNE: OffsetDateTime = datetime!(2024-06-01 00:00:00 UTC);
    const JULY: OffsetDateTime = datetime!(2024-07-01 00:00:00 UTC);

    fn settings(policy: OpenEventPolicy) -> EngineSettings {
        let mut s = EngineSettings::default()
            .with_meter(generation_meter("plant-1"))
            .with_meter(irradiance_meter("plant-1-pyr"));
        s.aggregation = AggregationConfig {
            interval_minutes: 12,
            ..AggregationConfig::default()
        };
        s.detection.open_event_policy = policy;
        s
    }

    /// June in 12-minute slots: 4,850,000 kWh with a 61.2 h outage from June 10.
    fn june_readings() -> Vec<MeterReading> {
        let outage_start = datetime!(2024-06-10 00:00:00 UTC);
        let outage_end = outage_start + Duration::minutes(3672);
        let mut out = Vec::with_capacity(3600);
        let mut ts = JUNE;
        while ts < JULY {
            let value = if ts >= outage_start && ts < outage_end {
                0
            } else if ts == JUNE {
                2704
            } else {
                1472
            };
            out.push(reading("plant-1", ts, value));
            ts += Duration::minutes(12);
        }
        out
    }

    async fn engine_with(readings: Vec<MeterReading>, policy: OpenEventPolicy) -> (Arc<MemoryStore>, ComplianceEngine) {
        let store = Arc::new(MemoryStore::new());
        store.put_guarantee_config(availability_doc("AV-1")).await;
        store.put_tariff_config(tariff_doc()).await;
        store.add_readings(readings).await;
        let engine = ComplianceEngine::new(
            store.clone(),
            Arc::new(FormulaRegistry::with_builtin()),
            Arc::new(settings(policy)),
        );
        (store, engine)
    }

    #[tokio::test]
    async fn june_outage_produces_liquidated_damages_and_net_invoice() {
        let (_, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let outcome = engine.evaluate("c-1", JUNE, JULY).await.unwrap();

        assert_eq!(outcome.rule_results.len(), 1);
        let r = &outcome.rule_results[0];
        assert!(r.breach);
        assert_eq!(r.computed_value, dec("91.5"));
        assert_eq!(r.penalty_amount, dec("175000.00"));

        assert_eq!(outcome.default_events_created.len(), 1);
        assert_eq!(outcome.default_events_created[0].id, r.id);

        let invoice = outcome.expected_invoice.unwrap();
        assert_eq!(invoice.lines[0].quantity, Some(dec("4850000")));
        assert_eq!(invoice.total, dec("43250.00"));
        assert!(outcome.processing_notes.is_empty());
    }

    #[tokio::test]
    async fn re_evaluation_is_idempotent() {
        let (store, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let first = engine.evaluate("c-1", JUNE, JULY).await.unwrap();
        let second = engine.evaluate("c-1", JUNE, JULY).await.unwrap();

        assert_eq!(first.rule_results, second.rule_results);
        assert!(second.default_events_created.is_empty());
        assert_eq!(second.processing_notes.len(), 2, "{:?}", second.processing_notes);
        assert!(second.processing_notes.iter().all(|n| n.level == NoteLevel::Info));
        assert_eq!(store.rule_result_count().await, 1);
        assert_eq!(store.default_events("c-1").await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicates_open_one_default() {
        let (store, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let (a, b) = tokio::join!(engine.evaluate("c-1", JUNE, JULY), engine.evaluate("c-1", JUNE, JULY));
        let created = a.unwrap().default_events_created.len() + b.unwrap().default_events_created.len();
        assert_eq!(created, 1);
        assert_eq!(store.default_events("c-1").await.len(), 1);
    }

    #[tokio::test]
    async fn changed_inputs_keep_the_stored_result_with_a_warning() {
        let (store, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let first = engine.evaluate("c-1", JUNE, JULY).await.unwrap();

        let mut amended = availability_doc("AV-1");
        amended.version = 2;
        amended.threshold_pct = dec("97");
        store.put_guarantee_config(amended).await;
        let second = engine.evaluate("c-1", JUNE, JULY).await.unwrap();
        assert_eq!(second.rule_results, first.rule_results);
        assert!(second.processing_notes.iter().any(|n| n.level == NoteLevel::Warning));
    }

    #[tokio::test]
    async fn open_outage_at_period_end_blocks_evaluation() {
        let mut readings = june_readings();
        for r in readings.iter_mut().filter(|r| r.ts >= datetime!(2024-06-30 20:00:00 UTC)) {
            r.value = Decimal::ZERO;
        }
        let (store, engine) = engine_with(readings.clone(), OpenEventPolicy::Block).await;
        let err = engine.evaluate("c-1", JUNE, JULY).await.unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { clause_id: Some(ref c), .. } if c == "AV-1"));
        assert_eq!(store.rule_result_count().await, 0);

        let (_, engine) = engine_with(readings, OpenEventPolicy::TimeBox).await;
        let outcome = engine.evaluate("c-1", JUNE, JULY).await.unwrap();
        assert!(outcome.rule_results[0].computed_value < dec("91.5"));
    }

    #[tokio::test]
    async fn incomplete_coverage_fails_closed() {
        let readings: Vec<MeterReading> = june_readings().into_iter().step_by(2).collect();
        let (store, engine) = engine_with(readings, OpenEventPolicy::Block).await;
        let err = engine.evaluate("c-1", JUNE, JULY).await.unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
        assert_eq!(store.rule_result_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_type_code_is_a_configuration_error() {
        let (store, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let mut doc = performance_doc("PR-1");
        doc.available_energy = Some(crate::formulas::FormulaRef {
            type_code: "AE_BOGUS".to_string(),
            params: serde_json::Value::Null,
        });
        store.put_guarantee_config(doc).await;

        let err = engine.evaluate("c-1", JUNE, JULY).await.unwrap_err();
        match err {
            EngineError::Configuration { clause_id, field, .. } => {
                assert_eq!(clause_id, "PR-1");
                assert_eq!(field, "available_energy.type_code");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn period_outside_clause_window_is_rejected() {
        let (_, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let err = engine
            .evaluate("c-1", datetime!(2024-12-01 00:00:00 UTC), datetime!(2025-01-02 00:00:00 UTC))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration { ref field, .. } if field == "window"));
    }

    #[tokio::test]
    async fn cure_and_waive_follow_the_lifecycle() {
        let (_, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let outcome = engine.evaluate("c-1", JUNE, JULY).await.unwrap();
        let id = outcome.default_events_created[0].id.clone();

        let err = engine.waive_default(&id, "   ").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        let err = engine.cure_default(&id, datetime!(2024-06-20 00:00:00 UTC)).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));

        let cured = engine.cure_default(&id, datetime!(2024-08-05 00:00:00 UTC)).await.unwrap();
        assert_eq!(cured.status, DefaultStatus::Cured);
        assert_eq!(cured.final_penalty, Some(dec("175000.00")));
        assert!(cured.cured_after_deadline);

        let err = engine.waive_default(&id, "board approval").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { ref from, .. } if from == "cured"));
        assert_eq!(engine.load_default_event(&id).await.unwrap().status, DefaultStatus::Cured);

        let err = engine.cure_default("missing", JULY).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "default event", .. }));
    }

    #[tokio::test]
    async fn received_invoice_without_damages_needs_review() {
        let (_, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        let expected = engine.evaluate("c-1", JUNE, JULY).await.unwrap().expected_invoice.unwrap();

        let received = ReceivedInvoice {
            id: "seller-2024-06".to_string(),
            contract_id: "c-1".to_string(),
            period: expected.period,
            currency: "USD".to_string(),
            invoice_number: None,
            lines: vec![InvoiceLine {
                line_type: LineType::Energy,
                description: "Energy June".to_string(),
                quantity: Some(dec("4850000")),
                unit_price: Some(dec("0.045")),
                amount: dec("218250.00"),
                clause_id: None,
            }],
            stated_total: dec("218250.00"),
        };
        engine.submit_received_invoice(&received).await.unwrap();

        let cmp = engine.reconcile_invoices(&expected.id, &received.id).await.unwrap();
        assert!(cmp.review_required);
        assert!(cmp.has_finding(FindingKind::MissingMaterialPenalty));
        assert_eq!(cmp.header_variance, dec("175000.00"));

        let err = engine.reconcile_invoices(&expected.id, "nope").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "received invoice", .. }));
    }

    const DAY: OffsetDateTime = datetime!(2024-06-03 00:00:00 UTC);
    const NEXT_DAY: OffsetDateTime = datetime!(2024-06-04 00:00:00 UTC);

    /// One day at 80 kWh per slot; the pyranometer reports every `irr_every`th slot.
    async fn performance_engine(doc: crate::contract::GuaranteeConfigDoc, irr_every: usize) -> (Arc<MemoryStore>, ComplianceEngine) {
        let store = Arc::new(MemoryStore::new());
        store.put_guarantee_config(doc).await;
        store.put_tariff_config(tariff_doc()).await;
        let mut readings = Vec::new();
        for i in 0..120 {
            let ts = DAY + Duration::minutes(12 * i as i64);
            readings.push(reading("plant-1", ts, 80));
            if i % irr_every == 0 {
                readings.push(reading("plant-1-pyr", ts, 1));
            }
        }
        store.add_readings(readings).await;
        let engine = ComplianceEngine::new(
            store.clone(),
            Arc::new(FormulaRegistry::with_builtin()),
            Arc::new(settings(OpenEventPolicy::Block)),
        );
        (store, engine)
    }

    #[tokio::test]
    async fn performance_shortfall_is_paid_at_the_tariff_multiple() {
        let (_, engine) = performance_engine(performance_doc("PR-1"), 1).await;
        let outcome = engine.evaluate("c-1", DAY, NEXT_DAY).await.unwrap();
        let r = &outcome.rule_results[0];
        assert!(r.breach);
        assert_eq!(r.computed_value, dec("80"));
        // 1200 kWh short × 0.045 × 1.5
        assert_eq!(r.penalty_amount, dec("81.00"));
    }

    #[tokio::test]
    async fn sparse_irradiance_fails_closed() {
        let (store, engine) = performance_engine(performance_doc("PR-1"), 2).await;
        let err = engine.evaluate("c-1", DAY, NEXT_DAY).await.unwrap_err();
        assert!(
            matches!(err, EngineError::DataUnavailable { clause_id: Some(ref c), .. } if c == "PR-1"),
            "{err:?}"
        );
        assert_eq!(store.rule_result_count().await, 0);
    }

    #[tokio::test]
    async fn market_prices_in_the_period_set_the_reference_price() {
        let mut doc = performance_doc("PR-1");
        doc.reference_price = Some(crate::formulas::FormulaRef {
            type_code: "GRP_MARKET_AVERAGE".to_string(),
            params: json!({"market": "ERCOT-N"}),
        });
        doc.shortfall_payment = Some(crate::formulas::FormulaRef {
            type_code: "SP_REFERENCE_PRICE_DIFFERENCE".to_string(),
            params: json!({}),
        });
        let (store, engine) = performance_engine(doc, 1).await;
        store
            .add_market_prices([
                price("ERCOT-N", datetime!(2024-06-03 06:00:00 UTC), 8),
                price("ERCOT-N", datetime!(2024-06-03 18:00:00 UTC), 10),
                price("ERCOT-N", datetime!(2024-06-05 12:00:00 UTC), 90),
                price("ERCOT-S", datetime!(2024-06-03 12:00:00 UTC), 90),
            ])
            .await;

        let outcome = engine.evaluate("c-1", DAY, NEXT_DAY).await.unwrap();
        let r = &outcome.rule_results[0];
        assert!(r.breach);
        // 1200 kWh × (0.09 − 0.045)
        assert_eq!(r.penalty_amount, dec("54.00"));
    }

    #[tokio::test]
    async fn missing_market_prices_leave_no_result() {
        let mut doc = performance_doc("PR-1");
        doc.reference_price = Some(crate::formulas::FormulaRef {
            type_code: "GRP_MARKET_AVERAGE".to_string(),
            params: json!({"market": "ERCOT-N"}),
        });
        doc.shortfall_payment = Some(crate::formulas::FormulaRef {
            type_code: "SP_REFERENCE_PRICE_DIFFERENCE".to_string(),
            params: json!({}),
        });
        let (store, engine) = performance_engine(doc, 1).await;
        let err = engine.evaluate("c-1", DAY, NEXT_DAY).await.unwrap_err();
        assert!(
            matches!(err, EngineError::DataUnavailable { clause_id: Some(ref c), .. } if c == "PR-1"),
            "{err:?}"
        );
        assert_eq!(store.rule_result_count().await, 0);
    }

    #[tokio::test]
    async fn grid_outage_record_excuses_part_of_the_outage() {
        let (store, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        store
            .add_external_records([record(
                "GO-1",
                RecordKind::GridOutage,
                datetime!(2024-06-10 00:00:00 UTC),
                datetime!(2024-06-10 12:00:00 UTC),
            )])
            .await;

        let outcome = engine.evaluate("c-1", JUNE, JULY).await.unwrap();
        let r = &outcome.rule_results[0];
        assert!(r.breach);
        assert!(r.excused);
        // (720 − 49.2) / (720 − 12) × 100 = 94.7458
        assert_eq!(r.computed_value.round_dp(4), dec("94.7458"));
        assert_eq!(r.penalty_amount, dec("12711.86"));
    }

    #[tokio::test]
    async fn startup_validation_names_the_bad_clause() {
        let (store, engine) = engine_with(june_readings(), OpenEventPolicy::Block).await;
        engine.validate_contracts(&["c-1".to_string()]).await.unwrap();

        let mut doc = performance_doc("PR-1");
        doc.shortfall_payment = Some(crate::formulas::FormulaRef {
            type_code: "SP_BOGUS".to_string(),
            params: serde_json::Value::Null,
        });
        store.put_guarantee_config(doc).await;
        let err = engine
            .validate_contracts(&["c-1".to_string(), "c-2".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration { ref clause_id, ref field, .. }
            if clause_id == "PR-1" && field == "formulas"));
    }
}
