use std::collections::{BTreeMap, HashMap};

use compliance_client::domain::{ExternalRecord, MarketPrice, MeterReading};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{EvaluationStore, InsertOutcome, StoreError, StoreResult};
use crate::{
    contract::{ConfigVersions, GuaranteeConfigDoc, TariffConfigDoc},
    defaults::{DefaultEvent, DefaultStatus},
    invoice::{ExpectedInvoice, InvoiceComparison, ReceivedInvoice},
    rules::RuleResult,
};

#[derive(Default)]
struct Inner {
    /// Current document per (contract, clause).
    guarantees: BTreeMap<(String, String), GuaranteeConfigDoc>,
    tariffs: BTreeMap<String, TariffConfigDoc>,
    readings: BTreeMap<String, Vec<MeterReading>>,
    records: Vec<ExternalRecord>,
    prices: BTreeMap<String, Vec<MarketPrice>>,
    rule_results: HashMap<String, RuleResult>,
    default_events: HashMap<String, DefaultEvent>,
    expected_invoices: HashMap<String, ExpectedInvoice>,
    received_invoices: HashMap<String, ReceivedInvoice>,
    comparisons: HashMap<String, InvoiceComparison>,
}

/// In-process store for fixture runs and tests.
///
/// One mutex guards everything, so check-then-insert is atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the clause document for its (contract, clause).
    pub async fn put_guarantee_config(&self, doc: GuaranteeConfigDoc) {
        let key = (doc.contract_id.clone(), doc.clause_id.clone());
        self.inner.lock().await.guarantees.insert(key, doc);
    }

    pub async fn put_tariff_config(&self, doc: TariffConfigDoc) {
        self.inner.lock().await.tariffs.insert(doc.contract_id.clone(), doc);
    }

    pub async fn add_readings(&self, readings: impl IntoIterator<Item = MeterReading>) {
        let mut inner = self.inner.lock().await;
        for r in readings {
            inner.readings.entry(r.meter_id.clone()).or_default().push(r);
        }
    }

    pub async fn add_external_records(&self, records: impl IntoIterator<Item = ExternalRecord>) {
        self.inner.lock().await.records.extend(records);
    }

    pub async fn add_market_prices(&self, prices: impl IntoIterator<Item = MarketPrice>) {
        let mut inner = self.inner.lock().await;
        for p in prices {
            inner.prices.entry(p.market.clone()).or_default().push(p);
        }
    }

    pub async fn default_events(&self, contract_id: &str) -> Vec<DefaultEvent> {
        let inner = self.inner.lock().await;
        let mut events: Vec<DefaultEvent> = inner
            .default_events
            .values()
            .filter(|d| d.contract_id == contract_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.period.start, &a.clause_id).cmp(&(b.period.start, &b.clause_id)));
        events
    }

    pub async fn rule_result_count(&self) -> usize {
        self.inner.lock().await.rule_results.len()
    }

    pub async fn load_invoice_comparison(&self, id: &str) -> Option<InvoiceComparison> {
        self.inner.lock().await.comparisons.get(id).cloned()
    }
}

#[async_trait::async_trait]
impl EvaluationStore for MemoryStore {
    async fn config_versions(&self, contract_id: &str) -> StoreResult<ConfigVersions> {
        let inner = self.inner.lock().await;
        Ok(ConfigVersions {
            clauses: inner
                .guarantees
                .values()
                .filter(|d| d.contract_id == contract_id)
                .map(|d| (d.clause_id.clone(), d.version))
                .collect(),
            tariff: inner.tariffs.get(contract_id).map(|t| t.version),
        })
    }

    async fn load_guarantee_configs(&self, contract_id: &str) -> StoreResult<Vec<GuaranteeConfigDoc>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .guarantees
            .values()
            .filter(|d| d.contract_id == contract_id)
            .cloned()
            .collect())
    }

    async fn load_tariff_config(&self, contract_id: &str) -> StoreResult<Option<TariffConfigDoc>> {
        Ok(self.inner.lock().await.tariffs.get(contract_id).cloned())
    }

    async fn load_readings(
        &self,
        meter_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<MeterReading>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<MeterReading> = inner
            .readings
            .get(meter_id)
            .map(|rs| rs.iter().filter(|r| start <= r.ts && r.ts < end).cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.value.cmp(&b.value)));
        Ok(out)
    }

    async fn load_external_records(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<ExternalRecord>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<ExternalRecord> = inner
            .records
            .iter()
            .filter(|r| r.start < end && r.end > start)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn load_market_prices(
        &self,
        market: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<MarketPrice>> {
        let inner = self.inner.lock().await;
        let mut out: Vec<MarketPrice> = inner
            .prices
            .get(market)
            .map(|ps| ps.iter().filter(|p| start <= p.ts && p.ts < end).cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|p| p.ts);
        Ok(out)
    }

    async fn insert_rule_result(&self, result: &RuleResult) -> StoreResult<InsertOutcome<RuleResult>> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.rule_results.get(&result.id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        inner.rule_results.insert(result.id.clone(), result.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn load_rule_result(&self, id: &str) -> StoreResult<Option<RuleResult>> {
        Ok(self.inner.lock().await.rule_results.get(id).cloned())
    }

    async fn insert_default_event(&self, event: &DefaultEvent) -> StoreResult<InsertOutcome<DefaultEvent>> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.default_events.get(&event.id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        inner.default_events.insert(event.id.clone(), event.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn load_default_event(&self, id: &str) -> StoreResult<Option<DefaultEvent>> {
        Ok(self.inner.lock().await.default_events.get(id).cloned())
    }

    async fn update_default_event(&self, expected: DefaultStatus, event: &DefaultEvent) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let current = inner.default_events.get_mut(&event.id).ok_or_else(|| StoreError::NotFound {
            kind: "default event",
            id: event.id.clone(),
        })?;
        if current.status != expected {
            return Err(StoreError::Conflict {
                kind: "default event",
                id: event.id.clone(),
                expected: expected.to_string(),
            });
        }
        *current = event.clone();
        Ok(())
    }

    async fn put_expected_invoice(&self, invoice: &ExpectedInvoice) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .expected_invoices
            .insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }

    async fn load_expected_invoice(&self, id: &str) -> StoreResult<Option<ExpectedInvoice>> {
        Ok(self.inner.lock().await.expected_invoices.get(id).cloned())
    }

    async fn put_received_invoice(&self, invoice: &ReceivedInvoice) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .received_invoices
            .insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }

    async fn load_received_invoice(&self, id: &str) -> StoreResult<Option<ReceivedInvoice>> {
        Ok(self.inner.lock().await.received_invoices.get(id).cloned())
    }

    async fn put_invoice_comparison(&self, comparison: &InvoiceComparison) -> StoreResult<()> {
        self.inner
            .lock()
            .await
            .comparisons
            .insert(comparison.id.clone(), comparison.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::fixtures::availability_doc;
    use crate::testutil::{hourly_readings, record};
    use compliance_client::domain::RecordKind;
    use time::macros::datetime;

    #[tokio::test]
    async fn newer_document_replaces_clause() {
        let store = MemoryStore::new();
        store.put_guarantee_config(availability_doc("AV-1")).await;
        let mut v2 = availability_doc("AV-1");
        v2.version = 2;
        store.put_guarantee_config(v2).await;
        store.put_guarantee_config(availability_doc("AV-2")).await;

        let versions = store.config_versions("c-1").await.unwrap();
        assert_eq!(versions.clauses.get("AV-1"), Some(&2));
        assert_eq!(versions.clauses.len(), 2);
        assert_eq!(versions.tariff, None);
        assert!(store.config_versions("c-2").await.unwrap().clauses.is_empty());
    }

    #[tokio::test]
    async fn reads_are_windowed_and_ordered() {
        let store = MemoryStore::new();
        let t0 = datetime!(2024-06-01 00:00:00 UTC);
        let mut readings = hourly_readings("m", t0, &[1, 2, 3, 4]);
        readings.reverse();
        store.add_readings(readings).await;
        store
            .add_external_records(vec![
                record("r-2", RecordKind::Weather, datetime!(2024-06-01 02:00:00 UTC), datetime!(2024-06-01 05:00:00 UTC)),
                record("r-1", RecordKind::GridOutage, datetime!(2024-05-31 00:00:00 UTC), datetime!(2024-06-01 00:00:00 UTC)),
            ])
            .await;

        let got = store
            .load_readings("m", datetime!(2024-06-01 01:00:00 UTC), datetime!(2024-06-01 03:00:00 UTC))
            .await
            .unwrap();
        let values: Vec<i64> = got.iter().map(|r| r.value.try_into().unwrap()).collect();
        assert_eq!(values, vec![2, 3]);

        let recs = store
            .load_external_records(t0, datetime!(2024-06-02 00:00:00 UTC))
            .await
            .unwrap();
        assert_eq!(recs.len(), 1, "record ending at the window start does not overlap");
        assert_eq!(recs[0].id, "r-2");
    }
}
