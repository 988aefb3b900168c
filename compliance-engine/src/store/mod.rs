//! Persistence boundary.
//!
//! The engine reads configuration and telemetry and writes results only
//! through [`EvaluationStore`]. Inserts of keyed records are insert-if-absent:
//! the loser of a race gets the stored record back instead of an error.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgEvaluationStore;

use std::{future::Future, time::Duration};

use compliance_client::domain::{ExternalRecord, MarketPrice, MeterReading};
use time::OffsetDateTime;

use crate::{
    contract::{ConfigVersions, GuaranteeConfigDoc, TariffConfigDoc},
    defaults::{DefaultEvent, DefaultStatus},
    invoice::{ExpectedInvoice, InvoiceComparison, ReceivedInvoice},
    rules::RuleResult,
};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{kind} '{id}' not found in store")]
    NotFound { kind: &'static str, id: String },

    /// Compare-and-set lost: the record is no longer in the expected state.
    #[error("{kind} '{id}' was modified concurrently (expected status {expected})")]
    Conflict {
        kind: &'static str,
        id: String,
        expected: String,
    },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("failed to decode stored {kind}: {reason}")]
    Decode { kind: &'static str, reason: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Backend(e.to_string())
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(e: anyhow::Error) -> Self {
        Self::Backend(format!("{e:#}"))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted,
    /// A record with the same key already existed; this is it.
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted)
    }
}

/// Bounds a store call by `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => {
            metrics::counter!("store_read_timeouts_total").increment(1);
            Err(StoreError::Timeout {
                operation: operation.to_string(),
                timeout,
            })
        }
    }
}

#[async_trait::async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Latest document version per clause, plus the tariff version.
    async fn config_versions(&self, contract_id: &str) -> StoreResult<ConfigVersions>;

    /// Latest version of every guarantee clause of a contract.
    async fn load_guarantee_configs(&self, contract_id: &str) -> StoreResult<Vec<GuaranteeConfigDoc>>;

    async fn load_tariff_config(&self, contract_id: &str) -> StoreResult<Option<TariffConfigDoc>>;

    async fn load_readings(
        &self,
        meter_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<MeterReading>>;

    /// Records overlapping `[start, end)`.
    async fn load_external_records(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<ExternalRecord>>;

    async fn load_market_prices(
        &self,
        market: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<MarketPrice>>;

    async fn insert_rule_result(&self, result: &RuleResult) -> StoreResult<InsertOutcome<RuleResult>>;

    async fn load_rule_result(&self, id: &str) -> StoreResult<Option<RuleResult>>;

    async fn insert_default_event(&self, event: &DefaultEvent) -> StoreResult<InsertOutcome<DefaultEvent>>;

    async fn load_default_event(&self, id: &str) -> StoreResult<Option<DefaultEvent>>;

    /// Replaces the stored event only while its status is still `expected`.
    async fn update_default_event(&self, expected: DefaultStatus, event: &DefaultEvent) -> StoreResult<()>;

    async fn put_expected_invoice(&self, invoice: &ExpectedInvoice) -> StoreResult<()>;

    async fn load_expected_invoice(&self, id: &str) -> StoreResult<Option<ExpectedInvoice>>;

    async fn put_received_invoice(&self, invoice: &ReceivedInvoice) -> StoreResult<()>;

    async fn load_received_invoice(&self, id: &str) -> StoreResult<Option<ReceivedInvoice>>;

    async fn put_invoice_comparison(&self, comparison: &InvoiceComparison) -> StoreResult<()>;
}
