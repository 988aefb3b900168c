use std::{future::Future, time::Duration};

use compliance_client::{
    db,
    domain::{ExternalRecord, MarketPrice, MeterReading},
};
use serde::de::DeserializeOwned;
use sqlx::{
    postgres::{PgPool, PgPoolOptions},
    types::Json,
};
use time::OffsetDateTime;

use super::{EvaluationStore, InsertOutcome, StoreError, StoreResult};
use crate::{
    config::DatabaseConfig,
    contract::{ConfigVersions, GuaranteeConfigDoc, TariffConfigDoc},
    defaults::{DefaultEvent, DefaultStatus},
    invoice::{ExpectedInvoice, InvoiceComparison, ReceivedInvoice},
    rules::RuleResult,
};

/// Postgres-backed store. Schema: `sql/schema/*.sql`, applied out-of-band.
pub struct PgEvaluationStore {
    pool: PgPool,
    max_retries: u32,
    retry_backoff: Duration,
}

fn version(kind: &'static str, raw: i32) -> StoreResult<u32> {
    u32::try_from(raw).map_err(|_| StoreError::Decode {
        kind,
        reason: format!("negative version {raw}"),
    })
}

impl PgEvaluationStore {
    pub fn new(pool: PgPool, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            pool,
            max_retries,
            retry_backoff,
        }
    }

    pub async fn connect(cfg: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .connect(&cfg.uri)
            .await?;
        Ok(Self::new(pool, cfg.max_retries, Duration::from_millis(cfg.retry_backoff_ms)))
    }

    /// Runs a write, retrying with linear backoff.
    async fn write<T, F, Fut>(&self, operation: &'static str, mut f: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, operation, "store write failed, retrying with backoff");
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, operation, "store write failed, giving up");
                    metrics::counter!("store_write_errors_total").increment(1);
                    return Err(e.into());
                }
            }
        }
    }

    async fn load_payload<T>(&self, kind: &'static str, sql: &str, id: &str) -> StoreResult<Option<T>>
    where
        T: DeserializeOwned + Send + Unpin + 'static,
    {
        let row: Option<(Json<T>,)> = sqlx::query_as(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::ColumnDecode { source, .. } => StoreError::Decode {
                    kind,
                    reason: source.to_string(),
                },
                other => other.into(),
            })?;
        Ok(row.map(|(Json(v),)| v))
    }
}

#[async_trait::async_trait]
impl EvaluationStore for PgEvaluationStore {
    async fn config_versions(&self, contract_id: &str) -> StoreResult<ConfigVersions> {
        let clauses: Vec<(String, i32)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (clause_id) clause_id, version
            FROM guarantee_configs
            WHERE contract_id = $1
            ORDER BY clause_id, version DESC
            "#,
        )
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        let tariff: Option<(i32,)> = sqlx::query_as(
            "SELECT MAX(version) FROM tariff_configs WHERE contract_id = $1 HAVING COUNT(*) > 0",
        )
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ConfigVersions {
            clauses: clauses
                .into_iter()
                .map(|(clause, v)| Ok((clause, version("guarantee config", v)?)))
                .collect::<StoreResult<_>>()?,
            tariff: tariff.map(|(v,)| version("tariff config", v)).transpose()?,
        })
    }

    async fn load_guarantee_configs(&self, contract_id: &str) -> StoreResult<Vec<GuaranteeConfigDoc>> {
        let rows: Vec<(Json<GuaranteeConfigDoc>,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (clause_id) doc
            FROM guarantee_configs
            WHERE contract_id = $1
            ORDER BY clause_id, version DESC
            "#,
        )
        .bind(contract_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(Json(doc),)| doc).collect())
    }

    async fn load_tariff_config(&self, contract_id: &str) -> StoreResult<Option<TariffConfigDoc>> {
        self.load_payload(
            "tariff config",
            "SELECT doc FROM tariff_configs WHERE contract_id = $1 ORDER BY version DESC LIMIT 1",
            contract_id,
        )
        .await
    }

    async fn load_readings(
        &self,
        meter_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<MeterReading>> {
        Ok(db::load_readings(&self.pool, meter_id, start, end).await?)
    }

    async fn load_external_records(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<ExternalRecord>> {
        Ok(db::load_external_records(&self.pool, start, end).await?)
    }

    async fn load_market_prices(
        &self,
        market: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<Vec<MarketPrice>> {
        Ok(db::load_market_prices(&self.pool, market, start, end).await?)
    }

    async fn insert_rule_result(&self, result: &RuleResult) -> StoreResult<InsertOutcome<RuleResult>> {
        let inserted = self
            .write("insert rule result", || {
                sqlx::query(
                    r#"
                    INSERT INTO rule_results
                        (idempotency_key, contract_id, clause_id, clause_version, period_start, period_end,
                         breach, penalty_amount, digest, payload)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    ON CONFLICT (idempotency_key) DO NOTHING
                    "#,
                )
                .bind(&result.id)
                .bind(&result.contract_id)
                .bind(&result.clause_id)
                .bind(result.clause_version as i32)
                .bind(result.period.start)
                .bind(result.period.end)
                .bind(result.breach)
                .bind(result.penalty_amount)
                .bind(&result.digest)
                .bind(Json(result))
                .execute(&self.pool)
            })
            .await?
            .rows_affected();
        if inserted > 0 {
            return Ok(InsertOutcome::Inserted);
        }
        let existing = self.load_rule_result(&result.id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "rule result",
            id: result.id.clone(),
        })?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn load_rule_result(&self, id: &str) -> StoreResult<Option<RuleResult>> {
        self.load_payload(
            "rule result",
            "SELECT payload FROM rule_results WHERE idempotency_key = $1",
            id,
        )
        .await
    }

    async fn insert_default_event(&self, event: &DefaultEvent) -> StoreResult<InsertOutcome<DefaultEvent>> {
        let inserted = self
            .write("insert default event", || {
                sqlx::query(
                    r#"
                    INSERT INTO default_events (id, contract_id, clause_id, period_start, status, payload)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(&event.id)
                .bind(&event.contract_id)
                .bind(&event.clause_id)
                .bind(event.period.start)
                .bind(event.status.as_str())
                .bind(Json(event))
                .execute(&self.pool)
            })
            .await?
            .rows_affected();
        if inserted > 0 {
            return Ok(InsertOutcome::Inserted);
        }
        let existing = self.load_default_event(&event.id).await?.ok_or_else(|| StoreError::NotFound {
            kind: "default event",
            id: event.id.clone(),
        })?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn load_default_event(&self, id: &str) -> StoreResult<Option<DefaultEvent>> {
        self.load_payload("default event", "SELECT payload FROM default_events WHERE id = $1", id)
            .await
    }

    async fn update_default_event(&self, expected: DefaultStatus, event: &DefaultEvent) -> StoreResult<()> {
        let updated = self
            .write("update default event", || {
                sqlx::query(
                    r#"
                    UPDATE default_events
                    SET status = $2, payload = $3, updated_at = now()
                    WHERE id = $1 AND status = $4
                    "#,
                )
                .bind(&event.id)
                .bind(event.status.as_str())
                .bind(Json(event))
                .bind(expected.as_str())
                .execute(&self.pool)
            })
            .await?
            .rows_affected();
        if updated > 0 {
            return Ok(());
        }
        match self.load_default_event(&event.id).await? {
            Some(_) => Err(StoreError::Conflict {
                kind: "default event",
                id: event.id.clone(),
                expected: expected.to_string(),
            }),
            None => Err(StoreError::NotFound {
                kind: "default event",
                id: event.id.clone(),
            }),
        }
    }

    async fn put_expected_invoice(&self, invoice: &ExpectedInvoice) -> StoreResult<()> {
        self.write("put expected invoice", || {
            sqlx::query(
                r#"
                INSERT INTO expected_invoices (id, contract_id, period_start, period_end, total, payload)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET total = EXCLUDED.total, payload = EXCLUDED.payload
                "#,
            )
            .bind(&invoice.id)
            .bind(&invoice.contract_id)
            .bind(invoice.period.start)
            .bind(invoice.period.end)
            .bind(invoice.total)
            .bind(Json(invoice))
            .execute(&self.pool)
        })
        .await
        .map(|_| ())
    }

    async fn load_expected_invoice(&self, id: &str) -> StoreResult<Option<ExpectedInvoice>> {
        self.load_payload("expected invoice", "SELECT payload FROM expected_invoices WHERE id = $1", id)
            .await
    }

    async fn put_received_invoice(&self, invoice: &ReceivedInvoice) -> StoreResult<()> {
        self.write("put received invoice", || {
            sqlx::query(
                r#"
                INSERT INTO received_invoices (id, contract_id, period_start, period_end, stated_total, payload)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO UPDATE SET stated_total = EXCLUDED.stated_total, payload = EXCLUDED.payload
                "#,
            )
            .bind(&invoice.id)
            .bind(&invoice.contract_id)
            .bind(invoice.period.start)
            .bind(invoice.period.end)
            .bind(invoice.stated_total)
            .bind(Json(invoice))
            .execute(&self.pool)
        })
        .await
        .map(|_| ())
    }

    async fn load_received_invoice(&self, id: &str) -> StoreResult<Option<ReceivedInvoice>> {
        self.load_payload("received invoice", "SELECT payload FROM received_invoices WHERE id = $1", id)
            .await
    }

    async fn put_invoice_comparison(&self, comparison: &InvoiceComparison) -> StoreResult<()> {
        self.write("put invoice comparison", || {
            sqlx::query(
                r#"
                INSERT INTO invoice_comparisons
                    (id, expected_invoice_id, received_invoice_id, review_required, payload)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET review_required = EXCLUDED.review_required, payload = EXCLUDED.payload
                "#,
            )
            .bind(&comparison.id)
            .bind(&comparison.expected_invoice_id)
            .bind(&comparison.received_invoice_id)
            .bind(comparison.review_required)
            .bind(Json(comparison))
            .execute(&self.pool)
        })
        .await
        .map(|_| ())
    }
}
