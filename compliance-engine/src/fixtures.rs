//! Loads a directory of fixture files into a `MemoryStore`.
//!
//! Layout:
//! - `readings.csv` (required)
//! - `records.ndjson`, `prices.csv` (optional)
//! - `guarantees.json`: array of guarantee clause documents (required)
//! - `tariff.json`, `received_invoices.json` (optional)

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use compliance_client::domain::{ExternalRecord, MarketPrice, MeterReading};
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    contract::{GuaranteeConfigDoc, TariffConfigDoc},
    invoice::ReceivedInvoice,
    pipeline::Pipeline,
    sinks::MemoryStoreSink,
    sources::{ExternalRecordNdjsonSource, MarketPriceCsvSource, MeterReadingCsvSource},
    store::{EvaluationStore, MemoryStore},
    transform::{ExternalRecordValidation, MarketPriceValidation, ReadingValidation},
};

const SINK_BATCH_SIZE: usize = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixtureSummary {
    pub readings: usize,
    pub external_records: usize,
    pub market_prices: usize,
    pub guarantee_clauses: usize,
    pub tariffs: usize,
    pub received_invoices: usize,
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn optional(dir: &Path, name: &str) -> Option<PathBuf> {
    let p = dir.join(name);
    p.is_file().then_some(p)
}

pub async fn load_dir(dir: &Path, store: Arc<MemoryStore>) -> anyhow::Result<FixtureSummary> {
    let mut summary = FixtureSummary::default();

    let readings = dir.join("readings.csv");
    anyhow::ensure!(readings.is_file(), "fixture directory {} has no readings.csv", dir.display());
    let pipeline: Pipeline<_, MeterReading, _> = Pipeline {
        source: MeterReadingCsvSource::new(readings),
        transforms: vec![Arc::new(ReadingValidation)],
        sink: MemoryStoreSink::new(Arc::clone(&store), SINK_BATCH_SIZE),
    };
    summary.readings = pipeline.run().await?;

    if let Some(path) = optional(dir, "records.ndjson") {
        let pipeline: Pipeline<_, ExternalRecord, _> = Pipeline {
            source: ExternalRecordNdjsonSource::new(path),
            transforms: vec![Arc::new(ExternalRecordValidation)],
            sink: MemoryStoreSink::new(Arc::clone(&store), SINK_BATCH_SIZE),
        };
        summary.external_records = pipeline.run().await?;
    }

    if let Some(path) = optional(dir, "prices.csv") {
        let pipeline: Pipeline<_, MarketPrice, _> = Pipeline {
            source: MarketPriceCsvSource::new(path),
            transforms: vec![Arc::new(MarketPriceValidation)],
            sink: MemoryStoreSink::new(Arc::clone(&store), SINK_BATCH_SIZE),
        };
        summary.market_prices = pipeline.run().await?;
    }

    let guarantees: Vec<GuaranteeConfigDoc> = read_json(&dir.join("guarantees.json")).await?;
    summary.guarantee_clauses = guarantees.len();
    for doc in guarantees {
        store.put_guarantee_config(doc).await;
    }

    if let Some(path) = optional(dir, "tariff.json") {
        let tariff: TariffConfigDoc = read_json(&path).await?;
        store.put_tariff_config(tariff).await;
        summary.tariffs = 1;
    }

    if let Some(path) = optional(dir, "received_invoices.json") {
        let invoices: Vec<ReceivedInvoice> = read_json(&path).await?;
        summary.received_invoices = invoices.len();
        for invoice in &invoices {
            store.put_received_invoice(invoice).await?;
        }
    }

    tracing::info!(
        dir = %dir.display(),
        readings = summary.readings,
        external_records = summary.external_records,
        market_prices = summary.market_prices,
        guarantee_clauses = summary.guarantee_clauses,
        "fixtures loaded"
    );
    Ok(summary)
}
