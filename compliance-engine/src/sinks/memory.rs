use std::sync::Arc;

use compliance_client::domain::{ExternalRecord, MarketPrice, MeterReading};
use futures::StreamExt;

use crate::{
    pipeline::{Envelope, PipelineError, Sink},
    store::MemoryStore,
};

/// Record types the fixture loader knows how to append to a `MemoryStore`.
#[async_trait::async_trait]
pub trait StoreLoad: Sized + Send + Sync + 'static {
    const KIND: &'static str;

    async fn append(store: &MemoryStore, batch: Vec<Self>);
}

#[async_trait::async_trait]
impl StoreLoad for MeterReading {
    const KIND: &'static str = "meter_readings";

    async fn append(store: &MemoryStore, batch: Vec<Self>) {
        store.add_readings(batch).await;
    }
}

#[async_trait::async_trait]
impl StoreLoad for ExternalRecord {
    const KIND: &'static str = "external_records";

    async fn append(store: &MemoryStore, batch: Vec<Self>) {
        store.add_external_records(batch).await;
    }
}

#[async_trait::async_trait]
impl StoreLoad for MarketPrice {
    const KIND: &'static str = "market_prices";

    async fn append(store: &MemoryStore, batch: Vec<Self>) {
        store.add_market_prices(batch).await;
    }
}

/// Batches accepted records into a `MemoryStore`; rejected items are logged and skipped.
pub struct MemoryStoreSink {
    store: Arc<MemoryStore>,
    batch_size: usize,
}

impl MemoryStoreSink {
    pub fn new(store: Arc<MemoryStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    async fn flush<T: StoreLoad>(&self, buffer: &mut Vec<Envelope<T>>) {
        if buffer.is_empty() {
            return;
        }
        let n = buffer.len();
        let batch: Vec<T> = buffer.drain(..).map(|env| env.payload).collect();
        T::append(&self.store, batch).await;
        metrics::counter!("fixture_records_loaded_total", "kind" => T::KIND).increment(n as u64);
    }
}

#[async_trait::async_trait]
impl<T: StoreLoad> Sink<T> for MemoryStoreSink {
    async fn run<S>(&self, mut input: S) -> Result<usize, PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static,
    {
        let mut buffer: Vec<Envelope<T>> = Vec::with_capacity(self.batch_size);
        let mut accepted = 0usize;

        while let Some(item) = input.next().await {
            let env = match item {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(error = %e, kind = T::KIND, "skipping fixture record");
                    metrics::counter!("fixture_records_skipped_total", "kind" => T::KIND).increment(1);
                    continue;
                }
            };

            buffer.push(env);
            accepted += 1;
            if buffer.len() >= self.batch_size {
                self.flush(&mut buffer).await;
            }
        }

        self.flush(&mut buffer).await;
        tracing::debug!(kind = T::KIND, accepted, "fixture sink drained");
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EvaluationStore;
    use crate::testutil::reading;
    use time::macros::datetime;

    #[tokio::test]
    async fn rejected_items_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let sink = MemoryStoreSink::new(Arc::clone(&store), 2);
        let items = vec![
            Ok(Envelope::new(reading("m-1", datetime!(2024-06-01 00:00:00 UTC), 1), "a:2")),
            Err(PipelineError::Rejected {
                origin: "a:3".into(),
                reason: "bad".into(),
            }),
            Ok(Envelope::new(reading("m-1", datetime!(2024-06-01 01:00:00 UTC), 2), "a:4")),
            Ok(Envelope::new(reading("m-1", datetime!(2024-06-01 02:00:00 UTC), 3), "a:5")),
        ];

        let accepted = Sink::<MeterReading>::run(&sink, futures::stream::iter(items)).await.unwrap();
        assert_eq!(accepted, 3);

        let loaded = store
            .load_readings("m-1", datetime!(2024-06-01 00:00:00 UTC), datetime!(2024-06-02 00:00:00 UTC))
            .await
            .unwrap();
        assert_eq!(loaded.len(), 3);
    }
}
