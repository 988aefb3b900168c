use std::{fs::File, path::PathBuf};

use compliance_client::domain::MarketPrice;
use rust_decimal::Decimal;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, RecordStream, Source};

/// CSV file with columns `market,ts,price_per_kwh`.
pub struct MarketPriceCsvSource {
    path: PathBuf,
}

impl MarketPriceCsvSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    market: String,
    #[serde(with = "time::serde::rfc3339")]
    ts: OffsetDateTime,
    price_per_kwh: Decimal,
}

impl From<PriceRow> for MarketPrice {
    fn from(row: PriceRow) -> Self {
        MarketPrice {
            market: row.market,
            ts: row.ts,
            price_per_kwh: row.price_per_kwh,
        }
    }
}

#[async_trait::async_trait]
impl Source<MarketPrice> for MarketPriceCsvSource {
    async fn stream(&self) -> RecordStream<MarketPrice> {
        let path = self.path.clone();
        let s = async_stream::stream! {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to open {}: {e}", path.display())));
                    return;
                }
            };
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);
            for (i, row) in rdr.deserialize::<PriceRow>().enumerate() {
                let origin = format!("{name}:{}", i + 2);
                let item = row.map(MarketPrice::from).map_err(|e| PipelineError::Rejected {
                    origin: origin.clone(),
                    reason: format!("invalid price row: {e}"),
                });
                if item.is_err() {
                    metrics::counter!("fixture_parse_errors_total", "source" => "market_prices").increment(1);
                }
                yield item.map(|price| Envelope::new(price, origin));
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn bad_rows_become_rejections() {
        let path = std::env::temp_dir().join(format!("compliance-prices-{}.csv", std::process::id()));
        std::fs::write(
            &path,
            "market,ts,price_per_kwh\n\
             ERCOT-N, 2024-06-01T00:00:00Z, 0.0412\n\
             ERCOT-N,yesterday,0.05\n",
        )
        .unwrap();

        let items: Vec<_> = MarketPriceCsvSource::new(&path).stream().await.collect().await;
        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.payload.market, "ERCOT-N");
        assert_eq!(first.payload.price_per_kwh, Decimal::new(412, 4));
        assert!(matches!(&items[1], Err(PipelineError::Rejected { origin, .. }) if origin.ends_with(":3")));

        let _ = std::fs::remove_file(&path);
    }
}
