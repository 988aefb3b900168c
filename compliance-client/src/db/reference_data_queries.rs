use anyhow::{Context, Result};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{ExternalRecord, MarketPrice, RecordKind};

#[derive(Debug, Clone, sqlx::FromRow)]
struct ExternalRecordRow {
    id: String,
    kind: String,
    start_ts: OffsetDateTime,
    end_ts: OffsetDateTime,
    meter_id: Option<String>,
    reference: Option<String>,
}

impl TryFrom<ExternalRecordRow> for ExternalRecord {
    type Error = anyhow::Error;

    fn try_from(row: ExternalRecordRow) -> Result<Self> {
        let kind: RecordKind = row
            .kind
            .parse()
            .with_context(|| format!("external record {}", row.id))?;
        Ok(ExternalRecord {
            id: row.id,
            kind,
            start: row.start_ts,
            end: row.end_ts,
            meter_id: row.meter_id,
            reference: row.reference,
        })
    }
}

/// Grid-event and weather records overlapping `[start, end)`.
pub async fn load_external_records(
    pool: &PgPool,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<ExternalRecord>> {
    let rows = sqlx::query_as::<_, ExternalRecordRow>(
        r#"
        SELECT id, kind, start_ts, end_ts, meter_id, reference
        FROM external_records
        WHERE start_ts < $2
          AND end_ts   > $1
        ORDER BY start_ts, id
        "#,
    )
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(ExternalRecord::try_from).collect()
}

/// Market price samples for one market within `[start, end)`.
pub async fn load_market_prices(
    pool: &PgPool,
    market: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<MarketPrice>> {
    let rows = sqlx::query_as::<_, MarketPrice>(
        r#"
        SELECT market, ts, price_per_kwh
        FROM market_prices
        WHERE market = $1
          AND ts >= $2
          AND ts <  $3
        ORDER BY ts
        "#,
    )
    .bind(market)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
