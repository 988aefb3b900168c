use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{MeterReading, ReadingUnit};

#[derive(Debug, Clone, sqlx::FromRow)]
struct MeterReadingRow {
    ts: OffsetDateTime,
    meter_id: String,
    value: Decimal,
    unit: String,
    quality_flag: Option<String>,
    source_system: Option<String>,
}

impl TryFrom<MeterReadingRow> for MeterReading {
    type Error = anyhow::Error;

    fn try_from(row: MeterReadingRow) -> Result<Self> {
        let unit: ReadingUnit = row
            .unit
            .parse()
            .with_context(|| format!("meter {} at {}", row.meter_id, row.ts))?;
        Ok(MeterReading {
            ts: row.ts,
            meter_id: row.meter_id,
            value: row.value,
            unit,
            quality_flag: row.quality_flag,
            source_system: row.source_system,
        })
    }
}

/// Fetch the time-ordered readings of one meter within `[start, end)`.
pub async fn load_readings(
    pool: &PgPool,
    meter_id: &str,
    start: OffsetDateTime,
    end: OffsetDateTime,
) -> Result<Vec<MeterReading>> {
    let rows = sqlx::query_as::<_, MeterReadingRow>(
        r#"
        SELECT
            ts,
            meter_id,
            value,
            unit,
            quality_flag,
            source_system
        FROM meter_readings
        WHERE meter_id = $1
          AND ts >= $2
          AND ts <  $3
        ORDER BY ts, value
        "#,
    )
    .bind(meter_id)
    .bind(start)
    .bind(end)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(MeterReading::try_from).collect()
}
