use std::{fs::File, path::PathBuf};

use compliance_client::domain::{MeterReading, ReadingUnit};
use csv::StringRecord;
use rust_decimal::Decimal;
use time::OffsetDateTime;

use crate::pipeline::{Envelope, PipelineError, RecordStream, Source};

/// CSV file of interval readings.
///
/// Expected header columns (by name):
/// - ts (RFC3339 timestamp)
/// - meter_id
/// - value (decimal)
/// - unit (`kwh`, `kw`, `kwh_per_m2`; defaults to `kwh` when the column is absent)
/// - quality_flag (optional)
/// - source_system (optional)
pub struct MeterReadingCsvSource {
    path: PathBuf,
}

impl MeterReadingCsvSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn optional_string(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn record_to_reading(record: &StringRecord, headers: &StringRecord, origin: &str) -> Result<MeterReading, PipelineError> {
    let bad = |reason: String| PipelineError::Rejected {
        origin: origin.to_string(),
        reason,
    };
    let column = |name: &str| headers.iter().position(|h| h == name).and_then(|idx| record.get(idx));
    let get = |name: &str| column(name).ok_or_else(|| bad(format!("missing column '{name}'")));

    let ts_str = get("ts")?;
    let ts = OffsetDateTime::parse(ts_str.trim(), &time::format_description::well_known::Rfc3339)
        .map_err(|e| bad(format!("invalid ts '{ts_str}': {e}")))?;

    let meter_id = get("meter_id")?.trim().to_string();

    let value_str = get("value")?;
    let value: Decimal = value_str
        .trim()
        .parse()
        .map_err(|e| bad(format!("invalid value '{value_str}': {e}")))?;

    let unit = match column("unit").map(str::trim).filter(|u| !u.is_empty()) {
        Some(u) => u.parse::<ReadingUnit>().map_err(|e| bad(e.to_string()))?,
        None => ReadingUnit::Kwh,
    };

    Ok(MeterReading {
        ts,
        meter_id,
        value,
        unit,
        quality_flag: column("quality_flag").and_then(optional_string),
        source_system: column("source_system").and_then(optional_string),
    })
}

#[async_trait::async_trait]
impl Source<MeterReading> for MeterReadingCsvSource {
    async fn stream(&self) -> RecordStream<MeterReading> {
        // Blocking csv reader inside one task; fixture files are small.
        let path = self.path.clone();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "readings".to_string());
        let s = async_stream::stream! {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to open {}: {e}", path.display())));
                    return;
                }
            };
            let mut rdr = csv::Reader::from_reader(file);
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    yield Err(PipelineError::Source(format!("failed to read CSV headers: {e}")));
                    return;
                }
            };

            for (i, result) in rdr.records().enumerate() {
                // Line 1 is the header.
                let origin = format!("{name}:{}", i + 2);
                let item = result
                    .map_err(|e| PipelineError::Source(format!("{origin}: failed to read CSV record: {e}")))
                    .and_then(|record| record_to_reading(&record, &headers, &origin));
                if item.is_err() {
                    metrics::counter!("fixture_parse_errors_total", "source" => "meter_readings").increment(1);
                }
                yield item.map(|reading| Envelope::new(reading, origin));
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> StringRecord {
        StringRecord::from(vec!["ts", "meter_id", "value", "unit", "quality_flag"])
    }

    #[test]
    fn parses_decimal_reading() {
        let rec = StringRecord::from(vec!["2024-06-01T00:15:00Z", "plant-1", "1472.25", "kwh", ""]);
        let r = record_to_reading(&rec, &headers(), "r.csv:2").unwrap();
        assert_eq!(r.meter_id, "plant-1");
        assert_eq!(r.value, Decimal::new(147225, 2));
        assert_eq!(r.unit, ReadingUnit::Kwh);
        assert!(r.quality_flag.is_none());
    }

    #[test]
    fn rejects_unknown_unit_with_origin() {
        let rec = StringRecord::from(vec!["2024-06-01T00:15:00Z", "plant-1", "1", "mwh", ""]);
        let err = record_to_reading(&rec, &headers(), "r.csv:7").unwrap_err();
        assert!(err.to_string().starts_with("r.csv:7"));
    }
}
