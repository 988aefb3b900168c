use std::path::PathBuf;

use compliance_client::domain::ExternalRecord;
use futures::StreamExt;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tokio_stream::wrappers::LinesStream;

use crate::pipeline::{Envelope, PipelineError, RecordStream, Source};

/// NDJSON file of grid-event and weather records, one `ExternalRecord` per
/// line with RFC3339 `start`/`end`. Blank lines are skipped.
pub struct ExternalRecordNdjsonSource {
    path: PathBuf,
}

impl ExternalRecordNdjsonSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

fn parse_line(line: &str, origin: &str) -> Result<ExternalRecord, PipelineError> {
    serde_json::from_str(line).map_err(|e| PipelineError::Rejected {
        origin: origin.to_string(),
        reason: format!("invalid external record: {e}"),
    })
}

#[async_trait::async_trait]
impl Source<ExternalRecord> for ExternalRecordNdjsonSource {
    async fn stream(&self) -> RecordStream<ExternalRecord> {
        let path = self.path.clone();
        let file = match File::open(&path).await {
            Ok(f) => f,
            Err(e) => {
                let err = PipelineError::Source(format!("failed to open {}: {e}", path.display()));
                return Box::pin(futures::stream::once(async move { Err(err) }));
            }
        };
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        let s = LinesStream::new(BufReader::new(file).lines())
            .enumerate()
            .filter_map(move |(idx, line)| {
                let item = match line {
                    Err(e) => Some(Err(PipelineError::Source(format!("failed to read {}: {e}", path.display())))),
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => {
                        let origin = format!("{name}:{}", idx + 1);
                        let parsed = parse_line(&line, &origin);
                        if parsed.is_err() {
                            metrics::counter!("fixture_parse_errors_total", "source" => "external_records").increment(1);
                        }
                        Some(parsed.map(|record| Envelope::new(record, origin)))
                    }
                };
                futures::future::ready(item)
            });

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compliance_client::domain::RecordKind;

    #[test]
    fn parses_site_wide_record() {
        let line = r#"{"id":"GO-17","kind":"grid_outage","start":"2024-06-10T00:00:00Z","end":"2024-06-10T06:00:00Z","meter_id":null,"reference":"ISO ticket 4411"}"#;
        let r = parse_line(line, "records.ndjson:1").unwrap();
        assert_eq!(r.kind, RecordKind::GridOutage);
        assert!(r.meter_id.is_none());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let line = r#"{"id":"X","kind":"alien_invasion","start":"2024-06-10T00:00:00Z","end":"2024-06-10T06:00:00Z"}"#;
        assert!(matches!(parse_line(line, "f:3"), Err(PipelineError::Rejected { .. })));
    }
}
