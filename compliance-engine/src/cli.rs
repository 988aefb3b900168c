//! Bits shared by the binaries.

use std::sync::Arc;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    config::AppConfig,
    engine::ComplianceEngine,
    formulas::FormulaRegistry,
    store::{EvaluationStore, PgEvaluationStore},
};

pub fn parse_rfc3339(name: &str, raw: &str) -> anyhow::Result<OffsetDateTime> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339).map_err(|e| anyhow::anyhow!("invalid {name} '{raw}': {e}"))
}

pub fn engine_with_store(cfg: &AppConfig, store: Arc<dyn EvaluationStore>) -> ComplianceEngine {
    ComplianceEngine::new(
        store,
        Arc::new(FormulaRegistry::with_builtin()),
        Arc::new(cfg.engine_settings()),
    )
}

/// Engine over the Postgres store named in `[database]`.
pub async fn postgres_engine(cfg: &AppConfig) -> anyhow::Result<ComplianceEngine> {
    let store = PgEvaluationStore::connect(cfg.database()?).await?;
    Ok(engine_with_store(cfg, Arc::new(store)))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn parses_rfc3339_with_offset() {
        let ts = parse_rfc3339("start", "2024-06-01T02:00:00+02:00").unwrap();
        assert_eq!(ts, datetime!(2024-06-01 00:00:00 UTC));
        assert!(parse_rfc3339("start", "yesterday").is_err());
    }
}
