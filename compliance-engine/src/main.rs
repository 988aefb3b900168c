use std::{env, sync::Arc};

use anyhow::{bail, Context, Result};
use compliance_engine::{
    batch::{BatchJob, BatchRunner},
    cli,
    config::AppConfig,
    metrics_server,
    observability,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Evaluates every contract in `[batch].contracts` for one billing period.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: compliance-engine <period_start_rfc3339> <period_end_rfc3339>");
    }
    let period_start = cli::parse_rfc3339("period start", &args[1])?;
    let period_end = cli::parse_rfc3339("period end", &args[2])?;

    let cfg = AppConfig::load()?;
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }
    if cfg.batch.contracts.is_empty() {
        bail!("no contracts configured under [batch].contracts");
    }

    let engine = Arc::new(cli::postgres_engine(&cfg).await?);
    engine
        .validate_contracts(&cfg.batch.contracts)
        .await
        .context("contract configuration failed startup validation")?;
    let runner = BatchRunner::new(engine, cfg.batch.workers);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight evaluations");
            on_signal.cancel();
        }
    });

    let jobs = cfg
        .batch
        .contracts
        .iter()
        .map(|contract_id| BatchJob {
            contract_id: contract_id.clone(),
            period_start,
            period_end,
        })
        .collect();
    let reports = runner.run(jobs, cancel).await;

    let summary: Vec<_> = reports
        .iter()
        .map(|r| match &r.result {
            Ok(outcome) => json!({
                "contract_id": r.job.contract_id,
                "status": "ok",
                "breaches": outcome.rule_results.iter().filter(|res| res.breach).count(),
                "defaults_created": outcome.default_events_created.len(),
                "notes": outcome.processing_notes,
                "expected_invoice_id": outcome.expected_invoice.as_ref().map(|i| i.id.clone()),
            }),
            Err(e) => json!({
                "contract_id": r.job.contract_id,
                "status": e.category().as_str(),
                "error": e.to_string(),
            }),
        })
        .collect();
    cli::print_json(&summary)?;

    if reports.iter().any(|r| r.result.is_err()) {
        std::process::exit(1);
    }
    Ok(())
}
