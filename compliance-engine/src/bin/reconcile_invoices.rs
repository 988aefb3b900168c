use std::env;

use anyhow::{bail, Result};
use compliance_engine::{cli, config::AppConfig, observability};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: reconcile_invoices <expected_invoice_id> <received_invoice_id>");
    }

    let cfg = AppConfig::load()?;
    let engine = cli::postgres_engine(&cfg).await?;
    let comparison = engine.reconcile_invoices(&args[1], &args[2]).await?;
    cli::print_json(&comparison)
}
