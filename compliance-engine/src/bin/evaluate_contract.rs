use std::{env, path::PathBuf, sync::Arc};

use anyhow::{bail, Result};
use compliance_engine::{cli, config::AppConfig, fixtures, observability, store::MemoryStore};

/// usage: evaluate_contract [--fixtures <dir>] <contract_id> <period_start> <period_end>
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let mut args: Vec<String> = env::args().skip(1).collect();
    let fixtures_dir = match args.iter().position(|a| a == "--fixtures") {
        Some(idx) if idx + 1 < args.len() => {
            let dir = PathBuf::from(args.remove(idx + 1));
            args.remove(idx);
            Some(dir)
        }
        Some(_) => bail!("--fixtures needs a directory"),
        None => None,
    };
    if args.len() != 3 {
        bail!("usage: evaluate_contract [--fixtures <dir>] <contract_id> <period_start_rfc3339> <period_end_rfc3339>");
    }
    let period_start = cli::parse_rfc3339("period start", &args[1])?;
    let period_end = cli::parse_rfc3339("period end", &args[2])?;

    let cfg = AppConfig::load()?;
    let engine = match fixtures_dir {
        Some(dir) => {
            let store = Arc::new(MemoryStore::new());
            fixtures::load_dir(&dir, Arc::clone(&store)).await?;
            cli::engine_with_store(&cfg, store)
        }
        None => cli::postgres_engine(&cfg).await?,
    };

    let outcome = engine.evaluate(&args[0], period_start, period_end).await?;
    cli::print_json(&outcome)
}
