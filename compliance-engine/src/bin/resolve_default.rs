use std::env;

use anyhow::{bail, Result};
use compliance_engine::{cli, config::AppConfig, observability};

const USAGE: &str = "usage: resolve_default cure <default_event_id> <cure_ts_rfc3339>\n       resolve_default waive <default_event_id> <justification...>";

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 4 {
        bail!(USAGE);
    }

    let cfg = AppConfig::load()?;
    let engine = cli::postgres_engine(&cfg).await?;

    let event = match args[1].as_str() {
        "cure" => {
            let ts = cli::parse_rfc3339("cure timestamp", &args[3])?;
            engine.cure_default(&args[2], ts).await?
        }
        "waive" => engine.waive_default(&args[2], &args[3..].join(" ")).await?,
        other => bail!("unknown action '{other}'\n{USAGE}"),
    };
    cli::print_json(&event)
}
