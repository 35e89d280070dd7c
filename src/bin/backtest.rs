use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde_json::json;

use regimefx::config::Config;
use regimefx::data::{join_signals, load_bars, load_signals};
use regimefx::logging::{obj, Domain, Level, LogConfig, Logger};
use regimefx::metrics::PerformanceEvaluator;

/// Score a previously generated signal file against prices.
fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        bail!("usage: backtest <ohlcv.csv> <signals.csv>");
    }
    let prices = PathBuf::from(&args[0]);
    let signal_path = PathBuf::from(&args[1]);

    let cfg = Config::from_env()?;
    let log = Logger::open(&LogConfig { dir: None, ..LogConfig::from_env()? })
        .context("cannot open log")?;

    let bars = load_bars(&prices)?;
    let signals = load_signals(&signal_path)?;
    let (bars, signals) = join_signals(&bars, &signals)
        .with_context(|| format!("cannot join {}", signal_path.display()))?;
    log.log(
        Level::Info,
        Domain::Data,
        "signals_joined",
        obj(&[("rows", json!(bars.len()))]),
    );
    if bars.is_empty() {
        bail!("no dates in common between {} and {}", prices.display(), signal_path.display());
    }

    let report = PerformanceEvaluator::new(cfg.annualization)
        .evaluate(&bars, &signals, &log)
        .context("evaluation failed")?;
    let m = &report.metrics;
    println!("bars={} cumulative_return={:.4} buy_hold={:.4} max_drawdown={:.4}", m.bars, m.cumulative_return, m.buy_hold_return, m.max_drawdown);
    match m.sharpe_ratio {
        Some(s) => println!("sharpe_ratio={:.4}", s),
        None => println!("sharpe_ratio=undefined"),
    }
    Ok(())
}
