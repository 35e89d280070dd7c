use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::json;

use regimefx::config::Config;
use regimefx::data::sink::{write_augmented_csv, write_signals_csv};
use regimefx::data::{analyze_csv, load_bars, validate_schema};
use regimefx::logging::{obj, v_num, v_str, Domain, Level, LogConfig, Logger};
use regimefx::pipeline::Pipeline;
use regimefx::storage::RunStore;

fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let input = match args.next() {
        Some(p) => PathBuf::from(p),
        None => bail!("usage: regimefx <ohlcv.csv> [out_dir]"),
    };
    let out_dir = PathBuf::from(args.next().unwrap_or_else(|| "out".to_string()));

    let cfg = Config::from_env()?;
    let log = Logger::open(&LogConfig::from_env()?).context("cannot open run log")?;

    let schema = validate_schema(&input)?;
    if !schema.ok {
        bail!("{}: {}", input.display(), schema.message);
    }
    let manifest = analyze_csv(&input)?;
    log.log(
        Level::Info,
        Domain::Data,
        "dataset_manifest",
        obj(&[
            ("path", v_str(&manifest.path)),
            ("sha256", v_str(&manifest.hash_sha256)),
            ("rows", json!(manifest.row_count)),
            ("bad_rows", json!(manifest.bad_rows)),
            ("incomplete_rows", json!(manifest.incomplete_rows)),
            ("duplicate_dates", json!(manifest.duplicate_dates.len())),
        ]),
    );
    for w in &manifest.warnings {
        log.log(Level::Warn, Domain::Data, "data_warning", obj(&[("msg", v_str(w))]));
    }

    let bars = load_bars(&input)?;
    let pipeline = Pipeline::new(cfg.clone(), &log);
    let out = pipeline.run(&bars).with_context(|| format!("pipeline failed on {}", input.display()))?;

    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("run");
    let augmented = out_dir.join(format!("{}_augmented.csv", stem));
    let signals = out_dir.join(format!("{}_signals.csv", stem));
    write_augmented_csv(&augmented, &out)?;
    write_signals_csv(&signals, &out.signals)?;
    log_output(&log, &augmented);
    log_output(&log, &signals);

    if let Some(db) = &cfg.sqlite_path {
        let mut store = RunStore::open(db).with_context(|| format!("cannot open {}", db))?;
        store.persist_run(log.run_id(), &pipeline.params_hash(), Some(&manifest.hash_sha256), &out)?;
        log.log(Level::Info, Domain::Storage, "run_persisted", obj(&[("db", v_str(db))]));
    }

    let m = &out.performance.metrics;
    println!("bars                 {}", m.bars);
    println!("hmm converged        {} ({} iterations)", out.regime.report.converged, out.regime.report.iterations);
    for s in &out.regime.states {
        println!(
            "state {}  {:<8} mean_ret={:+.5} mean_vol={:.5} occupancy={:.1}%",
            s.state,
            s.label.as_str(),
            s.mean_return,
            s.mean_volatility,
            s.occupancy * 100.0
        );
    }
    println!("cumulative return    {:.4}", m.cumulative_return);
    println!("buy & hold           {:.4}", m.buy_hold_return);
    match m.sharpe_ratio {
        Some(s) => println!("sharpe ratio         {:.4}", s),
        None => println!("sharpe ratio         undefined (zero-variance returns)"),
    }
    println!("max drawdown         {:.4}", m.max_drawdown);
    log.log(
        Level::Info,
        Domain::System,
        "run_complete",
        obj(&[("out_dir", v_str(&out_dir.display().to_string())), ("final", v_num(m.cumulative_return))]),
    );
    Ok(())
}

fn log_output(log: &Logger, path: &Path) {
    log.log(
        Level::Info,
        Domain::Storage,
        "output_written",
        obj(&[("path", v_str(&path.display().to_string()))]),
    );
}
