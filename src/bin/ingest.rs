use std::path::PathBuf;

use anyhow::{bail, Result};

use regimefx::data::sink::write_bars_csv;
use regimefx::data::{analyze_csv, clean_bars, read_raw};

/// Clean a raw OHLCV download: drop incomplete rows, sort by date and apply
/// the adjusted-close factor.
fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 {
        bail!("usage: ingest <raw.csv> <clean.csv>");
    }
    let input = PathBuf::from(&args[0]);
    let output = PathBuf::from(&args[1]);

    let manifest = analyze_csv(&input)?;
    eprintln!(
        "data_quality rows={} bad_rows={} incomplete={} duplicates={}",
        manifest.row_count,
        manifest.bad_rows,
        manifest.incomplete_rows,
        manifest.duplicate_dates.len()
    );
    for w in &manifest.warnings {
        eprintln!("data_warning: {}", w);
    }

    let raw = read_raw(&input)?;
    let total = raw.len();
    let bars = clean_bars(raw);
    write_bars_csv(&output, &bars)?;
    println!("kept {} of {} rows -> {}", bars.len(), total, output.display());
    Ok(())
}
