//! CSV writers for pipeline output.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::data::Bar;
use crate::pipeline::PipelineOutput;
use crate::signals::Signal;

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Input columns plus every derived column, one line per bar.
pub fn write_augmented_csv(path: &Path, out: &PipelineOutput) -> Result<()> {
    let mut w = create(path)?;
    let sma_windows: Vec<usize> = out.features.first().map(|r| r.sma.keys().copied().collect()).unwrap_or_default();
    let vol_windows: Vec<usize> =
        out.features.first().map(|r| r.volatility.keys().copied().collect()).unwrap_or_default();

    let mut header: Vec<String> = ["date", "open", "high", "low", "close", "volume"].iter().map(|s| s.to_string()).collect();
    header.extend(sma_windows.iter().map(|w| format!("sma_{}", w)));
    header.push("daily_return".to_string());
    header.extend(vol_windows.iter().map(|w| format!("volatility_{}", w)));
    for col in ["hmm_state", "regime_label", "state_prob", "signal", "strategy_return", "cumulative_return"] {
        header.push(col.to_string());
    }
    writeln!(w, "{}", header.join(","))?;

    for row in out.rows() {
        let f = row.features;
        let b = &f.bar;
        let mut fields = vec![
            b.date.format("%Y-%m-%d").to_string(),
            b.open.to_string(),
            b.high.to_string(),
            b.low.to_string(),
            b.close.to_string(),
            b.volume.to_string(),
        ];
        fields.extend(sma_windows.iter().map(|w| f.sma(*w).map(|v| v.to_string()).unwrap_or_default()));
        fields.push(f.daily_return.to_string());
        fields.extend(vol_windows.iter().map(|w| f.volatility(*w).map(|v| v.to_string()).unwrap_or_default()));
        fields.push(row.regime.hmm_state.to_string());
        fields.push(row.regime.regime_label.to_string());
        fields.push(row.state_prob.to_string());
        fields.push(row.signal.action.to_string());
        fields.push(row.strategy_return.to_string());
        fields.push(row.cumulative_return.to_string());
        writeln!(w, "{}", fields.join(","))?;
    }
    w.flush()?;
    Ok(())
}

pub fn write_signals_csv(path: &Path, signals: &[Signal]) -> Result<()> {
    let mut w = create(path)?;
    writeln!(w, "date,signal")?;
    for s in signals {
        writeln!(w, "{},{}", s.date.format("%Y-%m-%d"), s.action)?;
    }
    w.flush()?;
    Ok(())
}

/// Cleaned OHLCV in the input layout.
pub fn write_bars_csv(path: &Path, bars: &[Bar]) -> Result<()> {
    let mut w = create(path)?;
    writeln!(w, "date,open,high,low,close,volume")?;
    for b in bars {
        writeln!(
            w,
            "{},{},{},{},{},{}",
            b.date.format("%Y-%m-%d"),
            b.open,
            b.high,
            b.low,
            b.close,
            b.volume
        )?;
    }
    w.flush()?;
    Ok(())
}
