//! OHLCV input: CSV parsing, cleaning, quality checks and the signal join.
//!
//! This is the time-series source the core stages read from. Everything here
//! is file plumbing except [`validate_bars`], which enforces the ordering and
//! price invariants the core relies on.

pub mod sink;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::PipelineError;
use crate::signals::{Action, Signal};

pub const EXPECTED_COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

/// One daily OHLCV observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// A parsed CSV row before cleaning. Empty fields stay `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
    pub adj_close: Option<f64>,
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    let s = s.trim();
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.date())
        .map_err(|e| anyhow!("bad date {:?}: {}", s, e))
}

fn parse_field(raw: Option<&&str>, name: &str) -> Result<Option<f64>> {
    match raw.map(|s| s.trim()) {
        None | Some("") => Ok(None),
        Some(v) if v.eq_ignore_ascii_case("nan") => Ok(None),
        Some(v) => v
            .parse::<f64>()
            .map(Some)
            .map_err(|e| anyhow!("bad {} {:?}: {}", name, v, e)),
    }
}

/// Parse `date,open,high,low,close,volume[,adj_close]`.
pub fn parse_csv_line(line: &str) -> Result<RawBar> {
    let parts: Vec<&str> = line.split(',').collect();
    if parts.len() < 6 {
        bail!("expected 6+ columns, got {}", parts.len());
    }
    Ok(RawBar {
        date: parse_date(parts[0])?,
        open: parse_field(parts.get(1), "open")?,
        high: parse_field(parts.get(2), "high")?,
        low: parse_field(parts.get(3), "low")?,
        close: parse_field(parts.get(4), "close")?,
        volume: parse_field(parts.get(5), "volume")?,
        adj_close: parse_field(parts.get(6), "adj_close")?,
    })
}

fn is_header(line: &str) -> bool {
    line.to_lowercase().starts_with("date,")
}

/// Read raw rows from a CSV file, skipping the header, comments and blank
/// lines. Unparseable rows are an error: silently dropping them would shift
/// every downstream date.
pub fn read_raw(path: &Path) -> Result<Vec<RawBar>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut rows = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || is_header(trimmed) {
            continue;
        }
        let row = parse_csv_line(trimmed)
            .with_context(|| format!("{}:{}", path.display(), lineno + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Drop incomplete rows, sort by date and apply split/dividend adjustment
/// when an `adj_close` column is present.
pub fn clean_bars(raw: Vec<RawBar>) -> Vec<Bar> {
    let mut bars: Vec<Bar> = raw
        .into_iter()
        .filter_map(|r| {
            let (open, high, low, close, volume) = (r.open?, r.high?, r.low?, r.close?, r.volume?);
            let factor = match r.adj_close {
                Some(adj) if close != 0.0 => adj / close,
                _ => 1.0,
            };
            Some(Bar {
                date: r.date,
                open: open * factor,
                high: high * factor,
                low: low * factor,
                close: close * factor,
                volume,
            })
        })
        .collect();
    bars.sort_by_key(|b| b.date);
    bars
}

/// Load and clean a bar file in one step.
pub fn load_bars(path: &Path) -> Result<Vec<Bar>> {
    Ok(clean_bars(read_raw(path)?))
}

/// Enforce the invariants every core stage assumes: at least one bar, dates
/// strictly increasing, closes positive and finite.
pub fn validate_bars(bars: &[Bar]) -> Result<(), PipelineError> {
    if bars.is_empty() {
        return Err(PipelineError::data("no bars supplied"));
    }
    for (i, bar) in bars.iter().enumerate() {
        if !(bar.close.is_finite() && bar.close > 0.0) {
            return Err(PipelineError::data(format!(
                "non-positive close {} on {}",
                bar.close, bar.date
            )));
        }
        if i > 0 && bar.date <= bars[i - 1].date {
            return Err(PipelineError::data(format!(
                "dates not strictly increasing: {} follows {}",
                bar.date,
                bars[i - 1].date
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Signals input and join
// =============================================================================

/// Read a signal file, locating the `date` and `signal` columns by name.
pub fn load_signals(path: &Path) -> Result<Vec<Signal>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let header = loop {
        match lines.next() {
            Some(line) => {
                let line = line?;
                let t = line.trim();
                if t.is_empty() || t.starts_with('#') {
                    continue;
                }
                break t.split(',').map(|s| s.trim().to_lowercase()).collect::<Vec<_>>();
            }
            None => bail!("{} is empty", path.display()),
        }
    };
    let date_idx = header
        .iter()
        .position(|c| c == "date")
        .ok_or_else(|| anyhow!("{} has no date column", path.display()))?;
    let signal_idx = header
        .iter()
        .position(|c| c == "signal")
        .ok_or_else(|| anyhow!("{} has no signal column", path.display()))?;

    let mut out = Vec::new();
    for line in lines {
        let line = line?;
        let t = line.trim();
        if t.is_empty() || t.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = t.split(',').collect();
        let date = parts
            .get(date_idx)
            .ok_or_else(|| anyhow!("missing date in {:?}", t))
            .and_then(|s| parse_date(s))?;
        let action: Action = parts
            .get(signal_idx)
            .ok_or_else(|| anyhow!("missing signal in {:?}", t))?
            .parse()?;
        out.push(Signal { date, action });
    }
    Ok(out)
}

/// Inner join on date: bars without a signal and signals without a bar are
/// dropped. Output follows bar order. A signal date listed twice is an error.
pub fn join_signals(bars: &[Bar], signals: &[Signal]) -> Result<(Vec<Bar>, Vec<Signal>)> {
    let mut by_date: HashMap<NaiveDate, Action> = HashMap::with_capacity(signals.len());
    for s in signals {
        if by_date.insert(s.date, s.action).is_some() {
            bail!("duplicate signal date {}", s.date);
        }
    }
    Ok(bars
        .iter()
        .filter_map(|b| by_date.get(&b.date).map(|a| (*b, Signal { date: b.date, action: *a })))
        .unzip())
}

// =============================================================================
// Data quality
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub path: String,
    pub hash_sha256: String,
    pub row_count: u64,
    pub bad_rows: u64,
    pub incomplete_rows: u64,
    pub date_min: Option<NaiveDate>,
    pub date_max: Option<NaiveDate>,
    pub columns: Vec<String>,
    pub duplicate_dates: Vec<NaiveDate>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaReport {
    pub columns: Vec<String>,
    pub expected: Vec<String>,
    pub ok: bool,
    pub message: String,
}

/// Scan a bar file without failing on bad rows and summarize what cleaning
/// and validation would run into.
pub fn analyze_csv(path: &Path) -> Result<DatasetManifest> {
    let hash = file_sha256(path)?;
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;

    let mut warnings = Vec::new();
    let mut header: Vec<String> = Vec::new();
    let mut row_count = 0u64;
    let mut bad_rows = 0u64;
    let mut incomplete_rows = 0u64;
    let mut seen: HashMap<NaiveDate, u32> = HashMap::new();
    let mut prev: Option<NaiveDate> = None;

    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if is_header(trimmed) && header.is_empty() {
            header = trimmed.split(',').map(|s| s.trim().to_string()).collect();
            continue;
        }
        match parse_csv_line(trimmed) {
            Ok(row) => {
                row_count += 1;
                if [row.open, row.high, row.low, row.close, row.volume].iter().any(Option::is_none) {
                    incomplete_rows += 1;
                }
                if let Some(p) = prev {
                    if row.date < p {
                        warnings.push(format!("out_of_order: {} after {}", row.date, p));
                    }
                }
                prev = Some(row.date);
                *seen.entry(row.date).or_insert(0) += 1;
            }
            Err(err) => {
                bad_rows += 1;
                warnings.push(format!("bad_row: {}", err));
            }
        }
    }

    if header.is_empty() {
        warnings.push("missing_header".to_string());
    }
    let mut duplicate_dates: Vec<NaiveDate> =
        seen.iter().filter(|(_, n)| **n > 1).map(|(d, _)| *d).collect();
    duplicate_dates.sort();

    Ok(DatasetManifest {
        path: path.display().to_string(),
        hash_sha256: hash,
        row_count,
        bad_rows,
        incomplete_rows,
        date_min: seen.keys().min().copied(),
        date_max: seen.keys().max().copied(),
        columns: header,
        duplicate_dates,
        warnings,
    })
}

/// The header must start with the OHLCV columns; extra trailing columns such
/// as `adj_close` are allowed.
pub fn validate_schema(path: &Path) -> Result<SchemaReport> {
    let header = read_header(path)?;
    let expected: Vec<String> = EXPECTED_COLUMNS.iter().map(|s| s.to_string()).collect();
    let ok = header.len() >= expected.len()
        && header
            .iter()
            .zip(&expected)
            .all(|(got, want)| got.eq_ignore_ascii_case(want));
    let message = if ok {
        "schema ok".to_string()
    } else {
        format!("schema mismatch: got {:?} expected {:?}", header, expected)
    };
    Ok(SchemaReport { columns: header, expected, ok, message })
}

pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if is_header(trimmed) {
            return Ok(trimmed.split(',').map(|s| s.trim().to_string()).collect());
        }
        break;
    }
    Ok(Vec::new())
}

pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    fn bar(date: &str, close: f64) -> Bar {
        Bar { date: d(date), open: close, high: close, low: close, close, volume: 1000.0 }
    }

    #[test]
    fn test_parse_csv_line_valid() {
        let row = parse_csv_line("2024-01-02,100,101,99,100.5,12000").unwrap();
        assert_eq!(row.date, d("2024-01-02"));
        assert_eq!(row.close, Some(100.5));
        assert_eq!(row.adj_close, None);
    }

    #[test]
    fn test_parse_csv_line_missing_field_is_none() {
        let row = parse_csv_line("2024-01-02,100,,99,100.5,12000").unwrap();
        assert_eq!(row.high, None);
    }

    #[test]
    fn test_parse_csv_line_datetime_date() {
        let row = parse_csv_line("2024-01-02 00:00:00,1,1,1,1,1").unwrap();
        assert_eq!(row.date, d("2024-01-02"));
    }

    #[test]
    fn test_parse_csv_line_too_few_columns() {
        assert!(parse_csv_line("2024-01-02,100,101").is_err());
    }

    #[test]
    fn test_clean_drops_incomplete_and_sorts() {
        let raw = vec![
            parse_csv_line("2024-01-03,1,1,1,3,1").unwrap(),
            parse_csv_line("2024-01-01,1,1,1,,1").unwrap(),
            parse_csv_line("2024-01-02,1,1,1,2,1").unwrap(),
        ];
        let bars = clean_bars(raw);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, d("2024-01-02"));
        assert_eq!(bars[1].close, 3.0);
    }

    #[test]
    fn test_clean_applies_adjustment_factor() {
        let raw = vec![parse_csv_line("2024-01-02,100,110,90,100,5,50").unwrap()];
        let bars = clean_bars(raw);
        assert_eq!(bars[0].open, 50.0);
        assert_eq!(bars[0].high, 55.0);
        assert_eq!(bars[0].low, 45.0);
        assert_eq!(bars[0].close, 50.0);
        assert_eq!(bars[0].volume, 5.0);
    }

    #[test]
    fn test_validate_rejects_duplicate_dates() {
        let bars = vec![bar("2024-01-02", 1.0), bar("2024-01-02", 2.0)];
        assert!(validate_bars(&bars).is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_close() {
        let bars = vec![bar("2024-01-02", 1.0), bar("2024-01-03", 0.0)];
        assert!(validate_bars(&bars).is_err());
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(validate_bars(&[]).is_err());
    }

    #[test]
    fn test_join_is_inner() {
        let bars = vec![bar("2024-01-01", 1.0), bar("2024-01-02", 2.0), bar("2024-01-03", 3.0)];
        let signals = vec![
            Signal { date: d("2024-01-03"), action: Action::Sell },
            Signal { date: d("2024-01-01"), action: Action::Buy },
            Signal { date: d("2024-01-09"), action: Action::Hold },
        ];
        let (b, s) = join_signals(&bars, &signals).unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b[0].date, d("2024-01-01"));
        assert_eq!(s[0].action, Action::Buy);
        assert_eq!(s[1].action, Action::Sell);
        assert_eq!(s[1].date, b[1].date);
    }

    #[test]
    fn test_join_rejects_duplicate_signal_dates() {
        let bars = vec![bar("2024-01-01", 1.0), bar("2024-01-02", 2.0)];
        let signals = vec![
            Signal { date: d("2024-01-01"), action: Action::Buy },
            Signal { date: d("2024-01-02"), action: Action::Hold },
            Signal { date: d("2024-01-01"), action: Action::Sell },
        ];
        let err = join_signals(&bars, &signals).unwrap_err();
        assert!(err.to_string().contains("2024-01-01"), "{}", err);
    }
}
