//! Structured JSON-lines logging for pipeline runs.
//!
//! A [`Logger`] is created by the caller and handed to every stage; nothing
//! here is process-global. Each record carries ts, run_id, seq, lvl,
//! component, event, msg and a `data` object.
//!
//! Sinks:
//! - run directory: `<LOG_DIR>/<run_id>/{events,trace,metrics}.jsonl` plus
//!   `manifest.json`
//! - stderr only
//! - in-memory buffer (tests)
//! - null

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fs::{create_dir_all, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::PipelineError;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

impl FromStr for Level {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Ok(Level::Trace),
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(PipelineError::data(format!("unknown log level {:?}", other))),
        }
    }
}

// =============================================================================
// Log Domains
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Data,        // Loading, cleaning, validation
    Feature,     // Rolling features
    Regime,      // HMM fit and decoding
    Signal,      // Rule evaluation
    Performance, // Strategy returns and metrics
    Storage,     // Sinks
    System,      // Startup, shutdown, stage failures
    Profile,     // Stage timings
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Data => "data",
            Domain::Feature => "feature",
            Domain::Regime => "regime",
            Domain::Signal => "signal",
            Domain::Performance => "performance",
            Domain::Storage => "storage",
            Domain::System => "system",
            Domain::Profile => "profile",
        }
    }
}

impl FromStr for Domain {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "data" => Ok(Domain::Data),
            "feature" => Ok(Domain::Feature),
            "regime" => Ok(Domain::Regime),
            "signal" => Ok(Domain::Signal),
            "performance" => Ok(Domain::Performance),
            "storage" => Ok(Domain::Storage),
            "system" => Ok(Domain::System),
            "profile" => Ok(Domain::Profile),
            other => Err(PipelineError::data(format!("unknown log domain {:?}", other))),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// `None` enables every domain
    pub domains: Option<Vec<Domain>>,
    /// Base directory for run logs; `None` logs to stderr only
    pub dir: Option<PathBuf>,
    pub run_id: Option<String>,
    /// Also write every record to stderr when logging to a run directory
    pub echo: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: Level::Info, domains: None, dir: None, run_id: None, echo: false }
    }
}

impl LogConfig {
    /// Read `LOG_LEVEL`, `LOG_DOMAINS`, `LOG_DIR`, `RUN_ID` and `LOG_ECHO`.
    /// An unknown level or domain name is rejected.
    pub fn from_env() -> Result<Self, PipelineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PipelineError> {
        let domains = match lookup("LOG_DOMAINS").as_deref().map(str::trim) {
            None | Some("all") | Some("") => None,
            Some(list) => Some(
                list.split(',')
                    .map(|d| d.parse::<Domain>())
                    .collect::<Result<Vec<_>, _>>()?,
            ),
        };
        let level = match lookup("LOG_LEVEL") {
            Some(v) => v.parse::<Level>()?,
            None => Level::Info,
        };
        Ok(Self {
            level,
            domains,
            dir: Some(PathBuf::from(lookup("LOG_DIR").unwrap_or_else(|| "out/runs".to_string()))),
            run_id: lookup("RUN_ID"),
            echo: lookup("LOG_ECHO").map(|v| matches!(v.as_str(), "1" | "true" | "yes")).unwrap_or(false),
        })
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Shared handle to the lines captured by [`Logger::memory`].
#[derive(Debug, Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<String>>>);

impl LogBuffer {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Parsed records whose `event` field equals `event`.
    pub fn events(&self, event: &str) -> Vec<Value> {
        self.lines()
            .iter()
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .filter(|v| v.get("event").and_then(Value::as_str) == Some(event))
            .collect()
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.0.lock() {
            lines.push(line);
        }
    }
}

#[derive(Debug)]
enum Sink {
    Null,
    Stderr,
    Memory(LogBuffer),
    RunDir {
        events: Mutex<BufWriter<File>>,
        trace: Mutex<BufWriter<File>>,
        metrics: Mutex<BufWriter<File>>,
    },
}

fn write_line(writer: &Mutex<BufWriter<File>>, line: &str) {
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
    }
}

// =============================================================================
// Logger
// =============================================================================

#[derive(Debug)]
pub struct Logger {
    run_id: String,
    min_level: Level,
    domains: Option<Vec<Domain>>,
    sink: Sink,
    echo: bool,
    seq: AtomicU64,
}

impl Logger {
    /// Open a logger per `cfg`. With a directory configured this creates
    /// the run directory and writes its manifest.
    pub fn open(cfg: &LogConfig) -> io::Result<Self> {
        let run_id = cfg
            .run_id
            .clone()
            .unwrap_or_else(|| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let sink = match &cfg.dir {
            None => Sink::Stderr,
            Some(base) => {
                let run_dir = base.join(&run_id);
                create_dir_all(&run_dir)?;
                std::fs::write(
                    run_dir.join("manifest.json"),
                    json!({
                        "run_id": run_id,
                        "ts": ts_now(),
                        "pid": process::id(),
                        "log_dir": run_dir.to_string_lossy(),
                    })
                    .to_string(),
                )?;
                Sink::RunDir {
                    events: Mutex::new(BufWriter::new(File::create(run_dir.join("events.jsonl"))?)),
                    trace: Mutex::new(BufWriter::new(File::create(run_dir.join("trace.jsonl"))?)),
                    metrics: Mutex::new(BufWriter::new(File::create(run_dir.join("metrics.jsonl"))?)),
                }
            }
        };
        Ok(Self {
            run_id,
            min_level: cfg.level,
            domains: cfg.domains.clone(),
            sink,
            echo: cfg.echo,
            seq: AtomicU64::new(0),
        })
    }

    fn with_sink(sink: Sink, level: Level) -> Self {
        Self {
            run_id: format!("r-{}-{}", ts_epoch_ms(), process::id()),
            min_level: level,
            domains: None,
            sink,
            echo: false,
            seq: AtomicU64::new(0),
        }
    }

    pub fn stderr(level: Level) -> Self {
        Self::with_sink(Sink::Stderr, level)
    }

    /// Discards everything.
    pub fn null() -> Self {
        Self::with_sink(Sink::Null, Level::Fatal)
    }

    pub fn memory(level: Level) -> (Self, LogBuffer) {
        let buf = LogBuffer::default();
        (Self::with_sink(Sink::Memory(buf.clone()), level), buf)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn enabled(&self, level: Level, domain: Domain) -> bool {
        if matches!(self.sink, Sink::Null) || level < self.min_level {
            return false;
        }
        match &self.domains {
            None => true,
            Some(list) => list.contains(&domain),
        }
    }

    /// Emit a structured log entry
    pub fn log(&self, level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
        if !self.enabled(level, domain) {
            return;
        }
        self.emit(level, domain.as_str(), event, fields);
    }

    fn emit(&self, level: Level, component: &str, event: &str, mut fields: Map<String, Value>) {
        let msg = fields.remove("msg").unwrap_or(Value::String(String::new()));
        let stage = fields.remove("stage");

        let mut entry = Map::new();
        entry.insert("ts".to_string(), json!(ts_now()));
        entry.insert("run_id".to_string(), json!(self.run_id));
        entry.insert("seq".to_string(), json!(self.seq.fetch_add(1, Ordering::SeqCst)));
        entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
        entry.insert("component".to_string(), json!(component));
        entry.insert("event".to_string(), json!(event));
        entry.insert("msg".to_string(), msg);
        if let Some(stage) = stage {
            entry.insert("stage".to_string(), stage);
        }
        entry.insert("data".to_string(), Value::Object(fields));
        let line = Value::Object(entry).to_string();

        match &self.sink {
            Sink::Null => {}
            Sink::Stderr => eprintln!("{}", line),
            Sink::Memory(buf) => buf.push(line),
            Sink::RunDir { events, trace, metrics } => {
                if event.starts_with("metrics.") {
                    write_line(metrics, &line);
                }
                match level {
                    Level::Trace | Level::Debug => write_line(trace, &line),
                    _ => write_line(events, &line),
                }
                if self.echo {
                    eprintln!("{}", line);
                }
            }
        }
    }

    pub fn flush(&self) {
        if let Sink::RunDir { events, trace, metrics } = &self.sink {
            for w in [events, trace, metrics] {
                if let Ok(mut w) = w.lock() {
                    let _ = w.flush();
                }
            }
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}

// =============================================================================
// Domain-Specific Logging Helpers
// =============================================================================

pub fn log_stage_failure(log: &Logger, err: &PipelineError) {
    log.log(
        Level::Error,
        Domain::System,
        "stage_failed",
        obj(&[
            ("stage", err.stage().map(|s| v_str(s.as_str())).unwrap_or(Value::Null)),
            ("kind", v_str(&format!("{:?}", err.kind()))),
            ("msg", v_str(&err.to_string())),
        ]),
    );
}

pub fn log_fit_iteration(log: &Logger, iter: usize, log_likelihood: f64, delta: f64) {
    log.log(
        Level::Trace,
        Domain::Regime,
        "em_iteration",
        obj(&[
            ("iter", json!(iter)),
            ("log_likelihood", v_num(log_likelihood)),
            ("delta", v_num(delta)),
        ]),
    );
}

pub fn log_signal_counts(log: &Logger, buys: usize, sells: usize, holds: usize) {
    log.log(
        Level::Info,
        Domain::Signal,
        "signals_generated",
        obj(&[
            ("buy", json!(buys)),
            ("sell", json!(sells)),
            ("hold", json!(holds)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Short stable fingerprint of a parameter string.
pub fn params_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

/// Non-finite numbers become `null`; JSON has no NaN.
pub fn v_num(n: f64) -> Value {
    if n.is_finite() {
        json!(n)
    } else {
        Value::Null
    }
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Emits structured timing for a pipeline section when dropped.
pub struct ProfileScope<'a> {
    log: &'a Logger,
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
}

impl<'a> ProfileScope<'a> {
    pub fn new(log: &'a Logger, label: &'static str) -> Self {
        Self { log, label, context: None, started: Instant::now() }
    }

    pub fn with_context(log: &'a Logger, label: &'static str, fields: &[(&str, Value)]) -> Self {
        let context = if log.enabled(Level::Trace, Domain::Profile) { Some(obj(fields)) } else { None };
        Self { log, label, context, started: Instant::now() }
    }
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        if !self.log.enabled(Level::Trace, Domain::Profile) {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        self.log.log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_level_filtering() {
        let (log, buf) = Logger::memory(Level::Info);
        log.log(Level::Debug, Domain::System, "hidden", Map::new());
        log.log(Level::Info, Domain::System, "shown", Map::new());
        assert!(buf.events("hidden").is_empty());
        assert_eq!(buf.events("shown").len(), 1);
    }

    #[test]
    fn test_record_shape() {
        let (log, buf) = Logger::memory(Level::Trace);
        log.log(
            Level::Warn,
            Domain::Regime,
            "fit_not_converged",
            obj(&[("msg", v_str("hit max_iter")), ("iterations", json!(5))]),
        );
        let rec = &buf.events("fit_not_converged")[0];
        assert_eq!(rec["lvl"], "WARN");
        assert_eq!(rec["component"], "regime");
        assert_eq!(rec["msg"], "hit max_iter");
        assert_eq!(rec["data"]["iterations"], 5);
        assert_eq!(rec["run_id"], log.run_id());
    }

    #[test]
    fn test_seq_increments() {
        let (log, buf) = Logger::memory(Level::Trace);
        log.log(Level::Info, Domain::System, "a", Map::new());
        log.log(Level::Info, Domain::System, "b", Map::new());
        let a = buf.events("a")[0]["seq"].as_u64().unwrap();
        let b = buf.events("b")[0]["seq"].as_u64().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_run_dir_routes_by_level_and_domain() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = LogConfig {
            level: Level::Trace,
            domains: Some(vec![Domain::Performance, Domain::Regime]),
            dir: Some(dir.path().to_path_buf()),
            run_id: Some("t1".to_string()),
            echo: false,
        };
        let log = Logger::open(&cfg).unwrap();
        log.log(Level::Info, Domain::Performance, "metrics.summary", obj(&[("bars", json!(5))]));
        log.log(Level::Trace, Domain::Regime, "em_iteration", Map::new());
        log.log(Level::Info, Domain::Data, "filtered_out", Map::new());
        log.flush();

        let run_dir = dir.path().join("t1");
        let events = std::fs::read_to_string(run_dir.join("events.jsonl")).unwrap();
        let trace = std::fs::read_to_string(run_dir.join("trace.jsonl")).unwrap();
        let metrics = std::fs::read_to_string(run_dir.join("metrics.jsonl")).unwrap();
        assert!(events.contains("metrics.summary"));
        assert!(!events.contains("filtered_out"));
        assert!(trace.contains("em_iteration"));
        assert!(metrics.contains("metrics.summary"));
        assert!(run_dir.join("manifest.json").exists());
    }

    #[test]
    fn test_log_config_from_lookup() {
        let vars = |key: &str| match key {
            "LOG_LEVEL" => Some("debug".to_string()),
            "LOG_DOMAINS" => Some("data, regime".to_string()),
            _ => None,
        };
        let cfg = LogConfig::from_lookup(vars).unwrap();
        assert_eq!(cfg.level, Level::Debug);
        assert_eq!(cfg.domains, Some(vec![Domain::Data, Domain::Regime]));
        assert_eq!(cfg.dir, Some(PathBuf::from("out/runs")));

        let cfg = LogConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.level, Level::Info);
        assert_eq!(cfg.domains, None);
    }

    #[test]
    fn test_log_config_rejects_unknown_names() {
        let bad_level = |key: &str| (key == "LOG_LEVEL").then(|| "verbose".to_string());
        assert!(LogConfig::from_lookup(bad_level).is_err());
        let bad_domain = |key: &str| (key == "LOG_DOMAINS").then(|| "data,regmie".to_string());
        assert!(LogConfig::from_lookup(bad_domain).is_err());
    }

    #[test]
    fn test_null_logger_disabled() {
        let log = Logger::null();
        assert!(!log.enabled(Level::Fatal, Domain::System));
    }

    #[test]
    fn test_params_hash_deterministic() {
        assert_eq!(params_hash("seed=42"), params_hash("seed=42"));
        assert_ne!(params_hash("seed=42"), params_hash("seed=43"));
        assert_eq!(params_hash("x").len(), 16);
    }

    #[test]
    fn test_v_num_non_finite_is_null() {
        assert_eq!(v_num(f64::NAN), Value::Null);
        assert_eq!(v_num(1.5), json!(1.5));
    }
}
