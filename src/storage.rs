use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

use crate::pipeline::PipelineOutput;

/// SQLite sink for finished runs.
pub struct RunStore {
    conn: Connection,
}

/// Run-level row of the `runs` table.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub ts: String,
    pub params_hash: String,
    pub input_sha256: Option<String>,
    pub bars: usize,
    pub n_components: usize,
    pub converged: bool,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub cumulative_return: f64,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: f64,
    pub buy_hold_return: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunBarRecord {
    pub date: String,
    pub close: f64,
    pub daily_return: f64,
    pub hmm_state: usize,
    pub regime_label: String,
    pub signal: String,
    pub strategy_return: f64,
    pub cumulative_return: f64,
}

impl RunStore {
    pub fn open(path: &str) -> Result<Self> {
        let mut store = Self { conn: Connection::open(path)? };
        store.init()?;
        Ok(store)
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                ts TEXT NOT NULL,
                params_hash TEXT NOT NULL,
                input_sha256 TEXT,
                bars INTEGER NOT NULL,
                n_components INTEGER NOT NULL,
                converged INTEGER NOT NULL,
                iterations INTEGER NOT NULL,
                log_likelihood REAL NOT NULL,
                cumulative_return REAL NOT NULL,
                sharpe_ratio REAL,
                max_drawdown REAL NOT NULL,
                buy_hold_return REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS run_bars (
                run_id TEXT NOT NULL,
                date TEXT NOT NULL,
                close REAL NOT NULL,
                daily_return REAL NOT NULL,
                hmm_state INTEGER NOT NULL,
                regime_label TEXT NOT NULL,
                signal TEXT NOT NULL,
                strategy_return REAL NOT NULL,
                cumulative_return REAL NOT NULL,
                PRIMARY KEY (run_id, date)
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Write the run summary and every bar in one transaction. Re-persisting
    /// a run id replaces the earlier rows.
    pub fn persist_run(
        &mut self,
        run_id: &str,
        params_hash: &str,
        input_sha256: Option<&str>,
        out: &PipelineOutput,
    ) -> Result<()> {
        let m = &out.performance.metrics;
        let report = &out.regime.report;
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM run_bars WHERE run_id = ?1", params![run_id])?;
        tx.execute(
            "INSERT OR REPLACE INTO runs (run_id, ts, params_hash, input_sha256, bars, n_components,
                converged, iterations, log_likelihood, cumulative_return, sharpe_ratio, max_drawdown,
                buy_hold_return)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run_id,
                crate::logging::ts_now(),
                params_hash,
                input_sha256,
                m.bars as i64,
                out.regime.model.n_components as i64,
                report.converged,
                report.iterations as i64,
                report.log_likelihood,
                m.cumulative_return,
                m.sharpe_ratio,
                m.max_drawdown,
                m.buy_hold_return
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO run_bars (run_id, date, close, daily_return, hmm_state, regime_label,
                    signal, strategy_return, cumulative_return)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for row in out.rows() {
                stmt.execute(params![
                    run_id,
                    row.features.date().format("%Y-%m-%d").to_string(),
                    row.features.bar.close,
                    row.features.daily_return,
                    row.regime.hmm_state as i64,
                    row.regime.regime_label.as_str(),
                    row.signal.action.as_str(),
                    row.strategy_return,
                    row.cumulative_return
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let rec = self
            .conn
            .query_row(
                "SELECT run_id, ts, params_hash, input_sha256, bars, n_components, converged,
                    iterations, log_likelihood, cumulative_return, sharpe_ratio, max_drawdown,
                    buy_hold_return
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                |r| {
                    Ok(RunRecord {
                        run_id: r.get(0)?,
                        ts: r.get(1)?,
                        params_hash: r.get(2)?,
                        input_sha256: r.get(3)?,
                        bars: r.get::<_, i64>(4)? as usize,
                        n_components: r.get::<_, i64>(5)? as usize,
                        converged: r.get(6)?,
                        iterations: r.get::<_, i64>(7)? as usize,
                        log_likelihood: r.get(8)?,
                        cumulative_return: r.get(9)?,
                        sharpe_ratio: r.get(10)?,
                        max_drawdown: r.get(11)?,
                        buy_hold_return: r.get(12)?,
                    })
                },
            )
            .optional()?;
        Ok(rec)
    }

    /// Bars of a run in date order.
    pub fn load_run_bars(&self, run_id: &str) -> Result<Vec<RunBarRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT date, close, daily_return, hmm_state, regime_label, signal, strategy_return,
                cumulative_return
             FROM run_bars WHERE run_id = ?1 ORDER BY date",
        )?;
        let rows = stmt.query_map(params![run_id], |r| {
            Ok(RunBarRecord {
                date: r.get(0)?,
                close: r.get(1)?,
                daily_return: r.get(2)?,
                hmm_state: r.get::<_, i64>(3)? as usize,
                regime_label: r.get(4)?,
                signal: r.get(5)?,
                strategy_return: r.get(6)?,
                cumulative_return: r.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
