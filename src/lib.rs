//! Regime-aware momentum research pipeline.
//!
//! OHLCV bars flow through four stages: [`features`] derives SMAs, returns
//! and volatility; [`regime`] fits a Gaussian HMM and labels each bar;
//! [`signals`] turns regime and momentum into buy/sell/hold; [`metrics`]
//! scores the result. [`pipeline`] runs them in order.

pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod hmm;
pub mod indicators;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod regime;
pub mod signals;
pub mod storage;
