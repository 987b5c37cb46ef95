//! Technical screener.
//!
//! Runs one indicator across the registered universe, ranks the symbols
//! that signal and exports the result.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Criterion  │────▶│  Screener   │────▶│   Report    │
//! │ (+ floor)   │     │  Engine     │     │ csv/json/   │
//! └─────────────┘     └──────┬──────┘     │ codes       │
//!                            │            └─────────────┘
//!                     ┌──────┴──────┐
//!                     │  BarStore   │  minimal window per symbol
//!                     │  (SQLite)   │
//!                     └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use taiex_engine::screener::{CriterionKind, ScreenerConfig, ScreenerEngine};
//!
//! let engine = ScreenerEngine::new(store, ScreenerConfig::default());
//! let criterion = CriterionKind::Volatility.with_defaults(today);
//! let outcome = engine.screen(&criterion, &universe, |p| println!("{}/{}", p.current, p.total)).await;
//! ```

pub mod criteria;
pub mod engine;
pub mod report;

pub use criteria::{BarWindow, Criterion, CriterionKind, ScreenerConfig};
pub use engine::{ScreenHit, ScreenOutcome, ScreenProgress, ScreenerEngine, Signal};
pub use report::{ReportFormat, ScreenReport};
