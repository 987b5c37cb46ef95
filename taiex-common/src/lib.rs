//! Taiex Common - Shared configuration, errors and logging for the taiex tools.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - Error types and exit-code mapping
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod validation;

pub use config::{
    CalendarInferenceMode, Config, ObservabilityConfig, ProbeConfig, ScreenerSettings,
    SourceSettings, SourcesConfig, StorageConfig, SyncSettings,
};
pub use error::{Error, Result};
pub use validation::{Validate, ValidationError, ValidationResult};

