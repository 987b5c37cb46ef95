//! Configuration validation for taiex services.
//!
//! Catches bad values (empty paths, zero pacing, impossible hours) before a
//! long-running sync starts.

use thiserror::Error;

use crate::config::{
    Config, ObservabilityConfig, ProbeConfig, ScreenerSettings, SourceSettings, SourcesConfig,
    StorageConfig, SyncSettings,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Configuration conflict: {reason}")]
    Conflict { reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

impl Config {
    /// Validate the entire configuration.
    pub fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        let sections: [&dyn Validate; 6] = [
            &self.storage,
            &self.sync,
            &self.sources,
            &self.probe,
            &self.screener,
            &self.observability,
        ];
        for section in sections {
            if let Err(e) = section.validate() {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }

    /// Load (with environment overrides) and validate configuration.
    ///
    /// Any failure maps to [`crate::Error::Config`].
    pub fn load_and_validate() -> crate::Result<Self> {
        let config = Self::load_with_env().map_err(|e| crate::Error::Config(format!("{e:#}")))?;
        config
            .validate()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(config)
    }
}

impl Validate for StorageConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.db_path.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "storage.db_path".into(),
            });
        }
        Ok(())
    }
}

impl Validate for SyncSettings {
    fn validate(&self) -> ValidationResult<()> {
        if !(1990..=2100).contains(&self.start_year) {
            return Err(ValidationError::InvalidValue {
                field: "sync.start_year".into(),
                reason: format!("{} is outside 1990..=2100", self.start_year),
            });
        }

        if self.cutoff_hour > 23 {
            return Err(ValidationError::InvalidValue {
                field: "sync.cutoff_hour".into(),
                reason: "must be between 0 and 23".into(),
            });
        }

        if self.reference_symbol.len() != 4
            || !self.reference_symbol.chars().all(|c| c.is_ascii_digit())
        {
            return Err(ValidationError::InvalidValue {
                field: "sync.reference_symbol".into(),
                reason: "must be a 4-digit code".into(),
            });
        }

        if self.concurrency == 0 {
            return Err(ValidationError::InvalidValue {
                field: "sync.concurrency".into(),
                reason: "must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

fn validate_source(name: &str, source: &SourceSettings) -> ValidationResult<()> {
    if source.enabled && source.min_interval_ms == 0 {
        return Err(ValidationError::InvalidValue {
            field: format!("sources.{name}.min_interval_ms"),
            reason: "must be greater than 0 when the source is enabled".into(),
        });
    }

    if let Some(ref url) = source.base_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ValidationError::InvalidValue {
                field: format!("sources.{name}.base_url"),
                reason: format!("not an http(s) URL: {url}"),
            });
        }
    }

    Ok(())
}

impl Validate for SourcesConfig {
    fn validate(&self) -> ValidationResult<()> {
        validate_source("twse", &self.twse)?;
        validate_source("tpex", &self.tpex)?;
        validate_source("finmind", &self.finmind)?;
        validate_source("yahoo", &self.yahoo)?;

        if !(self.twse.enabled || self.tpex.enabled || self.finmind.enabled || self.yahoo.enabled)
        {
            return Err(ValidationError::Conflict {
                reason: "every market-data source is disabled".into(),
            });
        }

        Ok(())
    }
}

impl Validate for ProbeConfig {
    fn validate(&self) -> ValidationResult<()> {
        for (field, url) in [
            ("probe.twse_listing_url", &self.twse_listing_url),
            ("probe.tpex_listing_url", &self.tpex_listing_url),
        ] {
            if let Some(url) = url {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ValidationError::InvalidValue {
                        field: field.into(),
                        reason: format!("not an http(s) URL: {url}"),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Validate for ScreenerSettings {
    fn validate(&self) -> ValidationResult<()> {
        if self.export_dir.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "screener.export_dir".into(),
            });
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_valid_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.observability.log_level = "loud".into();
        match config.validate() {
            Err(ValidationError::InvalidValue { field, .. }) => {
                assert_eq!(field, "observability.log_level");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test_case("trace", "json" ; "trace json")]
    #[test_case("INFO", "pretty" ; "case insensitive")]
    #[test_case("warn", "Pretty" ; "mixed case format")]
    fn test_accepted_observability(level: &str, format: &str) {
        let obs = ObservabilityConfig {
            log_level: level.into(),
            log_format: format.into(),
            excluded_targets: Vec::new(),
        };
        assert!(obs.validate().is_ok());
    }

    #[test]
    fn test_bad_reference_symbol() {
        let mut config = Config::default();
        config.sync.reference_symbol = "00".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pacing_on_enabled_source() {
        let mut config = Config::default();
        config.sources.finmind.min_interval_ms = 0;
        assert!(config.validate().is_err());

        config.sources.finmind.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_all_sources_disabled() {
        let mut config = Config::default();
        config.sources.twse.enabled = false;
        config.sources.tpex.enabled = false;
        config.sources.finmind.enabled = false;
        config.sources.yahoo.enabled = false;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Conflict { .. })
        ));
    }

    #[test]
    fn test_multiple_errors_collected() {
        let mut config = Config::default();
        config.storage.db_path = " ".into();
        config.sync.cutoff_hour = 30;
        assert!(matches!(
            config.validate(),
            Err(ValidationError::Multiple(errs)) if errs.len() == 2
        ));
    }
}
