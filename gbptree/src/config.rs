//! Tree configuration.
//!
//! Configuration is fixed when a tree is opened. The page size must match the
//! page size recorded in an existing file's meta record.
//!
//! # Environment Variables
//!
//! - `GBPTREE_PAGE_SIZE`: Page size in bytes for new files (default: `8192`)
//! - `GBPTREE_CLEANUP_BATCH_SIZE`: Pages per recovery cleanup batch (default: `128`)
//! - `GBPTREE_STRUCTURE_LOG`: Path of the structure write log (default: disabled)
//!
//! # Invariants
//!
//! - `page_size` is a power of two within `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`
//! - `cleanup_batch_size` is at least 1
//! - `split_ratio` is within `[0.0, 1.0]`

use std::path::PathBuf;

use crate::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE};

/// Tree configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeConfig {
    /// Page size in bytes.
    pub page_size: usize,
    /// Maximum number of pages scanned per recovery cleanup batch.
    pub cleanup_batch_size: usize,
    /// Where to append structural events, if anywhere.
    pub structure_log: Option<PathBuf>,
    /// Split ratio new writers start with.
    /// 0.0 keeps as little as possible in the left node, 1.0 keeps as much as
    /// possible, 0.5 balances.
    pub split_ratio: f64,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is out of range or does not parse.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cleanup_batch_size: Self::DEFAULT_CLEANUP_BATCH_SIZE,
            structure_log: None,
            split_ratio: Self::DEFAULT_SPLIT_RATIO,
        }
    }
}

impl TreeConfig {
    /// Default pages per cleanup batch.
    pub const DEFAULT_CLEANUP_BATCH_SIZE: usize = 128;
    /// Default split ratio (balanced).
    pub const DEFAULT_SPLIT_RATIO: f64 = 0.5;

    /// Set the page size.
    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the recovery cleanup batch size.
    #[must_use]
    pub const fn with_cleanup_batch_size(mut self, batch_size: usize) -> Self {
        self.cleanup_batch_size = batch_size;
        self
    }

    /// Enable the structure write log.
    #[must_use]
    pub fn with_structure_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.structure_log = Some(path.into());
        self
    }

    /// Set the default split ratio.
    #[must_use]
    pub const fn with_split_ratio(mut self, ratio: f64) -> Self {
        self.split_ratio = ratio;
        self
    }

    /// Check all invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(ConfigError::InvalidValue {
                name: "page_size".to_string(),
                message: format!(
                    "{} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}",
                    self.page_size
                ),
            });
        }
        if self.cleanup_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "cleanup_batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        validate_split_ratio(self.split_ratio)
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup("GBPTREE_PAGE_SIZE") {
            config.page_size = parse_usize("GBPTREE_PAGE_SIZE", &value)?;
        }
        if let Some(value) = lookup("GBPTREE_CLEANUP_BATCH_SIZE") {
            config.cleanup_batch_size = parse_usize("GBPTREE_CLEANUP_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("GBPTREE_STRUCTURE_LOG") {
            if !value.is_empty() {
                config.structure_log = Some(PathBuf::from(value));
            }
        }
        config.validate()?;
        Ok(config)
    }
}

/// Reject split ratios outside `[0.0, 1.0]`.
pub fn validate_split_ratio(ratio: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&ratio) {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            name: "split_ratio".to_string(),
            message: format!("{ratio} is not within [0.0, 1.0]"),
        })
    }
}

fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        message: format!("'{value}' is not a valid number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = TreeConfig::default();
        assert_eq!(config.page_size, 8192);
        assert_eq!(config.cleanup_batch_size, 128);
        assert!(config.structure_log.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_values() {
        let config = TreeConfig::from_lookup(|name| match name {
            "GBPTREE_PAGE_SIZE" => Some("512".to_string()),
            "GBPTREE_CLEANUP_BATCH_SIZE" => Some("7".to_string()),
            "GBPTREE_STRUCTURE_LOG" => Some("/tmp/structure.log".to_string()),
            _ => None,
        })
        .expect("should load");

        assert_eq!(config.page_size, 512);
        assert_eq!(config.cleanup_batch_size, 7);
        assert_eq!(config.structure_log, Some(PathBuf::from("/tmp/structure.log")));
    }

    #[test]
    fn test_rejects_bad_page_size() {
        let err = TreeConfig::from_lookup(|name| {
            (name == "GBPTREE_PAGE_SIZE").then(|| "1000".to_string())
        })
        .expect_err("1000 is not a power of two");
        assert!(err.to_string().contains("page_size"));

        let err = TreeConfig::from_lookup(|name| {
            (name == "GBPTREE_PAGE_SIZE").then(|| "lots".to_string())
        })
        .expect_err("not a number");
        assert_eq!(
            err.to_string(),
            "invalid value for GBPTREE_PAGE_SIZE: 'lots' is not a valid number"
        );
    }

    #[test]
    fn test_rejects_zero_batch_and_bad_ratio() {
        assert!(
            TreeConfig::default()
                .with_cleanup_batch_size(0)
                .validate()
                .is_err()
        );
        assert!(TreeConfig::default().with_split_ratio(1.5).validate().is_err());
        assert!(TreeConfig::default().with_split_ratio(0.0).validate().is_ok());
        assert!(TreeConfig::default().with_split_ratio(1.0).validate().is_ok());
    }
}
