//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the scheduler and
//! window calculator. Services never read process-wide environment variables while handling an
//! operation.

use crate::constants::{
    DEFAULT_PROTOCOL_DIR, DEFAULT_SEARCH_WINDOW_MONTHS, FACILITIES_FILENAME, HOLIDAYS_FILENAME,
    RULES_FILENAME, SCHEDULES_FILENAME,
};
use crate::{EdcError, EdcResult};
use std::path::{Path, PathBuf};

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct EdcConfig {
    enforce_window_period: bool,
    default_search_window_months: u32,
    protocol_dir: PathBuf,
}

impl Default for EdcConfig {
    fn default() -> Self {
        Self {
            enforce_window_period: true,
            default_search_window_months: DEFAULT_SEARCH_WINDOW_MONTHS,
            protocol_dir: PathBuf::from(DEFAULT_PROTOCOL_DIR),
        }
    }
}

impl EdcConfig {
    /// Create a new `EdcConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::InvalidInput`] if `default_search_window_months` is zero.
    pub fn new(
        enforce_window_period: bool,
        default_search_window_months: u32,
        protocol_dir: PathBuf,
    ) -> EdcResult<Self> {
        if default_search_window_months == 0 {
            return Err(EdcError::InvalidInput(
                "default_search_window_months must be at least 1".into(),
            ));
        }

        Ok(Self {
            enforce_window_period,
            default_search_window_months,
            protocol_dir,
        })
    }

    /// When false, window checks always pass without computing bounds.
    pub fn enforce_window_period(&self) -> bool {
        self.enforce_window_period
    }

    pub fn default_search_window_months(&self) -> u32 {
        self.default_search_window_months
    }

    pub fn protocol_dir(&self) -> &Path {
        &self.protocol_dir
    }

    pub fn schedules_file(&self) -> PathBuf {
        self.protocol_dir.join(SCHEDULES_FILENAME)
    }

    pub fn facilities_file(&self) -> PathBuf {
        self.protocol_dir.join(FACILITIES_FILENAME)
    }

    pub fn holidays_file(&self) -> PathBuf {
        self.protocol_dir.join(HOLIDAYS_FILENAME)
    }

    pub fn rules_file(&self) -> PathBuf {
        self.protocol_dir.join(RULES_FILENAME)
    }
}

/// Parse the "enforce window period" flag from an optional string value.
///
/// Accepts `true/false`, `1/0`, `yes/no` (case-insensitive). `None` or blank returns `true`.
pub fn enforce_window_period_from_env_value(value: Option<String>) -> EdcResult<bool> {
    let value = value
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty());

    match value.as_deref() {
        None => Ok(true),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(EdcError::InvalidInput(format!(
            "invalid enforce window period flag '{other}' (expected true/false)"
        ))),
    }
}

/// Parse the default facility search window (in months) from an optional string value.
///
/// `None` or blank returns [`DEFAULT_SEARCH_WINDOW_MONTHS`].
pub fn search_window_months_from_env_value(value: Option<String>) -> EdcResult<u32> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    match value {
        None => Ok(DEFAULT_SEARCH_WINDOW_MONTHS),
        Some(v) => match v.parse::<u32>() {
            Ok(months) if months > 0 => Ok(months),
            _ => Err(EdcError::InvalidInput(format!(
                "invalid search window '{v}' (expected a positive number of months)"
            ))),
        },
    }
}
