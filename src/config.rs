//! Gateway configuration
//!
//! All deployment-specific knobs live here as data: the upstream endpoint
//! template, the signing secret, the storage schema, TTL windows, and the
//! minute allow-set for the global sweep. The schema is declared once and
//! shared by the flattener (row width) and the row store (column types and
//! table DDL).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid JSON
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A config value is out of bounds or inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP method used for the upstream request
///
/// A deployment-level choice: some APIs take query parameters on GET,
/// others require a form-encoded POST body. Never decided per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMethod {
    #[default]
    Get,
    Post,
}

/// Declared type of one payload column in the storage schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Arbitrary text
    Text,
    /// Calendar date, stored as ISO-8601 text
    Date,
    /// Floating-point number
    Real,
    /// Whole number
    Integer,
}

impl ColumnType {
    /// SQLite column type used in the table DDL
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Text | ColumnType::Date => "TEXT",
            ColumnType::Real => "REAL",
            ColumnType::Integer => "INTEGER",
        }
    }
}

/// Full gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HMAC secret used to verify request tokens
    pub jwt_secret: String,
    /// Upstream URL template; `{series}` is replaced by the series name
    pub endpoint_template: String,
    /// Optional static API key passed as the `api_key` parameter
    pub api_key: Option<String>,
    /// HTTP method for the upstream request
    pub method: UpstreamMethod,
    /// Upstream request timeout in seconds
    pub request_timeout_secs: u64,
    /// Name of the storage table
    pub table_name: String,
    /// Ordered payload column types; defines row width for flattening
    pub schema: Vec<ColumnType>,
    /// Age in minutes past which the global sweep deletes rows
    pub global_ttl_minutes: i64,
    /// Age in minutes past which per-key rows are no longer fresh
    pub per_key_ttl_minutes: i64,
    /// Wall-clock minutes of the hour on which the global sweep may run
    pub sweep_minutes: Vec<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "between-you-and-me-keep-this-a-secret".to_string(),
            endpoint_template: "https://www.quandl.com/api/v3/datasets/CHRIS/{series}/data.json"
                .to_string(),
            api_key: None,
            method: UpstreamMethod::Get,
            request_timeout_secs: 30,
            table_name: "series_rows".to_string(),
            schema: vec![
                ColumnType::Date,
                ColumnType::Real,
                ColumnType::Real,
                ColumnType::Real,
                ColumnType::Real,
                ColumnType::Real,
                ColumnType::Real,
            ],
            global_ttl_minutes: 60 * 24,
            per_key_ttl_minutes: 30,
            sweep_minutes: vec![0, 15, 30, 45],
        }
    }
}

impl GatewayConfig {
    /// Loads and validates a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks internal consistency of the configuration
    ///
    /// # Returns
    /// * `Ok(())` if the configuration is usable
    /// * `Err(ConfigError::Invalid)` naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::Invalid("jwt_secret must not be empty".into()));
        }
        if !self.endpoint_template.contains("{series}") {
            return Err(ConfigError::Invalid(
                "endpoint_template must contain a {series} placeholder".into(),
            ));
        }
        if self.table_name.is_empty()
            || !self
                .table_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Invalid(
                "table_name must be a non-empty identifier".into(),
            ));
        }
        if self.schema.is_empty() {
            return Err(ConfigError::Invalid(
                "schema must declare at least one column".into(),
            ));
        }
        if self.global_ttl_minutes <= 0 || self.per_key_ttl_minutes <= 0 {
            return Err(ConfigError::Invalid("TTL minutes must be positive".into()));
        }
        if let Some(m) = self.sweep_minutes.iter().find(|m| **m > 59) {
            return Err(ConfigError::Invalid(format!(
                "sweep minute {} is out of range (0-59)",
                m
            )));
        }
        Ok(())
    }

    /// Width of one payload row, as declared by the schema
    pub fn row_width(&self) -> usize {
        self.schema.len()
    }
}
