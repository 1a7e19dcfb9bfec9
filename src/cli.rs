//! Command-line interface for the gateway
//!
//! Parses the request token and deployment options, and renders the
//! returned row set either as tab-separated text or as JSON.

use std::path::PathBuf;

use clap::Parser;
use serde_json::json;

use crate::config::{ConfigError, GatewayConfig};
use crate::store::{ColumnValue, StoredRow};

/// seriesgate - token-authenticated caching gateway for series data APIs
#[derive(Parser, Debug)]
#[command(name = "seriesgate")]
#[command(about = "Serve cached or freshly fetched rows for a signed request token")]
#[command(version)]
pub struct Cli {
    /// Signed request token (JWT) describing the series and date range
    pub token: String,

    /// Path to a JSON configuration file; defaults apply when omitted
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the SQLite row store
    #[arg(long, value_name = "PATH", default_value = "seriesgate.db")]
    pub db: PathBuf,

    /// Print rows as a JSON array instead of tab-separated text
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Loads the gateway configuration selected by the arguments
    pub fn load_config(&self) -> Result<GatewayConfig, ConfigError> {
        match &self.config {
            Some(path) => GatewayConfig::from_json_file(path),
            None => Ok(GatewayConfig::default()),
        }
    }
}

/// Renders rows as tab-separated lines, oldest first
pub fn render_text(rows: &[StoredRow]) -> String {
    let mut out = String::new();
    for row in rows {
        out.push_str(&row.created_at.to_rfc3339());
        out.push('\t');
        out.push_str(&row.identity);
        for value in &row.values {
            out.push('\t');
            out.push_str(&value.to_string());
        }
        out.push('\n');
    }
    out
}

/// Renders rows as a JSON array of objects
pub fn render_json(rows: &[StoredRow]) -> String {
    let array: Vec<_> = rows
        .iter()
        .map(|row| {
            json!({
                "creation_timestamp": row.created_at.to_rfc3339(),
                "request_identity": row.identity,
                "columns": row.values.iter().map(column_json).collect::<Vec<_>>(),
            })
        })
        .collect();
    serde_json::to_string_pretty(&array).unwrap_or_else(|_| "[]".to_string())
}

fn column_json(value: &ColumnValue) -> serde_json::Value {
    match value {
        ColumnValue::Text(s) => json!(s),
        ColumnValue::Date(d) => json!(d.format(crate::token::DATE_FORMAT).to_string()),
        ColumnValue::Real(v) => json!(v),
        ColumnValue::Integer(i) => json!(i),
        ColumnValue::Null => serde_json::Value::Null,
    }
}
