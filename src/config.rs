//! Environment-driven settings.
//!
//! Values come from the process environment (after `.env` is loaded by
//! `dotenvy`). Every setting has a default except the S3 and OpenAI
//! credentials, whose absence switches the service to the local directory
//! and to fallback narratives respectively.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::narrative::GenerationOptions;
use crate::openai::DEFAULT_MODEL;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_REGION: &str = "us-east-1";

/// S3 bucket settings for the remote document source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct S3Settings {
    pub bucket: Option<String>,
    pub region: String,
    pub prefix: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Outcome of checking the S3 settings, returned by `GET /config/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigValidation {
    pub is_valid: bool,
    pub missing_configs: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

impl ConfigValidation {
    /// Record a failed connection attempt against otherwise complete settings.
    pub fn connection_failed(&mut self, reason: impl std::fmt::Display) {
        self.is_valid = false;
        self.warnings.push(format!("S3 connection test failed: {}", reason));
        self.recommendations
            .push("Check AWS credentials and bucket permissions".to_string());
    }
}

impl S3Settings {
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some()
    }

    /// Static check for required settings. A connection check may downgrade
    /// the result afterwards via [`ConfigValidation::connection_failed`].
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::default();

        let required = [
            ("AWS_ACCESS_KEY_ID", &self.access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &self.secret_access_key),
            ("S3_BUCKET_NAME", &self.bucket),
        ];
        for (name, value) in required {
            if value.is_none() {
                validation.missing_configs.push(name.to_string());
            }
        }

        if self.prefix.as_deref().map(|p| p.starts_with('/')).unwrap_or(false) {
            validation
                .warnings
                .push("S3_PREFIX starts with '/'; object keys never do".to_string());
        }

        if validation.missing_configs.is_empty() {
            validation.is_valid = true;
        } else {
            validation
                .recommendations
                .push("Set the missing environment variables or add them to .env".to_string());
            validation.recommendations.push(format!(
                "Until then documents are read from the local data directory ({} by default)",
                DEFAULT_DATA_DIR
            ));
        }
        validation
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub local_data_dir: PathBuf,
    pub s3: S3Settings,
    /// How long a document listing is reused.
    pub data_refresh: Duration,
    pub cache_ttl: Duration,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub generation: GenerationOptions,
    pub recipes_dir: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let s3 = S3Settings {
            bucket: get("S3_BUCKET_NAME"),
            region: get("S3_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            prefix: get("S3_PREFIX"),
            access_key_id: get("AWS_ACCESS_KEY_ID"),
            secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
        };

        let defaults = GenerationOptions::summary_defaults();
        let generation = GenerationOptions {
            max_tokens: parse_or(&get, "GENERATION_MAX_TOKENS", defaults.max_tokens)?,
            temperature: parse_or(&get, "GENERATION_TEMPERATURE", defaults.temperature)?,
            timeout: Duration::from_secs(parse_or(
                &get,
                "GENERATION_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )?),
        };

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            local_data_dir: PathBuf::from(
                get("LOCAL_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            ),
            s3,
            data_refresh: Duration::from_secs(
                parse_or(&get, "DATA_REFRESH_INTERVAL", 60u64)?
                    .checked_mul(60)
                    .context("DATA_REFRESH_INTERVAL is too large")?,
            ),
            cache_ttl: Duration::from_secs(parse_or(&get, "CACHE_TTL_SECS", 300u64)?),
            openai_api_key: get("OPENAI_API_KEY"),
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            generation,
            recipes_dir: get("RECIPES_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
