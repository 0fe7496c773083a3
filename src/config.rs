// Storefront client configuration

use crate::cart::DEFAULT_STORAGE_KEY;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },

    #[error("JSON parse error: {0}")]
    JsonParseError(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorefrontConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_ms: u64,
    pub currency: String,
    pub tax_multiplier: Decimal,
    pub payment_confirmation_delay_ms: u64,
    pub storage_key: String,
    pub status_poll_interval_ms: u64,
    pub status_poll_attempts: u32,
}

impl Default for StorefrontConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            auth_token: None,
            timeout_ms: 30000,
            currency: "usd".to_string(),
            // 10% flat tax
            tax_multiplier: Decimal::new(11, 1),
            payment_confirmation_delay_ms: 1500,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            status_poll_interval_ms: 5000,
            status_poll_attempts: 12,
        }
    }
}

impl StorefrontConfig {
    /// Defaults overridden by any `STOREFRONT_*` environment variable that is set,
    /// e.g. `STOREFRONT_BASE_URL` or `STOREFRONT_TAX_MULTIPLIER`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::JsonParseError(e.to_string()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("STOREFRONT_BASE_URL") {
            config.base_url = value;
        }
        if let Some(value) = lookup("STOREFRONT_AUTH_TOKEN") {
            config.auth_token = Some(value);
        }
        if let Some(value) = lookup("STOREFRONT_CURRENCY") {
            config.currency = value;
        }
        if let Some(value) = lookup("STOREFRONT_STORAGE_KEY") {
            config.storage_key = value;
        }
        parse_var(&lookup, "STOREFRONT_TIMEOUT_MS", &mut config.timeout_ms)?;
        parse_var(&lookup, "STOREFRONT_TAX_MULTIPLIER", &mut config.tax_multiplier)?;
        parse_var(
            &lookup,
            "STOREFRONT_PAYMENT_DELAY_MS",
            &mut config.payment_confirmation_delay_ms,
        )?;
        parse_var(
            &lookup,
            "STOREFRONT_POLL_INTERVAL_MS",
            &mut config.status_poll_interval_ms,
        )?;
        parse_var(
            &lookup,
            "STOREFRONT_POLL_ATTEMPTS",
            &mut config.status_poll_attempts,
        )?;

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn payment_confirmation_delay(&self) -> Duration {
        Duration::from_millis(self.payment_confirmation_delay_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(name) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.clone(),
        })?;
    }
    Ok(())
}
