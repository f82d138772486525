//! Engine configuration, loaded once at process start from the environment
//! (teacher's `core/config.rs::Config::from_env()` pattern) plus a TOML file
//! for the fee→account mapping table. Every account/analytic/warehouse id is
//! immutable after load (spec.md §6 "Configuration", §9 "Global state").

use rust_decimal::Decimal;
use serde::Deserialize;
use shared::fee::{AccountMapping, FeeKind, FeeTable, FeeTableError};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("environment variable {name} has an invalid value {value:?}: {detail}")]
    InvalidEnv { name: &'static str, value: String, detail: String },
    #[error("failed to read fee table file {path:?}: {detail}")]
    FeeTableUnreadable { path: String, detail: String },
    #[error("failed to parse fee table file {path:?}: {detail}")]
    FeeTableMalformed { path: String, detail: String },
    #[error(transparent)]
    FeeTable(#[from] FeeTableError),
}

/// On-disk shape of the fee table TOML file: one entry per `FeeKind`.
#[derive(Debug, Deserialize)]
struct RawFeeTable {
    mappings: HashMap<String, RawAccountMapping>,
}

#[derive(Debug, Deserialize)]
struct RawAccountMapping {
    account_id: u32,
    analytic_account_id: Option<u32>,
}

/// Process-wide, immutable configuration (spec.md §6, §9 "Global state").
/// Constructed once in `main` and passed by value/`Arc` into every component —
/// never read through a global singleton.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub redis_url: String,
    pub marketplace_base_url: String,
    pub marketplace_api_key: Option<String>,
    pub erp_endpoint: Option<String>,
    pub erp_username: Option<String>,
    pub erp_password: Option<String>,
    /// Sales journal used by `create_customer_invoice` (spec.md §6 "All
    /// account, analytic, warehouse, partner, and journal identifiers are
    /// supplied via configuration").
    pub erp_journal_id: u32,
    pub erp_warehouse_id: u32,
    /// Fallback partner used when an order carries no buyer email
    /// (spec.md §4.8 step 3 "documented fallback to a configured generic
    /// partner").
    pub generic_partner_name: String,
    pub fee_table: FeeTable,
    pub snapshot_event_interval: u64,
    pub snapshot_time_interval_minutes: u64,
    pub projector_workers: usize,
    pub notifier_webhook_url: Option<String>,
    pub notifier_min_severity: u8,
    /// Balance-invariant tolerance (spec.md §9 Open Question: kept
    /// configurable rather than hardcoded, so zero-decimal currencies can
    /// supply a tighter value than the default `0.01`).
    pub money_tolerance: Decimal,
    pub stream_name: String,
    pub consumer_group: String,
    pub stream_retention: usize,
    pub environment: String,
}

impl EngineConfig {
    /// Load from environment variables plus the TOML fee table named by
    /// `FEE_TABLE_PATH`. Missing required values are a fatal
    /// `ConfigurationError` at startup, never a silently-assumed default
    /// (spec.md §6 "the system never invents a fallback date").
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let fee_table_path = require_env("FEE_TABLE_PATH")?;
        let fee_table = load_fee_table(&fee_table_path)?;

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://sync-engine.db".to_string()),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            marketplace_base_url: require_env("MARKETPLACE_BASE_URL")?,
            marketplace_api_key: std::env::var("MARKETPLACE_API_KEY").ok(),
            erp_endpoint: std::env::var("ERP_ENDPOINT").ok(),
            erp_username: std::env::var("ERP_USERNAME").ok(),
            erp_password: std::env::var("ERP_PASSWORD").ok(),
            erp_journal_id: parse_env_or("ERP_JOURNAL_ID", 1)?,
            erp_warehouse_id: parse_env_or("ERP_WAREHOUSE_ID", 1)?,
            generic_partner_name: std::env::var("GENERIC_PARTNER_NAME")
                .unwrap_or_else(|_| "Marketplace Generic Buyer".to_string()),
            fee_table,
            snapshot_event_interval: parse_env_or("SNAPSHOT_EVENT_INTERVAL", 10)?,
            snapshot_time_interval_minutes: parse_env_or("SNAPSHOT_TIME_INTERVAL_MINUTES", 60)?,
            projector_workers: parse_env_or("PROJECTOR_WORKERS", 4)?,
            notifier_webhook_url: std::env::var("NOTIFIER_WEBHOOK_URL").ok(),
            notifier_min_severity: parse_env_or("NOTIFIER_MIN_SEVERITY", 0u8)?,
            money_tolerance: parse_env_or("MONEY_TOLERANCE", Decimal::new(1, 2))?,
            stream_name: std::env::var("STREAM_NAME").unwrap_or_else(|_| "finance".to_string()),
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "finance-consumers".to_string()),
            stream_retention: parse_env_or("STREAM_RETENTION", 10_000)?,
            environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigurationError> {
    std::env::var(name).map_err(|_| ConfigurationError::MissingEnv(name))
}

fn parse_env_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigurationError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value.parse().map_err(|e: T::Err| ConfigurationError::InvalidEnv {
            name,
            value,
            detail: e.to_string(),
        }),
    }
}

fn load_fee_table(path: &str) -> Result<FeeTable, ConfigurationError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigurationError::FeeTableUnreadable {
        path: path.to_string(),
        detail: e.to_string(),
    })?;
    let raw: RawFeeTable = toml::from_str(&contents).map_err(|e| ConfigurationError::FeeTableMalformed {
        path: path.to_string(),
        detail: e.to_string(),
    })?;

    let mut mappings = HashMap::new();
    for (key, value) in raw.mappings {
        let kind = fee_kind_from_key(&key).ok_or_else(|| ConfigurationError::FeeTableMalformed {
            path: path.to_string(),
            detail: format!("unknown fee kind key {key:?}"),
        })?;
        let mapping = AccountMapping::new(value.account_id, value.analytic_account_id)?;
        mappings.insert(kind, mapping);
    }
    Ok(FeeTable::new(mappings))
}

fn fee_kind_from_key(key: &str) -> Option<FeeKind> {
    match key {
        "fulfillment" => Some(FeeKind::Fulfillment),
        "commission" => Some(FeeKind::Commission),
        "refund_commission" => Some(FeeKind::RefundCommission),
        "shipping_charge" => Some(FeeKind::ShippingCharge),
        "promo_rebate" => Some(FeeKind::PromoRebate),
        "storage" => Some(FeeKind::Storage),
        "payment_method_fee" => Some(FeeKind::PaymentMethodFee),
        "shipping_chargeback" => Some(FeeKind::ShippingChargeback),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_table_loads_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fee_table.toml");
        std::fs::write(
            &path,
            r#"
            [mappings.fulfillment]
            account_id = 6221

            [mappings.commission]
            account_id = 6222

            [mappings.payment_method_fee]
            account_id = 1133
            analytic_account_id = 42
            "#,
        )
        .unwrap();

        let table = load_fee_table(path.to_str().unwrap()).unwrap();
        assert_eq!(table.resolve(FeeKind::Fulfillment).unwrap().account_id, 6221);
        assert_eq!(table.principal_mapping().unwrap().analytic_account_id, Some(42));
    }

    #[test]
    fn missing_fee_table_file_is_a_configuration_error() {
        assert!(load_fee_table("/nonexistent/fee_table.toml").is_err());
    }
}
