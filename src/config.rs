//! Runtime configuration for the settlement services.

use crate::domain::money::Currency;
use crate::error::{Result, SettlementError};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Currencies accepted by every operation.
    pub supported_currencies: Vec<Currency>,

    /// Prefix of payout attempt idempotency keys.
    pub payout_key_prefix: String,

    /// Prefix that turns a payout attempt key into a gateway transfer key.
    pub transfer_key_prefix: String,

    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,

    pub gateway: SandboxGatewayConfig,
}

/// Behaviour of the in-process sandbox gateway used by the CLI and tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxGatewayConfig {
    /// Payment intents are confirmed as soon as they are created.
    pub auto_confirm_intents: bool,

    /// Transfers to these destinations are declined.
    pub declined_destinations: Vec<String>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            supported_currencies: Currency::all().to_vec(),
            payout_key_prefix: "po_".to_string(),
            transfer_key_prefix: "tr_".to_string(),
            log_filter: "info".to_string(),
            gateway: SandboxGatewayConfig::default(),
        }
    }
}

impl Default for SandboxGatewayConfig {
    fn default() -> Self {
        Self {
            auto_confirm_intents: true,
            declined_destinations: Vec::new(),
        }
    }
}

impl SettlementConfig {
    /// Loads a JSON config file; missing fields fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SettlementConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.supported_currencies.is_empty() {
            return Err(SettlementError::ValidationError(
                "At least one currency must be supported".to_string(),
            ));
        }
        if self.transfer_key_prefix.is_empty() {
            return Err(SettlementError::ValidationError(
                "Transfer key prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ensure_supported(&self, currency: Currency) -> Result<()> {
        if self.supported_currencies.contains(&currency) {
            Ok(())
        } else {
            Err(SettlementError::ValidationError(format!(
                "Unsupported currency: {currency}"
            )))
        }
    }
}
