//! Policy configuration

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bitcoin network the signer is operating on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl Network {
    /// Only mainnet slashing outputs are required to be OP_RETURN burns
    pub fn requires_op_return_burn(&self) -> bool {
        matches!(self, Self::Mainnet)
    }
}

/// Accepted range for the fee limits carried in a parameter blob (sats)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeLimitBounds {
    pub min: u64,
    pub max: u64,
}

impl FeeLimitBounds {
    pub fn contains(&self, sats: u64) -> bool {
        (self.min..=self.max).contains(&sats)
    }
}

impl Default for FeeLimitBounds {
    fn default() -> Self {
        Self {
            min: 1_000,
            max: 9_000,
        }
    }
}

/// Policy configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Network the transactions are for
    pub network: Network,

    /// Bounds applied to the slashing and unbonding fee limits, if any
    pub fee_limit_bounds: Option<FeeLimitBounds>,

    /// Fee above which staking, expansion and withdraw raise a warning
    pub high_fee_warning_sats: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            fee_limit_bounds: Some(FeeLimitBounds::default()),
            high_fee_warning_sats: 9_000,
        }
    }
}

impl PolicyConfig {
    /// Default configuration for a given network
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(bounds) = self.fee_limit_bounds {
            if bounds.min > bounds.max {
                return Err(Error::Config(format!(
                    "fee limit bounds are inverted ({} > {})",
                    bounds.min, bounds.max
                )));
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
