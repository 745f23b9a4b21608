use std::fs;
use std::path::Path;

use bitcoin::{Amount, Network};
use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, RecoveryResult};

pub const DEFAULT_RECOVERY_WINDOW: u32 = 200;
pub const SWEEP_DUST_LIMIT_SAT: u64 = 600;
pub const DEFAULT_FEE_RATE_SAT_VB: u64 = 30;
pub const DEFAULT_API_URL: &str = "https://blockstream.info/api";

/// Immutable settings threaded through every derivation, scan and sweep call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub network: Network,
    pub dust_limit_sat: u64,
    pub default_fee_rate_sat_vb: u64,
    pub recovery_window: u32,
    pub api_url: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            dust_limit_sat: SWEEP_DUST_LIMIT_SAT,
            default_fee_rate_sat_vb: DEFAULT_FEE_RATE_SAT_VB,
            recovery_window: DEFAULT_RECOVERY_WINDOW,
            api_url: DEFAULT_API_URL.to_string(),
        }
    }
}

impl RecoveryConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    /// Reads a TOML file. Missing keys fall back to their defaults.
    pub fn from_file(path: &Path) -> RecoveryResult<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| RecoveryError::Config(format!("could not read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> RecoveryResult<Self> {
        toml::from_str(raw).map_err(|e| RecoveryError::Config(e.to_string()))
    }

    /// BIP44 coin type of the configured network.
    pub fn coin_type(&self) -> u32 {
        match self.network {
            Network::Bitcoin => 0,
            _ => 1,
        }
    }

    pub fn dust_limit(&self) -> Amount {
        Amount::from_sat(self.dust_limit_sat)
    }

    /// Zero values mean "use the default", as on the command line.
    pub fn effective_window(&self, window: u32) -> u32 {
        if window == 0 {
            self.recovery_window
        } else {
            window
        }
    }

    pub fn effective_fee_rate(&self, fee_rate_sat_vb: u64) -> u64 {
        if fee_rate_sat_vb == 0 {
            self.default_fee_rate_sat_vb
        } else {
            fee_rate_sat_vb
        }
    }
}
