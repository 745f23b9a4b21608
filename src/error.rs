use thiserror::Error;

/// Everything that can go wrong while recovering remote force-closed channel funds.
///
/// Only [`RecoveryError::AddressNotFound`] is ever absorbed (per legacy channel record); all
/// other kinds abort the whole operation.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("invalid derivation path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("address {0} not found within the recovery window")]
    AddressNotFound(String),

    #[error(
        "found {targets} sweep targets with total value of {total_sat} sat, which leaves less \
         than the dust limit of {dust_limit_sat} sat after paying a fee of {fee_sat} sat"
    )]
    InsufficientFunds {
        targets: usize,
        total_sat: u64,
        fee_sat: u64,
        dust_limit_sat: u64,
    },

    #[error("could not sign input {input}: {reason}")]
    Signing { input: usize, reason: String },

    #[error("chain lookup failed: {0}")]
    Lookup(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid channel record: {0}")]
    InvalidRecord(String),

    #[error("invalid root key: {0}")]
    InvalidSeed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl RecoveryError {
    pub(crate) fn invalid_path(path: &str, reason: impl ToString) -> Self {
        Self::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn invalid_address(address: impl ToString, reason: impl ToString) -> Self {
        Self::InvalidAddress {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn signing(input: usize, reason: impl ToString) -> Self {
        Self::Signing {
            input,
            reason: reason.to_string(),
        }
    }
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
