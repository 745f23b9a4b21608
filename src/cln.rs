//! Key derivation for Core Lightning wallets, which expand a 32-byte `hsm_secret` with chained
//! HKDF-SHA256 calls instead of BIP32.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{RecoveryError, RecoveryResult};

pub const HSM_SECRET_LEN: usize = 32;

/// A single extract-and-expand round yielding 32 bytes.
pub fn hkdf_sha256(key: &[u8], salt: &[u8], info: &[u8]) -> RecoveryResult<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), key);
    let mut okm = [0u8; 32];
    hkdf.expand(info, &mut okm)
        .map_err(|e| RecoveryError::Derivation(format!("hkdf expand failed: {e}")))?;
    Ok(okm)
}

fn check_secret(hsm_secret: &[u8]) -> RecoveryResult<()> {
    if hsm_secret.len() != HSM_SECRET_LEN {
        return Err(RecoveryError::InvalidSeed(format!(
            "hsm secret must be {HSM_SECRET_LEN} bytes, got {}",
            hsm_secret.len()
        )));
    }
    Ok(())
}

/// The funding key of the `channel_db_id`-th channel with `peer`.
pub fn funding_key<C: Signing>(
    secp: &Secp256k1<C>,
    hsm_secret: &[u8],
    peer: &PublicKey,
    channel_db_id: u64,
) -> RecoveryResult<(SecretKey, PublicKey)> {
    check_secret(hsm_secret)?;
    let peer_seed = hkdf_sha256(hsm_secret, &[], b"peer seed")?;

    let mut salt = Vec::with_capacity(33 + 8);
    salt.extend_from_slice(&peer.serialize());
    salt.extend_from_slice(&channel_db_id.to_le_bytes());
    let per_peer_seed = hkdf_sha256(&peer_seed, &salt, b"per-peer seed")?;

    let funding = hkdf_sha256(&per_peer_seed, &[], b"c-lightning")?;
    let secret = SecretKey::from_slice(&funding)
        .map_err(|e| RecoveryError::Derivation(format!("invalid funding key: {e}")))?;
    Ok((secret, PublicKey::from_secret_key(secp, &secret)))
}

/// The node identity key. Salt 0 is retried upwards until the output is a valid scalar.
pub fn node_key<C: Signing>(
    secp: &Secp256k1<C>,
    hsm_secret: &[u8],
) -> RecoveryResult<(SecretKey, PublicKey)> {
    check_secret(hsm_secret)?;
    for salt in 0u32..=u32::from(u8::MAX) {
        let candidate = hkdf_sha256(hsm_secret, &salt.to_le_bytes(), b"nodeid")?;
        if let Ok(secret) = SecretKey::from_slice(&candidate) {
            return Ok((secret, PublicKey::from_secret_key(secp, &secret)));
        }
    }
    Err(RecoveryError::Derivation(
        "no valid node key found for hsm secret".into(),
    ))
}
