use std::str::FromStr;

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Verification};
use serde::{Deserialize, Serialize};

use crate::error::{RecoveryError, RecoveryResult};

/// How the per-commitment tweak of a legacy (pre static-remote-key) channel is computed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TweakScheme {
    /// `SHA256(commit_point || base_point)`, the tweak lnd applied to `to_remote` keys.
    #[default]
    Bolt3,
    /// `SHA256` of the ECDH point between the base private key and the commitment point.
    Ecdh,
}

impl FromStr for TweakScheme {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bolt3" => Ok(TweakScheme::Bolt3),
            "ecdh" => Ok(TweakScheme::Ecdh),
            other => Err(RecoveryError::Config(format!(
                "unknown tweak scheme {other:?}, expected bolt3 or ecdh"
            ))),
        }
    }
}

impl TweakScheme {
    pub fn tweak_bytes(
        &self,
        base_secret: &SecretKey,
        base_point: &PublicKey,
        commit_point: &PublicKey,
    ) -> [u8; 32] {
        match self {
            TweakScheme::Bolt3 => single_tweak_bytes(commit_point, base_point),
            TweakScheme::Ecdh => ecdh_tweak_bytes(base_secret, commit_point),
        }
    }
}

pub fn single_tweak_bytes(commit_point: &PublicKey, base_point: &PublicKey) -> [u8; 32] {
    let mut engine = sha256::Hash::engine();
    engine.input(&commit_point.serialize());
    engine.input(&base_point.serialize());
    sha256::Hash::from_engine(engine).to_byte_array()
}

pub fn ecdh_tweak_bytes(secret: &SecretKey, point: &PublicKey) -> [u8; 32] {
    SharedSecret::new(point, secret).secret_bytes()
}

fn tweak_scalar(tweak: &[u8; 32]) -> RecoveryResult<Scalar> {
    Scalar::from_be_bytes(*tweak)
        .map_err(|_| RecoveryError::Derivation("tweak is not a valid scalar".into()))
}

/// `base + tweak·G`
pub fn tweak_pub_key<C: Verification>(
    secp: &Secp256k1<C>,
    base: &PublicKey,
    tweak: &[u8; 32],
) -> RecoveryResult<PublicKey> {
    base.add_exp_tweak(secp, &tweak_scalar(tweak)?)
        .map_err(|e| RecoveryError::Derivation(format!("could not tweak public key: {e}")))
}

/// `base + tweak mod n`
pub fn tweak_priv_key(base: &SecretKey, tweak: &[u8; 32]) -> RecoveryResult<SecretKey> {
    base.add_tweak(&tweak_scalar(tweak)?)
        .map_err(|e| RecoveryError::Derivation(format!("could not tweak private key: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_tweaked_pair_stays_consistent() {
        let secp = Secp256k1::new();
        let base = key(0x11);
        let base_point = base.public_key(&secp);
        let commit_point = key(0x22).public_key(&secp);

        for scheme in [TweakScheme::Bolt3, TweakScheme::Ecdh] {
            let tweak = scheme.tweak_bytes(&base, &base_point, &commit_point);
            let tweaked_secret = tweak_priv_key(&base, &tweak).unwrap();
            let tweaked_point = tweak_pub_key(&secp, &base_point, &tweak).unwrap();
            assert_eq!(tweaked_secret.public_key(&secp), tweaked_point);
            assert_ne!(tweaked_point, base_point);
        }
    }

    #[test]
    fn test_parse_scheme() {
        assert_eq!("ECDH".parse::<TweakScheme>().unwrap(), TweakScheme::Ecdh);
        assert_eq!("bolt3".parse::<TweakScheme>().unwrap(), TweakScheme::default());
        assert!("sha".parse::<TweakScheme>().is_err());
    }

    #[test]
    fn test_ecdh_is_symmetric() {
        let secp = Secp256k1::new();
        let a = key(0x01);
        let b = key(0x02);
        assert_eq!(
            ecdh_tweak_bytes(&a, &b.public_key(&secp)),
            ecdh_tweak_bytes(&b, &a.public_key(&secp))
        );
    }

    #[test]
    fn test_single_tweak_order_matters() {
        let secp = Secp256k1::new();
        let a = key(0x01).public_key(&secp);
        let b = key(0x02).public_key(&secp);
        assert_ne!(single_tweak_bytes(&a, &b), single_tweak_bytes(&b, &a));
    }

    #[test]
    fn test_bolt3_tweak_vector() {
        // BOLT #3 key derivation test vector
        let base_point: PublicKey =
            "036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2"
                .parse()
                .unwrap();
        let commit_point: PublicKey =
            "025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486"
                .parse()
                .unwrap();
        let secp = Secp256k1::new();
        let tweak = single_tweak_bytes(&commit_point, &base_point);
        assert_eq!(
            tweak_pub_key(&secp, &base_point, &tweak).unwrap().to_string(),
            "0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5"
        );
    }
}
