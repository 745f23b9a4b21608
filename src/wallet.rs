use std::str::FromStr;

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::{Secp256k1, Signing};
use bitcoin::{Address, AddressType, CompressedPublicKey, Network, NetworkKind, ScriptBuf};
use tracing::info;

use crate::config::RecoveryConfig;
use crate::derivation::{derive_path, wallet_receive_path, ExtendedKey};
use crate::error::{RecoveryError, RecoveryResult};

/// Sweep address sentinel: pay to the first BIP84 address of the seed being recovered.
pub const ADDRESS_DERIVE_FROM_WALLET: &str = "fromseed";

const MIN_SEED_LEN: usize = 16;
const MAX_SEED_LEN: usize = 64;

/// Parses `address` for `network`. Only native segwit v0 key hash and taproot destinations
/// are accepted.
pub fn check_address(address: &str, network: Network) -> RecoveryResult<Address> {
    let parsed = Address::from_str(address)
        .map_err(|e| RecoveryError::invalid_address(address, e))?
        .require_network(network)
        .map_err(|e| RecoveryError::invalid_address(address, e))?;
    match parsed.address_type() {
        Some(AddressType::P2wpkh) | Some(AddressType::P2tr) => Ok(parsed),
        _ => Err(RecoveryError::invalid_address(
            address,
            "must be a bech32 P2WKH or P2TR address",
        )),
    }
}

/// The first external BIP84 address of the wallet.
pub fn wallet_address<C: Signing>(
    secp: &Secp256k1<C>,
    master: &ExtendedKey,
    config: &RecoveryConfig,
) -> RecoveryResult<Address> {
    let key = derive_path(secp, master, &wallet_receive_path(config.coin_type(), 0)?)?;
    Ok(Address::p2wpkh(
        &CompressedPublicKey(key.public_key()),
        config.network,
    ))
}

/// Resolves the user supplied sweep destination into its output script.
pub fn prepare_sweep_address<C: Signing>(
    secp: &Secp256k1<C>,
    master: &ExtendedKey,
    address: &str,
    config: &RecoveryConfig,
) -> RecoveryResult<(Address, ScriptBuf)> {
    let address = if address == ADDRESS_DERIVE_FROM_WALLET {
        let derived = wallet_address(secp, master, config)?;
        info!("Using address {} derived from seed as sweep address", derived);
        derived
    } else {
        check_address(address, config.network)?
    };
    let script = address.script_pubkey();
    Ok((address, script))
}

/// Where the wallet's root key comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RootKeySource {
    /// A base58 `xprv`/`tprv` master key.
    Xpriv(String),
    /// A BIP39 mnemonic and its optional passphrase.
    Mnemonic { phrase: String, passphrase: String },
    /// Raw BIP32 seed bytes, hex encoded.
    SeedHex(String),
}

pub fn read_root_key(source: &RootKeySource, network: Network) -> RecoveryResult<ExtendedKey> {
    match source {
        RootKeySource::Xpriv(encoded) => {
            let xpriv = Xpriv::from_str(encoded.trim())
                .map_err(|e| RecoveryError::InvalidSeed(format!("invalid root key: {e}")))?;
            if xpriv.network != NetworkKind::from(network) {
                return Err(RecoveryError::InvalidSeed(format!(
                    "root key is not for network {network}"
                )));
            }
            if xpriv.depth != 0 {
                return Err(RecoveryError::InvalidSeed(
                    "root key must be a master key (depth 0)".into(),
                ));
            }
            Ok(ExtendedKey::from_xpriv(xpriv))
        }
        RootKeySource::Mnemonic { phrase, passphrase } => {
            let mnemonic = bip39::Mnemonic::parse_normalized(phrase.trim())
                .map_err(|e| RecoveryError::InvalidSeed(format!("invalid mnemonic: {e}")))?;
            ExtendedKey::new_master(network, &mnemonic.to_seed(passphrase))
        }
        RootKeySource::SeedHex(seed) => {
            let bytes = hex::decode(seed.trim())
                .map_err(|e| RecoveryError::InvalidSeed(format!("invalid seed hex: {e}")))?;
            if !(MIN_SEED_LEN..=MAX_SEED_LEN).contains(&bytes.len()) {
                return Err(RecoveryError::InvalidSeed(format!(
                    "seed must be between {MIN_SEED_LEN} and {MAX_SEED_LEN} bytes"
                )));
            }
            ExtendedKey::new_master(network, &bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIP84_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon \
         abandon abandon abandon abandon about";

    #[test]
    fn test_fromseed_is_bip84_first_address() {
        let secp = Secp256k1::new();
        let master = read_root_key(
            &RootKeySource::Mnemonic {
                phrase: BIP84_MNEMONIC.into(),
                passphrase: String::new(),
            },
            Network::Bitcoin,
        )
        .unwrap();
        let (address, script) = prepare_sweep_address(
            &secp,
            &master,
            ADDRESS_DERIVE_FROM_WALLET,
            &RecoveryConfig::default(),
        )
        .unwrap();
        assert_eq!(
            address.to_string(),
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu"
        );
        assert_eq!(script, address.script_pubkey());
    }

    #[test]
    fn test_check_address() {
        assert!(check_address(
            "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu",
            Network::Bitcoin
        )
        .is_ok());
        assert!(check_address(
            "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr",
            Network::Bitcoin
        )
        .is_ok());
        // wrong network
        assert!(matches!(
            check_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Testnet),
            Err(RecoveryError::InvalidAddress { .. })
        ));
        // P2PKH
        assert!(matches!(
            check_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2", Network::Bitcoin),
            Err(RecoveryError::InvalidAddress { .. })
        ));
        assert!(check_address("not an address", Network::Bitcoin).is_err());
    }

    #[test]
    fn test_read_root_key_sources() {
        let from_seed = read_root_key(
            &RootKeySource::SeedHex("000102030405060708090a0b0c0d0e0f".into()),
            Network::Bitcoin,
        )
        .unwrap();
        assert_eq!(
            from_seed.xpriv().to_string(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );

        let from_xpriv = read_root_key(
            &RootKeySource::Xpriv(from_seed.xpriv().to_string()),
            Network::Bitcoin,
        )
        .unwrap();
        assert_eq!(from_xpriv, from_seed);

        assert!(matches!(
            read_root_key(
                &RootKeySource::Xpriv(from_seed.xpriv().to_string()),
                Network::Testnet
            ),
            Err(RecoveryError::InvalidSeed(_))
        ));
        assert!(matches!(
            read_root_key(&RootKeySource::SeedHex("00".into()), Network::Bitcoin),
            Err(RecoveryError::InvalidSeed(_))
        ));
        assert!(matches!(
            read_root_key(
                &RootKeySource::Mnemonic {
                    phrase: "abandon abandon".into(),
                    passphrase: String::new()
                },
                Network::Bitcoin
            ),
            Err(RecoveryError::InvalidSeed(_))
        ));
    }
}
