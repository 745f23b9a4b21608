//! Recovery of the very first lnd channel type, whose `to_remote` key was tweaked with the
//! counterparty's per-commitment point and therefore can't be found by scanning addresses.
//!
//! For every known close of such a channel we keep the outpoint, the address it paid to and
//! the commitment point. A [`DerivationCache`] with the payment base keys of the recovery
//! window is built once; each record is then matched by trying every cached key in ascending
//! index order until the tweaked key reproduces the close address.

use std::cell::Cell;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use bitcoin::bip32::Fingerprint;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::{Address, CompressedPublicKey, Network, OutPoint, ScriptBuf};
use serde::Deserialize;
use tracing::{debug, info};

use crate::chain::{ChainLookup, Utxo};
use crate::config::RecoveryConfig;
use crate::crypto::{self, TweakScheme};
use crate::derivation::{ExtendedKey, KeyLocator, KeyRing, KEY_FAMILY_PAYMENT_BASE};
use crate::error::{RecoveryError, RecoveryResult};
use crate::targets::{tweaked_key_hash_target, KeyDescriptor, TargetAddress};

const EMBEDDED_RECORDS: &str = include_str!("../data/ancient_channels.json");

#[derive(Debug, Deserialize)]
struct RawChannelRecord {
    close_outpoint: String,
    close_addr: String,
    commit_point: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AncientChannelRecord {
    pub close_outpoint: OutPoint,
    pub close_addr: Address,
    pub commit_point: PublicKey,
}

impl AncientChannelRecord {
    fn parse(raw: RawChannelRecord, network: Network) -> RecoveryResult<Self> {
        let close_outpoint = OutPoint::from_str(&raw.close_outpoint).map_err(|e| {
            RecoveryError::InvalidRecord(format!("outpoint {}: {e}", raw.close_outpoint))
        })?;
        let close_addr = Address::from_str(&raw.close_addr)
            .map_err(|e| RecoveryError::invalid_address(&raw.close_addr, e))?
            .require_network(network)
            .map_err(|e| RecoveryError::invalid_address(&raw.close_addr, e))?;
        let commit_point_bytes = hex::decode(&raw.commit_point).map_err(|e| {
            RecoveryError::InvalidRecord(format!("commit point {}: {e}", raw.commit_point))
        })?;
        let commit_point = PublicKey::from_slice(&commit_point_bytes).map_err(|e| {
            RecoveryError::InvalidRecord(format!("commit point {}: {e}", raw.commit_point))
        })?;
        Ok(Self {
            close_outpoint,
            close_addr,
            commit_point,
        })
    }
}

/// Where the list of known legacy channel closes comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordSource {
    /// The list compiled into the binary.
    Embedded,
    File(PathBuf),
    Json(String),
}

impl RecordSource {
    pub fn load(&self, network: Network) -> RecoveryResult<Vec<AncientChannelRecord>> {
        let raw = match self {
            RecordSource::Embedded => EMBEDDED_RECORDS.to_string(),
            RecordSource::File(path) => fs::read_to_string(path).map_err(|e| {
                RecoveryError::InvalidRecord(format!("could not read {}: {e}", path.display()))
            })?,
            RecordSource::Json(json) => json.clone(),
        };
        parse_records(&raw, network)
    }
}

pub fn parse_records(json: &str, network: Network) -> RecoveryResult<Vec<AncientChannelRecord>> {
    let raw: Vec<RawChannelRecord> =
        serde_json::from_str(json).map_err(|e| RecoveryError::InvalidRecord(e.to_string()))?;
    raw.into_iter()
        .map(|record| AncientChannelRecord::parse(record, network))
        .collect()
}

struct CacheEntry {
    index: u32,
    secret: SecretKey,
    public_key: PublicKey,
}

/// Payment base key pairs `0..window` of one master key.
///
/// Built once per matching session and read-only afterwards; its size never changes.
pub struct DerivationCache {
    fingerprint: Fingerprint,
    entries: Vec<CacheEntry>,
    probes: Cell<usize>,
}

impl DerivationCache {
    pub fn build<C: Signing>(
        secp: &Secp256k1<C>,
        master: &ExtendedKey,
        coin_type: u32,
        window: u32,
    ) -> RecoveryResult<Self> {
        let ring = KeyRing::new(master, coin_type);
        let entries = (0u32..)
            .zip(ring.derive_range(secp, KEY_FAMILY_PAYMENT_BASE, window)?)
            .map(|(index, key)| CacheEntry {
                index,
                secret: key.secret_key(),
                public_key: key.public_key(),
            })
            .collect();
        Ok(Self {
            fingerprint: master.xpriv().fingerprint(secp),
            entries,
            probes: Cell::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of cached keys tried so far.
    pub fn probes(&self) -> usize {
        self.probes.get()
    }

    pub fn is_for<C: Signing>(&self, secp: &Secp256k1<C>, master: &ExtendedKey) -> bool {
        master.xpriv().fingerprint(secp) == self.fingerprint
    }

    /// Finds the first index whose tweaked key pays to `address`.
    pub fn find<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        address: &Address,
        commit_point: &PublicKey,
        scheme: TweakScheme,
    ) -> RecoveryResult<(KeyDescriptor, [u8; 32])> {
        let target_script = address.script_pubkey();
        for entry in &self.entries {
            self.probes.set(self.probes.get() + 1);

            let tweak = scheme.tweak_bytes(&entry.secret, &entry.public_key, commit_point);
            let tweaked = crypto::tweak_pub_key(secp, &entry.public_key, &tweak)?;
            let candidate = ScriptBuf::new_p2wpkh(&CompressedPublicKey(tweaked).wpubkey_hash());
            if candidate == target_script {
                let descriptor = KeyDescriptor {
                    locator: KeyLocator::payment_base(entry.index),
                    public_key: entry.public_key,
                };
                return Ok((descriptor, tweak));
            }
        }
        Err(RecoveryError::AddressNotFound(address.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct LegacyMatches {
    pub targets: Vec<TargetAddress>,
    pub not_found: Vec<AncientChannelRecord>,
}

/// A matching session over one master key.
pub struct LegacyMatcher {
    cache: DerivationCache,
    scheme: TweakScheme,
    network: Network,
}

impl LegacyMatcher {
    pub fn new<C: Signing>(
        secp: &Secp256k1<C>,
        master: &ExtendedKey,
        config: &RecoveryConfig,
        window: u32,
        scheme: TweakScheme,
    ) -> RecoveryResult<Self> {
        Ok(Self {
            cache: DerivationCache::build(secp, master, config.coin_type(), window)?,
            scheme,
            network: config.network,
        })
    }

    pub fn cache(&self) -> &DerivationCache {
        &self.cache
    }

    /// Matches every record against the cache and fetches the close output of each match.
    ///
    /// Records without a match in the window are collected in
    /// [`LegacyMatches::not_found`]; every other failure aborts.
    pub fn match_records<C: Signing + Verification>(
        &self,
        secp: &Secp256k1<C>,
        master: &ExtendedKey,
        records: &[AncientChannelRecord],
        chain: &dyn ChainLookup,
    ) -> RecoveryResult<LegacyMatches> {
        if !self.cache.is_for(secp, master) {
            return Err(RecoveryError::Derivation(
                "derivation cache was built for a different master key".into(),
            ));
        }

        let mut matches = LegacyMatches::default();
        for record in records {
            let (descriptor, tweak) = match self.cache.find(
                secp,
                &record.close_addr,
                &record.commit_point,
                self.scheme,
            ) {
                Ok(found) => found,
                Err(RecoveryError::AddressNotFound(address)) => {
                    debug!("No key in window for legacy address {}", address);
                    matches.not_found.push(record.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            info!(
                "Found private key for address {} in list of ancient channels (index {})",
                record.close_addr, descriptor.locator.index
            );

            let outpoint = record.close_outpoint;
            let tx = chain.transaction(&outpoint.txid)?;
            let output = tx
                .outputs
                .get(outpoint.vout as usize)
                .cloned()
                .ok_or_else(|| {
                    RecoveryError::Lookup(format!(
                        "transaction {} has no output {}",
                        outpoint.txid, outpoint.vout
                    ))
                })?;
            if output.script_pubkey != record.close_addr.script_pubkey() {
                return Err(RecoveryError::InvalidRecord(format!(
                    "close output {} does not pay to {}",
                    outpoint, record.close_addr
                )));
            }

            let target = tweaked_key_hash_target(secp, &descriptor, tweak, self.network)?;
            matches.targets.push(target.with_utxos(vec![Utxo { outpoint, output }]));
        }
        Ok(matches)
    }
}

/// Builds a matching session for `window` keys and runs it over `records`.
pub fn match_records<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    master: &ExtendedKey,
    config: &RecoveryConfig,
    records: &[AncientChannelRecord],
    chain: &dyn ChainLookup,
    window: u32,
    scheme: TweakScheme,
) -> RecoveryResult<LegacyMatches> {
    LegacyMatcher::new(secp, master, config, window, scheme)?.match_records(
        secp, master, records, chain,
    )
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, TxOut, Txid};

    use super::*;
    use crate::chain::InMemoryChain;
    use crate::targets::ScriptFamily;

    fn master() -> ExtendedKey {
        ExtendedKey::new_master(Network::Regtest, &[0x33; 32]).unwrap()
    }

    fn record_for(
        secp: &Secp256k1<bitcoin::secp256k1::All>,
        master: &ExtendedKey,
        index: u32,
        scheme: TweakScheme,
        chain: &mut InMemoryChain,
    ) -> AncientChannelRecord {
        let ring = KeyRing::new(master, 1);
        let key = ring
            .derive_key(secp, KeyLocator::payment_base(index))
            .unwrap();
        let commit_point = SecretKey::from_slice(&[index as u8 + 1; 32])
            .unwrap()
            .public_key(secp);
        let tweak = scheme.tweak_bytes(&key.secret_key(), &key.public_key(), &commit_point);
        let tweaked = crypto::tweak_pub_key(secp, &key.public_key(), &tweak).unwrap();
        let close_addr = Address::p2wpkh(&CompressedPublicKey(tweaked), Network::Regtest);

        let txid = Txid::from_byte_array([index as u8; 32]);
        chain.add_transaction(
            txid,
            vec![
                TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey: bitcoin::ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::from_sat(90_000),
                    script_pubkey: close_addr.script_pubkey(),
                },
            ],
        );
        AncientChannelRecord {
            close_outpoint: OutPoint::new(txid, 1),
            close_addr,
            commit_point,
        }
    }

    #[test]
    fn test_match_inside_and_outside_window() {
        let secp = Secp256k1::new();
        let master = master();
        let config = RecoveryConfig::for_network(Network::Regtest);
        let mut chain = InMemoryChain::new();
        let record = record_for(&secp, &master, 6, TweakScheme::Bolt3, &mut chain);

        let found = match_records(
            &secp,
            &master,
            &config,
            std::slice::from_ref(&record),
            &chain,
            7,
            TweakScheme::Bolt3,
        )
        .unwrap();
        assert_eq!(found.targets.len(), 1);
        assert!(found.not_found.is_empty());
        let target = &found.targets[0];
        assert_eq!(target.key.locator.index, 6);
        assert_eq!(target.address, record.close_addr);
        assert_eq!(target.total_value(), Amount::from_sat(90_000));
        assert!(matches!(
            target.family,
            ScriptFamily::PlainKeyHash { single_tweak: Some(_) }
        ));

        let missed = match_records(
            &secp,
            &master,
            &config,
            std::slice::from_ref(&record),
            &chain,
            6,
            TweakScheme::Bolt3,
        )
        .unwrap();
        assert!(missed.targets.is_empty());
        assert_eq!(missed.not_found, vec![record]);
    }

    #[test]
    fn test_first_match_stops_search() {
        let secp = Secp256k1::new();
        let master = master();
        let config = RecoveryConfig::for_network(Network::Regtest);
        let mut chain = InMemoryChain::new();
        let record = record_for(&secp, &master, 3, TweakScheme::Ecdh, &mut chain);

        let matcher = LegacyMatcher::new(&secp, &master, &config, 20, TweakScheme::Ecdh).unwrap();
        assert_eq!(matcher.cache().len(), 20);
        let found = matcher
            .match_records(&secp, &master, &[record], &chain)
            .unwrap();
        assert_eq!(found.targets[0].key.locator.index, 3);
        assert_eq!(matcher.cache().probes(), 4);
        assert_eq!(chain.transaction_lookups(), 1);
    }

    #[test]
    fn test_cache_rejects_other_master() {
        let secp = Secp256k1::new();
        let config = RecoveryConfig::for_network(Network::Regtest);
        let matcher =
            LegacyMatcher::new(&secp, &master(), &config, 2, TweakScheme::Bolt3).unwrap();
        let other = ExtendedKey::new_master(Network::Regtest, &[0x44; 32]).unwrap();
        assert!(matches!(
            matcher.match_records(&secp, &other, &[], &InMemoryChain::new()),
            Err(RecoveryError::Derivation(_))
        ));
    }

    #[test]
    fn test_close_output_paying_elsewhere_is_rejected() {
        let secp = Secp256k1::new();
        let master = master();
        let config = RecoveryConfig::for_network(Network::Regtest);
        let mut chain = InMemoryChain::new();
        let mut record = record_for(&secp, &master, 2, TweakScheme::Bolt3, &mut chain);
        // output 0 of the close transaction has an empty script
        record.close_outpoint.vout = 0;

        let result = match_records(
            &secp,
            &master,
            &config,
            &[record],
            &chain,
            5,
            TweakScheme::Bolt3,
        );
        assert!(matches!(result, Err(RecoveryError::InvalidRecord(_))));
    }

    #[test]
    fn test_parse_records() {
        assert!(RecordSource::Embedded.load(Network::Bitcoin).is_ok());

        let secp = Secp256k1::new();
        let point = SecretKey::from_slice(&[0x09; 32]).unwrap().public_key(&secp);
        let address = Address::p2wpkh(&CompressedPublicKey(point), Network::Regtest);
        let json = format!(
            r#"[{{
                "close_outpoint": "{}:1",
                "close_addr": "{address}",
                "commit_point": "{point}"
            }}]"#,
            Txid::all_zeros()
        );
        let records = RecordSource::Json(json.clone())
            .load(Network::Regtest)
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].close_outpoint.vout, 1);
        assert_eq!(records[0].close_addr, address);
        assert_eq!(records[0].commit_point, point);

        assert!(matches!(
            RecordSource::Json(json).load(Network::Bitcoin),
            Err(RecoveryError::InvalidAddress { .. })
        ));
        assert!(matches!(
            parse_records(r#"[{"close_outpoint": "nope"}]"#, Network::Regtest),
            Err(RecoveryError::InvalidRecord(_))
        ));
    }
}
