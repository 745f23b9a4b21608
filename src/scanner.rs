use bitcoin::secp256k1::{Secp256k1, Signing, Verification};
use tracing::{debug, info};

use crate::chain::ChainLookup;
use crate::config::RecoveryConfig;
use crate::derivation::{ExtendedKey, KeyLocator, KeyRing, KEY_FAMILY_PAYMENT_BASE};
use crate::error::RecoveryResult;
use crate::targets::{targets_for, KeyDescriptor, TargetAddress};

/// Checks every candidate address of the payment base keys `0..window` for unspent outputs.
///
/// All indices are always visited. Results are ordered by index, then by script family.
pub fn scan<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    master: &ExtendedKey,
    config: &RecoveryConfig,
    chain: &dyn ChainLookup,
    window: u32,
) -> RecoveryResult<Vec<TargetAddress>> {
    let ring = KeyRing::new(master, config.coin_type());
    let descriptors = payment_base_descriptors(secp, &ring, window)?;

    let mut found = Vec::new();
    for descriptor in &descriptors {
        let index = descriptor.locator.index;
        debug!("Scanning index {}", index);

        for target in targets_for(secp, descriptor, config.network)? {
            let utxos = chain.unspent_outputs(&target.address)?;
            if utxos.is_empty() {
                continue;
            }
            info!(
                "Found {} unspent outputs for {} address {} at index {}",
                utxos.len(),
                target.family,
                target.address,
                index
            );
            found.push(target.with_utxos(utxos));
        }
    }
    Ok(found)
}

/// Public halves of the payment base keys `0..window`. The private keys are dropped here, before
/// any chain lookup runs.
pub fn payment_base_descriptors<C: Signing>(
    secp: &Secp256k1<C>,
    ring: &KeyRing,
    window: u32,
) -> RecoveryResult<Vec<KeyDescriptor>> {
    Ok(ring
        .derive_range(secp, KEY_FAMILY_PAYMENT_BASE, window)?
        .into_iter()
        .zip(0u32..)
        .map(|(key, index)| KeyDescriptor {
            locator: KeyLocator::payment_base(index),
            public_key: key.public_key(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, Network, OutPoint, Txid};

    use super::*;
    use crate::chain::InMemoryChain;
    use crate::error::RecoveryError;
    use crate::targets::ScriptFamily;

    fn setup() -> (Secp256k1<bitcoin::secp256k1::All>, ExtendedKey, RecoveryConfig) {
        let master = ExtendedKey::new_master(Network::Regtest, &[0x5a; 32]).unwrap();
        (
            Secp256k1::new(),
            master,
            RecoveryConfig::for_network(Network::Regtest),
        )
    }

    #[test]
    fn test_descriptors_match_key_ring() {
        let (secp, master, config) = setup();
        let ring = KeyRing::new(&master, config.coin_type());
        let descriptors = payment_base_descriptors(&secp, &ring, 4).unwrap();
        assert_eq!(descriptors.len(), 4);
        for (index, descriptor) in (0u32..).zip(&descriptors) {
            let key = ring
                .derive_key(&secp, KeyLocator::payment_base(index))
                .unwrap();
            assert_eq!(descriptor.locator, KeyLocator::payment_base(index));
            assert_eq!(descriptor.public_key, key.public_key());
        }
    }

    #[test]
    fn test_scan_visits_whole_window() {
        let (secp, master, config) = setup();
        let chain = InMemoryChain::new();
        let found = scan(&secp, &master, &config, &chain, 4).unwrap();
        assert!(found.is_empty());
        assert_eq!(chain.unspent_lookups(), 4 * 3);
    }

    #[test]
    fn test_scan_orders_by_index_then_family() {
        let (secp, master, config) = setup();
        let ring = KeyRing::new(&master, config.coin_type());
        let mut chain = InMemoryChain::new();

        let mut fund = |index: u32, family: usize, vout: u32| {
            let key = ring
                .derive_key(&secp, KeyLocator::payment_base(index))
                .unwrap();
            let descriptor = KeyDescriptor {
                locator: KeyLocator::payment_base(index),
                public_key: key.public_key(),
            };
            let target = &targets_for(&secp, &descriptor, config.network).unwrap()[family];
            chain.fund(
                &target.address,
                OutPoint::new(Txid::all_zeros(), vout),
                Amount::from_sat(10_000),
            );
        };
        fund(2, 2, 0);
        fund(0, 1, 1);
        fund(2, 0, 2);

        let found = scan(&secp, &master, &config, &chain, 3).unwrap();
        let order: Vec<(u32, &str)> = found
            .iter()
            .map(|t| (t.key.locator.index, t.family.name()))
            .collect();
        assert_eq!(
            order,
            vec![(0, "p2wsh-anchor"), (2, "p2wkh"), (2, "p2tr-settle")]
        );
        assert!(matches!(
            found[0].family,
            ScriptFamily::AnchorScriptHash { .. }
        ));
    }

    #[test]
    fn test_lookup_errors_abort() {
        let (secp, master, config) = setup();
        let chain = InMemoryChain::failing();
        assert!(matches!(
            scan(&secp, &master, &config, &chain, 2),
            Err(RecoveryError::Lookup(_))
        ));
    }
}
