//! Per-input witness construction for the sweep transaction.
//!
//! Keys are re-derived from the master key for every input and dropped as soon as the
//! witness is built.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Keypair, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{LeafVersion, TapLeafHash};
use bitcoin::{CompressedPublicKey, ScriptBuf, Transaction, TxOut, Witness};
use tracing::debug;

use crate::crypto;
use crate::derivation::{ExtendedKey, KeyRing};
use crate::error::{RecoveryError, RecoveryResult};
use crate::targets::{KeyDescriptor, ScriptFamily};

/// Signs sweep inputs with keys of one lnd wallet.
pub struct InputSigner<'a> {
    ring: KeyRing<'a>,
    secp: &'a Secp256k1<All>,
}

impl<'a> InputSigner<'a> {
    pub fn new(secp: &'a Secp256k1<All>, master: &'a ExtendedKey, coin_type: u32) -> Self {
        Self {
            ring: KeyRing::new(master, coin_type),
            secp,
        }
    }

    fn private_key(&self, input: usize, key: &KeyDescriptor) -> RecoveryResult<SecretKey> {
        let derived = self
            .ring
            .derive_key(self.secp, key.locator)
            .map_err(|e| RecoveryError::signing(input, e))?;
        if derived.public_key() != key.public_key {
            return Err(RecoveryError::signing(
                input,
                format!(
                    "derived key {} of family {} index {} does not match {}",
                    derived.public_key(),
                    key.locator.family,
                    key.locator.index,
                    key.public_key
                ),
            ));
        }
        Ok(derived.secret_key())
    }

    /// Builds the witness of input `input`. `prevouts` holds the spent output of every input,
    /// so all of them are committed to before the first signature.
    pub fn sign_input(
        &self,
        sighash_cache: &mut SighashCache<&Transaction>,
        prevouts: &[TxOut],
        input: usize,
        key: &KeyDescriptor,
        family: &ScriptFamily,
    ) -> RecoveryResult<Witness> {
        let prevout = prevouts
            .get(input)
            .ok_or_else(|| RecoveryError::signing(input, "missing previous output"))?;
        debug!("Signing input {} ({})", input, family);

        match family {
            ScriptFamily::TaprootScriptPath {
                settle_script,
                control_block,
                output_key,
                ..
            } => {
                if prevout.script_pubkey != ScriptBuf::new_p2tr_tweaked(*output_key) {
                    return Err(RecoveryError::signing(input, "output key does not match tree"));
                }
                if !control_block.verify_taproot_commitment(
                    self.secp,
                    output_key.to_inner(),
                    settle_script,
                ) {
                    return Err(RecoveryError::signing(input, "invalid control block"));
                }
                let secret = self.private_key(input, key)?;
                self.sign_taproot_settle(
                    sighash_cache,
                    prevouts,
                    input,
                    &secret,
                    settle_script,
                    control_block.serialize(),
                )
            }
            ScriptFamily::AnchorScriptHash { witness_script } => {
                if prevout.script_pubkey != ScriptBuf::new_p2wsh(&witness_script.wscript_hash()) {
                    return Err(RecoveryError::signing(
                        input,
                        "witness script does not match output",
                    ));
                }
                let secret = self.private_key(input, key)?;
                self.sign_anchor_to_remote(sighash_cache, prevout, input, &secret, witness_script)
            }
            ScriptFamily::PlainKeyHash { single_tweak } => {
                let mut secret = self.private_key(input, key)?;
                if let Some(tweak) = single_tweak {
                    secret = crypto::tweak_priv_key(&secret, tweak)
                        .map_err(|e| RecoveryError::signing(input, e))?;
                }
                self.sign_key_hash(sighash_cache, prevout, input, &secret)
            }
        }
    }

    fn ecdsa_signature(
        &self,
        input: usize,
        sighash: [u8; 32],
        secret: &SecretKey,
    ) -> RecoveryResult<Vec<u8>> {
        let msg = Message::from_digest(sighash);
        let signature = self.secp.sign_ecdsa_low_r(&msg, secret);
        self.secp
            .verify_ecdsa(&msg, &signature, &secret.public_key(self.secp))
            .map_err(|e| RecoveryError::signing(input, e))?;
        let mut sig = signature.serialize_der().to_vec();
        sig.push(EcdsaSighashType::All as u8);
        Ok(sig)
    }

    /// The output's own script is the script code of a P2WPKH spend.
    fn sign_key_hash(
        &self,
        sighash_cache: &mut SighashCache<&Transaction>,
        prevout: &TxOut,
        input: usize,
        secret: &SecretKey,
    ) -> RecoveryResult<Witness> {
        let public_key = secret.public_key(self.secp);
        let expected = ScriptBuf::new_p2wpkh(&CompressedPublicKey(public_key).wpubkey_hash());
        if prevout.script_pubkey != expected {
            return Err(RecoveryError::signing(input, "key does not control output"));
        }

        let sighash = sighash_cache
            .p2wpkh_signature_hash(
                input,
                &prevout.script_pubkey,
                prevout.value,
                EcdsaSighashType::All,
            )
            .map_err(|e| RecoveryError::signing(input, e))?;
        let sig = self.ecdsa_signature(input, sighash.to_byte_array(), secret)?;
        Ok(Witness::from_slice(&[sig, public_key.serialize().to_vec()]))
    }

    fn sign_anchor_to_remote(
        &self,
        sighash_cache: &mut SighashCache<&Transaction>,
        prevout: &TxOut,
        input: usize,
        secret: &SecretKey,
        witness_script: &ScriptBuf,
    ) -> RecoveryResult<Witness> {
        let sighash = sighash_cache
            .p2wsh_signature_hash(input, witness_script, prevout.value, EcdsaSighashType::All)
            .map_err(|e| RecoveryError::signing(input, e))?;
        let sig = self.ecdsa_signature(input, sighash.to_byte_array(), secret)?;
        Ok(Witness::from_slice(&[sig, witness_script.to_bytes()]))
    }

    fn sign_taproot_settle(
        &self,
        sighash_cache: &mut SighashCache<&Transaction>,
        prevouts: &[TxOut],
        input: usize,
        secret: &SecretKey,
        settle_script: &ScriptBuf,
        control_block: Vec<u8>,
    ) -> RecoveryResult<Witness> {
        let leaf_hash = TapLeafHash::from_script(settle_script, LeafVersion::TapScript);
        let sighash = sighash_cache
            .taproot_script_spend_signature_hash(
                input,
                &Prevouts::All(prevouts),
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(|e| RecoveryError::signing(input, e))?;

        let keypair = Keypair::from_secret_key(self.secp, secret);
        let msg = Message::from_digest(sighash.to_byte_array());
        let signature = self.secp.sign_schnorr_no_aux_rand(&msg, &keypair);
        self.secp
            .verify_schnorr(&signature, &msg, &keypair.x_only_public_key().0)
            .map_err(|e| RecoveryError::signing(input, e))?;

        // default sighash signatures carry no sighash byte
        Ok(Witness::from_slice(&[
            signature.serialize().to_vec(),
            settle_script.to_bytes(),
            control_block,
        ]))
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, Network, OutPoint, Sequence, TxIn, Txid};

    use super::*;
    use crate::derivation::KeyLocator;
    use crate::targets::{targets_for, tweaked_key_hash_target};

    struct Fixture {
        secp: Secp256k1<All>,
        master: ExtendedKey,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                secp: Secp256k1::new(),
                master: ExtendedKey::new_master(Network::Regtest, &[0x21; 32]).unwrap(),
            }
        }

        fn descriptor(&self, index: u32) -> KeyDescriptor {
            let key = KeyRing::new(&self.master, 1)
                .derive_key(&self.secp, KeyLocator::payment_base(index))
                .unwrap();
            KeyDescriptor {
                locator: KeyLocator::payment_base(index),
                public_key: key.public_key(),
            }
        }
    }

    fn spend(prevout: &TxOut, sequence: Sequence) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                sequence,
                ..Default::default()
            }],
            output: vec![TxOut {
                value: prevout.value - Amount::from_sat(500),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn sign(
        fixture: &Fixture,
        key: &KeyDescriptor,
        family: &ScriptFamily,
        prevout: TxOut,
    ) -> RecoveryResult<Witness> {
        let tx = spend(&prevout, family.sequence());
        let signer = InputSigner::new(&fixture.secp, &fixture.master, 1);
        let mut cache = SighashCache::new(&tx);
        signer.sign_input(&mut cache, &[prevout], 0, key, family)
    }

    #[test]
    fn test_witness_shapes() {
        let fixture = Fixture::new();
        let key = fixture.descriptor(0);
        let targets = targets_for(&fixture.secp, &key, Network::Regtest).unwrap();
        let mut sizes = Vec::new();
        for target in &targets {
            let prevout = TxOut {
                value: Amount::from_sat(20_000),
                script_pubkey: target.address.script_pubkey(),
            };
            let witness = sign(&fixture, &key, &target.family, prevout).unwrap();
            sizes.push(witness.iter().map(|item| item.len()).collect::<Vec<_>>());
        }
        assert_eq!(sizes[0].len(), 2);
        assert_eq!(sizes[0][1], 33);
        assert_eq!(sizes[1].len(), 2);
        assert_eq!(sizes[1][1], 37);
        assert_eq!(sizes[2], vec![64, 36, 33]);
    }

    #[test]
    fn test_tweaked_key_hash() {
        let fixture = Fixture::new();
        let key = fixture.descriptor(1);
        let target =
            tweaked_key_hash_target(&fixture.secp, &key, [0x05; 32], Network::Regtest).unwrap();
        let prevout = TxOut {
            value: Amount::from_sat(20_000),
            script_pubkey: target.address.script_pubkey(),
        };
        let witness = sign(&fixture, &key, &target.family, prevout).unwrap();
        let expected = crypto::tweak_pub_key(&fixture.secp, &key.public_key, &[0x05; 32]).unwrap();
        assert_eq!(witness.nth(1), Some(&expected.serialize()[..]));
    }

    #[test]
    fn test_rejects_foreign_output() {
        let fixture = Fixture::new();
        let key = fixture.descriptor(2);
        let other = fixture.descriptor(3);
        let targets = targets_for(&fixture.secp, &other, Network::Regtest).unwrap();
        let prevout = TxOut {
            value: Amount::from_sat(20_000),
            script_pubkey: targets[0].address.script_pubkey(),
        };
        assert!(matches!(
            sign(&fixture, &key, &ScriptFamily::PlainKeyHash { single_tweak: None }, prevout),
            Err(RecoveryError::Signing { input: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_descriptor_key() {
        let fixture = Fixture::new();
        let mut key = fixture.descriptor(4);
        key.public_key = fixture.descriptor(5).public_key;
        let targets = targets_for(&fixture.secp, &key, Network::Regtest).unwrap();
        let prevout = TxOut {
            value: Amount::from_sat(20_000),
            script_pubkey: targets[1].address.script_pubkey(),
        };
        assert!(matches!(
            sign(&fixture, &key, &targets[1].family, prevout),
            Err(RecoveryError::Signing { .. })
        ));
    }
}
