//! Candidate outputs a counterparty's force close could have paid our payment base key to.

use std::fmt;
use std::str::FromStr;

use bitcoin::key::TweakedPublicKey;
use bitcoin::opcodes::all::{OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CSV, OP_DROP};
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, Secp256k1, Verification, XOnlyPublicKey};
use bitcoin::taproot::{
    ControlBlock, LeafVersion, TapNodeHash, TapTweakHash, TaprootBuilder, TaprootSpendInfo,
};
use bitcoin::{Address, Amount, CompressedPublicKey, Network, ScriptBuf, Sequence};

use crate::chain::Utxo;
use crate::crypto;
use crate::derivation::KeyLocator;
use crate::error::{RecoveryError, RecoveryResult};

/// lnd's provably unspendable internal key for taproot channel scripts.
pub const TAPROOT_NUMS_KEY: &str =
    "02dca094751109d0bd055d03565874e8276dd53e926b44e3bd1bb6bf4bc130a279";

/// Relative delay, in blocks, on every anchor and taproot `to_remote` output.
pub const TO_REMOTE_CSV_DELAY: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub locator: KeyLocator,
    pub public_key: PublicKey,
}

/// The settlement script an output was created with and the data needed to spend it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptFamily {
    /// P2WPKH, either of the key itself or of the key plus a per-commitment tweak.
    PlainKeyHash { single_tweak: Option<[u8; 32]> },
    /// P2WSH `to_remote` output of an anchor channel.
    AnchorScriptHash { witness_script: ScriptBuf },
    /// Settle leaf of a simple taproot channel's `to_remote` output.
    TaprootScriptPath {
        settle_script: ScriptBuf,
        control_block: ControlBlock,
        merkle_root: TapNodeHash,
        tap_tweak: TapTweakHash,
        output_key: TweakedPublicKey,
    },
}

impl ScriptFamily {
    /// Both channel script outputs are encumbered by a one block CSV.
    pub fn sequence(&self) -> Sequence {
        match self {
            ScriptFamily::PlainKeyHash { .. } => Sequence::MAX,
            ScriptFamily::AnchorScriptHash { .. } | ScriptFamily::TaprootScriptPath { .. } => {
                Sequence::from_consensus(TO_REMOTE_CSV_DELAY as u32)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScriptFamily::PlainKeyHash { single_tweak: None } => "p2wkh",
            ScriptFamily::PlainKeyHash { single_tweak: Some(_) } => "p2wkh-tweaked",
            ScriptFamily::AnchorScriptHash { .. } => "p2wsh-anchor",
            ScriptFamily::TaprootScriptPath { .. } => "p2tr-settle",
        }
    }
}

impl fmt::Display for ScriptFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAddress {
    pub address: Address,
    pub key: KeyDescriptor,
    pub family: ScriptFamily,
    pub utxos: Vec<Utxo>,
}

impl TargetAddress {
    pub fn total_value(&self) -> Amount {
        self.utxos.iter().map(|utxo| utxo.output.value).sum()
    }

    pub fn with_utxos(mut self, utxos: Vec<Utxo>) -> Self {
        self.utxos = utxos;
        self
    }
}

/// `<key> OP_CHECKSIGVERIFY 1 OP_CSV`
pub fn anchor_to_remote_script(key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_key(&bitcoin::PublicKey::new(*key))
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_int(TO_REMOTE_CSV_DELAY)
        .push_opcode(OP_CSV)
        .into_script()
}

/// `<xonly key> OP_CHECKSIG 1 OP_CSV OP_DROP`
pub fn taproot_settle_script(key: &PublicKey) -> ScriptBuf {
    let (x_only, _) = key.x_only_public_key();
    Builder::new()
        .push_x_only_key(&x_only)
        .push_opcode(OP_CHECKSIG)
        .push_int(TO_REMOTE_CSV_DELAY)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .into_script()
}

pub fn taproot_nums_key() -> RecoveryResult<XOnlyPublicKey> {
    let key = PublicKey::from_str(TAPROOT_NUMS_KEY)
        .map_err(|e| RecoveryError::Derivation(format!("invalid NUMS key: {e}")))?;
    Ok(key.x_only_public_key().0)
}

/// Single leaf tree committing to the settle script under the NUMS internal key.
pub fn taproot_settle_tree<C: Verification>(
    secp: &Secp256k1<C>,
    key: &PublicKey,
) -> RecoveryResult<(ScriptBuf, TaprootSpendInfo)> {
    let settle_script = taproot_settle_script(key);
    let spend_info = TaprootBuilder::new()
        .add_leaf(0, settle_script.clone())
        .map_err(|e| RecoveryError::Derivation(format!("could not build tap tree: {e}")))?
        .finalize(secp, taproot_nums_key()?)
        .map_err(|_| RecoveryError::Derivation("could not finalize tap tree".into()))?;
    Ok((settle_script, spend_info))
}

fn plain_key_hash_target(key: &KeyDescriptor, network: Network) -> TargetAddress {
    let compressed = CompressedPublicKey(key.public_key);
    TargetAddress {
        address: Address::p2wpkh(&compressed, network),
        key: *key,
        family: ScriptFamily::PlainKeyHash { single_tweak: None },
        utxos: Vec::new(),
    }
}

fn anchor_target(key: &KeyDescriptor, network: Network) -> TargetAddress {
    let witness_script = anchor_to_remote_script(&key.public_key);
    TargetAddress {
        address: Address::p2wsh(&witness_script, network),
        key: *key,
        family: ScriptFamily::AnchorScriptHash { witness_script },
        utxos: Vec::new(),
    }
}

fn taproot_target<C: Verification>(
    secp: &Secp256k1<C>,
    key: &KeyDescriptor,
    network: Network,
) -> RecoveryResult<TargetAddress> {
    let (settle_script, spend_info) = taproot_settle_tree(secp, &key.public_key)?;
    let control_block = spend_info
        .control_block(&(settle_script.clone(), LeafVersion::TapScript))
        .ok_or_else(|| RecoveryError::Derivation("settle leaf missing from tree".into()))?;
    let merkle_root = spend_info
        .merkle_root()
        .ok_or_else(|| RecoveryError::Derivation("tap tree has no merkle root".into()))?;
    let output_key = spend_info.output_key();

    Ok(TargetAddress {
        address: Address::p2tr_tweaked(output_key, network),
        key: *key,
        family: ScriptFamily::TaprootScriptPath {
            settle_script,
            control_block,
            merkle_root,
            tap_tweak: spend_info.tap_tweak(),
            output_key,
        },
        utxos: Vec::new(),
    })
}

/// Every output a remote close could have created for `key`, in the fixed order
/// plain key hash, anchor, taproot.
pub fn targets_for<C: Verification>(
    secp: &Secp256k1<C>,
    key: &KeyDescriptor,
    network: Network,
) -> RecoveryResult<Vec<TargetAddress>> {
    Ok(vec![
        plain_key_hash_target(key, network),
        anchor_target(key, network),
        taproot_target(secp, key, network)?,
    ])
}

/// The P2WPKH output of a pre static-remote-key channel, paying to `key + tweak·G`.
pub fn tweaked_key_hash_target<C: Verification>(
    secp: &Secp256k1<C>,
    key: &KeyDescriptor,
    single_tweak: [u8; 32],
    network: Network,
) -> RecoveryResult<TargetAddress> {
    let tweaked = crypto::tweak_pub_key(secp, &key.public_key, &single_tweak)?;
    Ok(TargetAddress {
        address: Address::p2wpkh(&CompressedPublicKey(tweaked), network),
        key: *key,
        family: ScriptFamily::PlainKeyHash {
            single_tweak: Some(single_tweak),
        },
        utxos: Vec::new(),
    })
}
