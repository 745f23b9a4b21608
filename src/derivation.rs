//! Hierarchical key derivation that reproduces lnd's key tree bit-for-bit.
//!
//! lnd's wallet derives children with the "non-standard" BIP32 variant in which a private key
//! with leading zero bytes is fed into the hardened-child HMAC without its zero padding. The
//! wallet's key manager additionally stores the coin type and account keys as serialized
//! extended keys, which restores the padding at exactly those two levels. [`ExtendedKey`] keeps
//! track of whether its private key is currently padded so both effects are replicated.

use std::str::FromStr;

use bitcoin::bip32::{self, ChainCode, ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::hashes::{sha512, Hash, HashEngine, Hmac, HmacEngine};
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey, Signing};
use bitcoin::{Address, CompressedPublicKey, Network, PrivateKey};

use crate::error::{RecoveryError, RecoveryResult};

pub const HARDENED_KEY_START: u32 = 0x8000_0000;
pub const BIP0043_PURPOSE: u32 = 1017;
pub const MAX_KEY_RANGE_SCAN: u32 = 100_000;

pub const KEY_FAMILY_PAYMENT_BASE: u32 = 3;
pub const KEY_FAMILY_NODE_KEY: u32 = 6;

pub const BIP0084_PURPOSE: u32 = 84;

/// An extended private key plus the padding state lnd's derivation depends on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtendedKey {
    xpriv: Xpriv,
    padded: bool,
}

impl ExtendedKey {
    pub fn new_master(network: Network, seed: &[u8]) -> RecoveryResult<Self> {
        let xpriv = Xpriv::new_master(network, seed)
            .map_err(|e| RecoveryError::Derivation(format!("invalid master seed: {e}")))?;
        Ok(Self::from_xpriv(xpriv))
    }

    /// Keys decoded from their string form always carry all 32 bytes.
    pub fn from_xpriv(xpriv: Xpriv) -> Self {
        Self {
            xpriv,
            padded: true,
        }
    }

    pub fn xpriv(&self) -> &Xpriv {
        &self.xpriv
    }

    pub fn depth(&self) -> u8 {
        self.xpriv.depth
    }

    pub fn private_key(&self) -> SecretKey {
        self.xpriv.private_key
    }

    pub fn public_key<C: Signing>(&self, secp: &Secp256k1<C>) -> PublicKey {
        PublicKey::from_secret_key(secp, &self.xpriv.private_key)
    }

    /// The private key bytes exactly as the wallet holds them in memory.
    fn stored_key_bytes(&self) -> Vec<u8> {
        let bytes = self.xpriv.private_key.secret_bytes();
        if self.padded {
            return bytes.to_vec();
        }
        let first_non_zero = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        bytes[first_non_zero..].to_vec()
    }

    /// Single child derivation without leading-zero padding of the parent key.
    pub fn derive_child<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        child: ChildNumber,
    ) -> RecoveryResult<Self> {
        let mut engine: HmacEngine<sha512::Hash> = HmacEngine::new(self.xpriv.chain_code.as_bytes());
        if child.is_hardened() {
            engine.input(&[0u8]);
            engine.input(&self.stored_key_bytes());
        } else {
            engine.input(&self.public_key(secp).serialize());
        }
        engine.input(&u32::from(child).to_be_bytes());
        let hmac_result: Hmac<sha512::Hash> = Hmac::from_engine(engine);

        let il: [u8; 32] = hmac_result[..32]
            .try_into()
            .map_err(|_| RecoveryError::Derivation("short hmac output".into()))?;
        let ir: [u8; 32] = hmac_result[32..]
            .try_into()
            .map_err(|_| RecoveryError::Derivation("short hmac output".into()))?;

        let tweak = Scalar::from_be_bytes(il).map_err(|_| {
            RecoveryError::Derivation(format!("child {child} has an out of range tweak"))
        })?;
        let private_key = self
            .xpriv
            .private_key
            .add_tweak(&tweak)
            .map_err(|_| RecoveryError::Derivation(format!("child {child} is the zero key")))?;
        let depth = self
            .xpriv
            .depth
            .checked_add(1)
            .ok_or_else(|| RecoveryError::Derivation("maximum depth exceeded".into()))?;

        Ok(Self {
            xpriv: Xpriv {
                network: self.xpriv.network,
                depth,
                parent_fingerprint: self.xpriv.fingerprint(secp),
                child_number: child,
                private_key,
                chain_code: ChainCode::from(ir),
            },
            padded: false,
        })
    }

    /// Round-trips the key through its base58 form, as lnd's key manager does.
    fn reserialize(&self) -> RecoveryResult<Self> {
        let encoded = self.xpriv.to_string();
        let xpriv = Xpriv::from_str(&encoded)
            .map_err(|e| RecoveryError::Derivation(format!("could not decode {encoded}: {e}")))?;
        Ok(Self::from_xpriv(xpriv))
    }

    /// Derives along `path` with lnd's depth 2/3 re-serialization.
    ///
    /// The coin type key (depth 2) is re-serialized unless the account that follows it is the
    /// default account 0, and the account key (depth 3) is re-serialized unless it is account 0
    /// itself.
    pub fn derive_children<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        path: &[ChildNumber],
    ) -> RecoveryResult<Self> {
        let mut current = self.clone();
        for (idx, part) in path.iter().enumerate() {
            let derived = current.derive_child(secp, *part)?;

            let depth = derived.depth();
            let key_id = u32::from(*part).wrapping_sub(HARDENED_KEY_START);
            let next_id = match (depth, path.get(idx + 1)) {
                (2, Some(next)) if path.len() > 2 => {
                    u32::from(*next).wrapping_sub(HARDENED_KEY_START)
                }
                _ => 0,
            };

            current = if (depth == 2 && next_id != 0) || (depth == 3 && key_id != 0) {
                derived.reserialize()?
            } else {
                derived
            };
        }
        Ok(current)
    }
}

/// A key pair reconstructed from the master key for one path.
#[derive(Clone, Debug)]
pub struct DerivedKey {
    path: DerivationPath,
    key: ExtendedKey,
    public_key: PublicKey,
}

impl DerivedKey {
    pub fn path(&self) -> &DerivationPath {
        &self.path
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_key(&self) -> SecretKey {
        self.key.private_key()
    }

    pub fn extended_key(&self) -> &ExtendedKey {
        &self.key
    }

    /// Human readable summary of the key. Private parts are left out when `neuter` is set.
    pub fn report<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        network: Network,
        neuter: bool,
    ) -> KeyReport {
        let compressed = CompressedPublicKey(self.public_key);
        let (private_key_wif, xpriv) = if neuter {
            (None, None)
        } else {
            (
                Some(PrivateKey::new(self.secret_key(), network).to_wif()),
                Some(self.key.xpriv().to_string()),
            )
        };
        KeyReport {
            path: self.path.to_string(),
            network,
            public_key: hex::encode(self.public_key.serialize()),
            xpub: Xpub::from_priv(secp, self.key.xpriv()).to_string(),
            address: Address::p2wpkh(&compressed, network).to_string(),
            legacy_address: Address::p2pkh(compressed.pubkey_hash(), network).to_string(),
            private_key_wif,
            xpriv,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyReport {
    pub path: String,
    pub network: Network,
    pub public_key: String,
    pub xpub: String,
    pub address: String,
    pub legacy_address: String,
    pub private_key_wif: Option<String>,
    pub xpriv: Option<String>,
}

/// Parses `m/i'/j/...`. Both `'` and `h` mark hardened segments.
pub fn parse_path(path: &str) -> RecoveryResult<DerivationPath> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(RecoveryError::invalid_path(path, "path cannot be empty"));
    }
    if !trimmed.starts_with("m/") {
        return Err(RecoveryError::invalid_path(path, "path must start with m/"));
    }
    let parsed =
        DerivationPath::from_str(trimmed).map_err(|e| RecoveryError::invalid_path(path, e))?;
    if parsed.as_ref().is_empty() {
        return Err(RecoveryError::invalid_path(path, "path has no segments"));
    }
    Ok(parsed)
}

pub fn derive<C: Signing>(
    secp: &Secp256k1<C>,
    master: &ExtendedKey,
    path: &str,
) -> RecoveryResult<DerivedKey> {
    let path = parse_path(path)?;
    derive_path(secp, master, &path)
}

pub fn derive_path<C: Signing>(
    secp: &Secp256k1<C>,
    master: &ExtendedKey,
    path: &DerivationPath,
) -> RecoveryResult<DerivedKey> {
    let key = master.derive_children(secp, path.as_ref())?;
    Ok(DerivedKey {
        path: path.clone(),
        public_key: key.public_key(secp),
        key,
    })
}

fn hardened(index: u32) -> RecoveryResult<ChildNumber> {
    ChildNumber::from_hardened_idx(index).map_err(|e: bip32::Error| {
        RecoveryError::Derivation(format!("invalid hardened index {index}: {e}"))
    })
}

fn normal(index: u32) -> RecoveryResult<ChildNumber> {
    ChildNumber::from_normal_idx(index).map_err(|e: bip32::Error| {
        RecoveryError::Derivation(format!("invalid index {index}: {e}"))
    })
}

/// `m/1017'/coin'/family'/0`
pub fn lnd_branch_path(coin_type: u32, family: u32) -> RecoveryResult<DerivationPath> {
    Ok(DerivationPath::from(vec![
        hardened(BIP0043_PURPOSE)?,
        hardened(coin_type)?,
        hardened(family)?,
        normal(0)?,
    ]))
}

/// `m/1017'/coin'/family'/0/index`
pub fn lnd_key_path(coin_type: u32, family: u32, index: u32) -> RecoveryResult<DerivationPath> {
    Ok(lnd_branch_path(coin_type, family)?.child(normal(index)?))
}

pub fn identity_path(coin_type: u32) -> RecoveryResult<DerivationPath> {
    lnd_key_path(coin_type, KEY_FAMILY_NODE_KEY, 0)
}

/// `m/84'/coin'/0'/0/index`, the external chain of the on-chain wallet.
pub fn wallet_receive_path(coin_type: u32, index: u32) -> RecoveryResult<DerivationPath> {
    Ok(DerivationPath::from(vec![
        hardened(BIP0084_PURPOSE)?,
        hardened(coin_type)?,
        hardened(0)?,
        normal(0)?,
        normal(index)?,
    ]))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyLocator {
    pub family: u32,
    pub index: u32,
}

impl KeyLocator {
    pub fn payment_base(index: u32) -> Self {
        Self {
            family: KEY_FAMILY_PAYMENT_BASE,
            index,
        }
    }
}

/// Derives lnd keys by key locator.
pub struct KeyRing<'a> {
    master: &'a ExtendedKey,
    coin_type: u32,
}

impl<'a> KeyRing<'a> {
    pub fn new(master: &'a ExtendedKey, coin_type: u32) -> Self {
        Self { master, coin_type }
    }

    pub fn coin_type(&self) -> u32 {
        self.coin_type
    }

    /// The `m/1017'/coin'/family'/0` key; children of it are plain BIP32.
    pub fn family_branch<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        family: u32,
    ) -> RecoveryResult<ExtendedKey> {
        let path = lnd_branch_path(self.coin_type, family)?;
        self.master.derive_children(secp, path.as_ref())
    }

    pub fn derive_key<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        locator: KeyLocator,
    ) -> RecoveryResult<DerivedKey> {
        let path = lnd_key_path(self.coin_type, locator.family, locator.index)?;
        derive_path(secp, self.master, &path)
    }

    /// Derives the keys `0..count` of one family, deriving the shared branch only once.
    pub fn derive_range<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        family: u32,
        count: u32,
    ) -> RecoveryResult<Vec<DerivedKey>> {
        let branch_path = lnd_branch_path(self.coin_type, family)?;
        let branch = self.master.derive_children(secp, branch_path.as_ref())?;
        (0..count)
            .map(|index| {
                let child = normal(index)?;
                let key = branch.derive_children(secp, &[child])?;
                Ok(DerivedKey {
                    path: branch_path.child(child),
                    public_key: key.public_key(secp),
                    key,
                })
            })
            .collect()
    }

    /// Scans the same key range lnd does on channel restore and returns the index of
    /// `public_key` in `family`, if it is derivable at all.
    pub fn check_descriptor<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        family: u32,
        public_key: &PublicKey,
    ) -> RecoveryResult<Option<u32>> {
        let branch = self.family_branch(secp, family)?;
        for index in 0..MAX_KEY_RANGE_SCAN {
            let child = branch.derive_child(secp, normal(index)?)?;
            if child.public_key(secp) == *public_key {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}
