//! Access to the blockchain through a block explorer.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use bitcoin::{Address, Amount, OutPoint, ScriptBuf, TxOut, Txid};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, error};

use crate::error::{RecoveryError, RecoveryResult};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub output: TxOut,
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TxInfo {
    pub outputs: Vec<TxOut>,
}

/// What the recovery needs from the chain. Lookup failures abort the recovery; an address
/// without unspent outputs is an empty result, not an error.
pub trait ChainLookup {
    fn unspent_outputs(&self, address: &Address) -> RecoveryResult<Vec<Utxo>>;

    fn transaction(&self, txid: &Txid) -> RecoveryResult<TxInfo>;

    /// Broadcasts a raw transaction and returns the explorer's receipt.
    fn publish(&self, raw_tx_hex: &str) -> RecoveryResult<String>;
}

#[derive(Debug, Deserialize)]
struct EsploraUtxo {
    txid: String,
    vout: u32,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraVout {
    scriptpubkey: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct EsploraTx {
    vout: Vec<EsploraVout>,
}

/// Blocking client for the Esplora REST API.
pub struct EsploraClient {
    http: Client,
    base_url: String,
}

impl std::fmt::Debug for EsploraClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsploraClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl EsploraClient {
    pub fn new(base_url: &str) -> RecoveryResult<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| RecoveryError::Lookup(format!("could not create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> RecoveryResult<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);
        let response = self.http.get(&url).send().map_err(|e| {
            error!("Request to {} failed: {}", url, e);
            RecoveryError::Lookup(e.to_string())
        })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().unwrap_or_default();
            return Err(RecoveryError::Lookup(format!("{url} returned {status}: {body}")));
        }
        response
            .json()
            .map_err(|e| RecoveryError::Lookup(format!("could not decode {url}: {e}")))
    }
}

fn parse_txid(txid: &str) -> RecoveryResult<Txid> {
    Txid::from_str(txid).map_err(|e| RecoveryError::Lookup(format!("invalid txid {txid}: {e}")))
}

impl ChainLookup for EsploraClient {
    fn unspent_outputs(&self, address: &Address) -> RecoveryResult<Vec<Utxo>> {
        let unspent: Vec<EsploraUtxo> = self.get_json(&format!("/address/{address}/utxo"))?;
        let script_pubkey = address.script_pubkey();
        unspent
            .into_iter()
            .map(|utxo| {
                Ok(Utxo {
                    outpoint: OutPoint::new(parse_txid(&utxo.txid)?, utxo.vout),
                    output: TxOut {
                        value: Amount::from_sat(utxo.value),
                        script_pubkey: script_pubkey.clone(),
                    },
                })
            })
            .collect()
    }

    fn transaction(&self, txid: &Txid) -> RecoveryResult<TxInfo> {
        let tx: EsploraTx = self.get_json(&format!("/tx/{txid}"))?;
        let outputs = tx
            .vout
            .into_iter()
            .map(|vout| {
                let script = hex::decode(&vout.scriptpubkey).map_err(|e| {
                    RecoveryError::Lookup(format!("could not decode script pubkey: {e}"))
                })?;
                Ok(TxOut {
                    value: Amount::from_sat(vout.value),
                    script_pubkey: ScriptBuf::from_bytes(script),
                })
            })
            .collect::<RecoveryResult<Vec<_>>>()?;
        Ok(TxInfo { outputs })
    }

    fn publish(&self, raw_tx_hex: &str) -> RecoveryResult<String> {
        let url = format!("{}/tx", self.base_url);
        let response = self
            .http
            .post(&url)
            .body(raw_tx_hex.to_string())
            .send()
            .map_err(|e| RecoveryError::Lookup(format!("could not publish transaction: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| RecoveryError::Lookup(format!("could not read publish response: {e}")))?;
        if !status.is_success() {
            return Err(RecoveryError::Lookup(format!("publish returned {status}: {body}")));
        }
        Ok(body)
    }
}

/// A chain held in memory, counting every lookup. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryChain {
    unspent: HashMap<String, Vec<Utxo>>,
    transactions: HashMap<Txid, TxInfo>,
    failing: bool,
    unspent_lookups: Cell<usize>,
    transaction_lookups: Cell<usize>,
    published: RefCell<Vec<String>>,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain on which every lookup fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn fund(&mut self, address: &Address, outpoint: OutPoint, value: Amount) {
        self.unspent.entry(address.to_string()).or_default().push(Utxo {
            outpoint,
            output: TxOut {
                value,
                script_pubkey: address.script_pubkey(),
            },
        });
    }

    pub fn add_transaction(&mut self, txid: Txid, outputs: Vec<TxOut>) {
        self.transactions.insert(txid, TxInfo { outputs });
    }

    pub fn unspent_lookups(&self) -> usize {
        self.unspent_lookups.get()
    }

    pub fn transaction_lookups(&self) -> usize {
        self.transaction_lookups.get()
    }

    pub fn published(&self) -> Vec<String> {
        self.published.borrow().clone()
    }

    fn check(&self) -> RecoveryResult<()> {
        if self.failing {
            return Err(RecoveryError::Lookup("chain unavailable".into()));
        }
        Ok(())
    }
}

impl ChainLookup for InMemoryChain {
    fn unspent_outputs(&self, address: &Address) -> RecoveryResult<Vec<Utxo>> {
        self.unspent_lookups.set(self.unspent_lookups.get() + 1);
        self.check()?;
        Ok(self
            .unspent
            .get(&address.to_string())
            .cloned()
            .unwrap_or_default())
    }

    fn transaction(&self, txid: &Txid) -> RecoveryResult<TxInfo> {
        self.transaction_lookups.set(self.transaction_lookups.get() + 1);
        self.check()?;
        self.transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| RecoveryError::Lookup(format!("transaction {txid} not found")))
    }

    fn publish(&self, raw_tx_hex: &str) -> RecoveryResult<String> {
        self.check()?;
        let tx: bitcoin::Transaction = bitcoin::consensus::encode::deserialize_hex(raw_tx_hex)
            .map_err(|e| RecoveryError::Lookup(format!("invalid transaction: {e}")))?;
        self.published.borrow_mut().push(raw_tx_hex.to_string());
        Ok(tx.compute_txid().to_string())
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{CompressedPublicKey, Network};

    use super::*;

    fn address() -> Address {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&[7u8; 32]).unwrap().public_key(&secp);
        Address::p2wpkh(&CompressedPublicKey(key), Network::Regtest)
    }

    #[test]
    fn test_in_memory_unspent() {
        let mut chain = InMemoryChain::new();
        let address = address();
        assert!(chain.unspent_outputs(&address).unwrap().is_empty());

        let outpoint = OutPoint::new(Txid::all_zeros(), 1);
        chain.fund(&address, outpoint, Amount::from_sat(1_000));
        let utxos = chain.unspent_outputs(&address).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].outpoint, outpoint);
        assert_eq!(utxos[0].output.script_pubkey, address.script_pubkey());
        assert_eq!(chain.unspent_lookups(), 2);
    }

    #[test]
    fn test_failing_chain() {
        let chain = InMemoryChain::failing();
        assert!(matches!(
            chain.unspent_outputs(&address()),
            Err(RecoveryError::Lookup(_))
        ));
        assert!(matches!(
            chain.transaction(&Txid::all_zeros()),
            Err(RecoveryError::Lookup(_))
        ));
    }

    #[test]
    fn test_esplora_payloads() {
        let utxos: Vec<EsploraUtxo> = serde_json::from_str(
            r#"[{"txid":"0000000000000000000000000000000000000000000000000000000000000001",
                "vout":2,"status":{"confirmed":true},"value":50000}]"#,
        )
        .unwrap();
        assert_eq!(utxos[0].vout, 2);
        assert_eq!(utxos[0].value, 50_000);

        let tx: EsploraTx = serde_json::from_str(
            r#"{"txid":"aa","vout":[{"scriptpubkey":"0014aabb","value":1}]}"#,
        )
        .unwrap();
        assert_eq!(tx.vout[0].scriptpubkey, "0014aabb");
    }
}
