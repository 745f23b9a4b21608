//! Assembly, fee sizing and signing of the single transaction that sweeps every found output.

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::{self, VarInt};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{Amount, ScriptBuf, Transaction, TxIn, TxOut, Txid, Witness};
use tracing::{info, warn};

use crate::ancient::{AncientChannelRecord, LegacyMatcher, RecordSource};
use crate::chain::{ChainLookup, Utxo};
use crate::config::RecoveryConfig;
use crate::crypto::TweakScheme;
use crate::derivation::ExtendedKey;
use crate::error::{RecoveryError, RecoveryResult};
use crate::scanner::scan;
use crate::signer::InputSigner;
use crate::targets::{KeyDescriptor, ScriptFamily, TargetAddress};
use crate::wallet::prepare_sweep_address;

/// Version and lock time.
pub const BASE_TX_SIZE: u64 = 8;
/// Outpoint, empty script sig and sequence.
pub const INPUT_SIZE: u64 = 32 + 4 + 1 + 4;
/// Marker and flag.
pub const WITNESS_HEADER_SIZE: u64 = 2;
pub const P2WKH_OUTPUT_SIZE: u64 = 8 + 1 + 22;

/// Item count, signature with sighash byte, compressed key.
pub const P2WKH_WITNESS_SIZE: u64 = 1 + 1 + 73 + 1 + 33;
pub const TO_REMOTE_CONFIRMED_SCRIPT_SIZE: u64 = 1 + 33 + 1 + 1 + 1;
/// Item count, signature, witness script.
pub const TO_REMOTE_CONFIRMED_WITNESS_SIZE: u64 =
    1 + 1 + 73 + 1 + TO_REMOTE_CONFIRMED_SCRIPT_SIZE;
/// Item count, schnorr signature, settle script, control block.
pub const TAPROOT_TO_REMOTE_WITNESS_SIZE: u64 = 1 + 1 + 64 + 1 + 36 + 1 + 33;

/// Upper bound of the witness of an input of `family`.
pub fn witness_size(family: &ScriptFamily) -> u64 {
    match family {
        ScriptFamily::PlainKeyHash { .. } => P2WKH_WITNESS_SIZE,
        ScriptFamily::AnchorScriptHash { .. } => TO_REMOTE_CONFIRMED_WITNESS_SIZE,
        ScriptFamily::TaprootScriptPath { .. } => TAPROOT_TO_REMOTE_WITNESS_SIZE,
    }
}

/// Accumulates the worst case weight of a transaction while it is being assembled.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WeightEstimator {
    input_count: u64,
    output_count: u64,
    input_size: u64,
    input_witness_size: u64,
    output_size: u64,
}

impl WeightEstimator {
    pub fn add_witness_input(&mut self, witness_size: u64) {
        self.input_size += INPUT_SIZE;
        self.input_witness_size += witness_size;
        self.input_count += 1;
    }

    pub fn add_p2wkh_input(&mut self) {
        self.add_witness_input(P2WKH_WITNESS_SIZE);
    }

    pub fn add_p2wkh_output(&mut self) {
        self.output_size += P2WKH_OUTPUT_SIZE;
        self.output_count += 1;
    }

    pub fn add_output(&mut self, script_pubkey: &ScriptBuf) {
        let len = script_pubkey.len() as u64;
        self.output_size += 8 + VarInt(len).size() as u64 + len;
        self.output_count += 1;
    }

    pub fn weight(&self) -> u64 {
        let stripped = BASE_TX_SIZE
            + VarInt(self.input_count).size() as u64
            + self.input_size
            + VarInt(self.output_count).size() as u64
            + self.output_size;
        let mut weight = stripped * 4;
        if self.input_witness_size > 0 {
            weight += WITNESS_HEADER_SIZE + self.input_witness_size;
        }
        weight
    }
}

/// Fee for `weight` weight units at `fee_rate_sat_vb`, rounded down like lnd's
/// sat/kw conversion.
pub fn fee_for_weight(fee_rate_sat_vb: u64, weight: u64) -> Amount {
    let sat_per_kw = fee_rate_sat_vb.saturating_mul(1000) / 4;
    Amount::from_sat(sat_per_kw.saturating_mul(weight) / 1000)
}

#[derive(Clone, Debug)]
struct SweepInput {
    utxo: Utxo,
    key: KeyDescriptor,
    family: ScriptFamily,
}

/// An unsigned sweep paying everything, minus the fee, to a single output.
#[derive(Clone, Debug)]
pub struct SweepTransaction {
    inputs: Vec<SweepInput>,
    target_count: usize,
    destination: ScriptBuf,
    fee_rate_sat_vb: u64,
    estimator: WeightEstimator,
}

impl SweepTransaction {
    pub fn new(destination: ScriptBuf, fee_rate_sat_vb: u64) -> Self {
        let mut estimator = WeightEstimator::default();
        estimator.add_output(&destination);
        Self {
            inputs: Vec::new(),
            target_count: 0,
            destination,
            fee_rate_sat_vb,
            estimator,
        }
    }

    /// Adds one input per UTXO of `target`.
    pub fn add_target(&mut self, target: &TargetAddress) {
        self.target_count += 1;
        for utxo in &target.utxos {
            self.estimator.add_witness_input(witness_size(&target.family));
            self.inputs.push(SweepInput {
                utxo: utxo.clone(),
                key: target.key,
                family: target.family.clone(),
            });
        }
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn total_value(&self) -> Amount {
        self.inputs.iter().map(|input| input.utxo.output.value).sum()
    }

    pub fn weight(&self) -> u64 {
        self.estimator.weight()
    }

    pub fn fee(&self) -> Amount {
        fee_for_weight(self.fee_rate_sat_vb, self.weight())
    }

    /// Value of the single output, or `InsufficientFunds` when nothing above the dust limit
    /// would be left.
    pub fn output_value(&self, dust_limit: Amount) -> RecoveryResult<Amount> {
        let total = self.total_value();
        let fee = self.fee();
        match total.checked_sub(fee) {
            Some(value) if self.target_count > 0 && value >= dust_limit => Ok(value),
            _ => Err(RecoveryError::InsufficientFunds {
                targets: self.target_count,
                total_sat: total.to_sat(),
                fee_sat: fee.to_sat(),
                dust_limit_sat: dust_limit.to_sat(),
            }),
        }
    }

    fn unsigned(&self, output_value: Amount) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.utxo.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: input.family.sequence(),
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: output_value,
                script_pubkey: self.destination.clone(),
            }],
        }
    }

    /// Signs every input. Any failure discards the whole transaction.
    pub fn sign(&self, signer: &InputSigner, dust_limit: Amount) -> RecoveryResult<SignedSweep> {
        let output_value = self.output_value(dust_limit)?;
        let fee = self.fee();
        info!(
            "Fee {} sats of {} total amount (estimated weight {})",
            fee.to_sat(),
            self.total_value().to_sat(),
            self.weight()
        );

        let mut transaction = self.unsigned(output_value);
        let prevouts: Vec<TxOut> = self
            .inputs
            .iter()
            .map(|input| input.utxo.output.clone())
            .collect();

        let witnesses = {
            let mut sighash_cache = SighashCache::new(&transaction);
            self.inputs
                .iter()
                .enumerate()
                .map(|(index, input)| {
                    signer.sign_input(
                        &mut sighash_cache,
                        &prevouts,
                        index,
                        &input.key,
                        &input.family,
                    )
                })
                .collect::<RecoveryResult<Vec<Witness>>>()?
        };
        for (txin, witness) in transaction.input.iter_mut().zip(witnesses) {
            txin.witness = witness;
        }

        Ok(SignedSweep {
            transaction,
            fee,
            weight: self.weight(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedSweep {
    pub transaction: Transaction,
    pub fee: Amount,
    /// Estimated, not actual, weight.
    pub weight: u64,
}

impl SignedSweep {
    pub fn raw_hex(&self) -> String {
        encode::serialize_hex(&self.transaction)
    }

    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }
}

/// Builds and signs one transaction spending every UTXO of `targets` to `destination`.
pub fn build_and_sign(
    secp: &Secp256k1<All>,
    master: &ExtendedKey,
    config: &RecoveryConfig,
    targets: &[TargetAddress],
    destination: ScriptBuf,
    fee_rate_sat_vb: u64,
) -> RecoveryResult<SignedSweep> {
    let mut sweep = SweepTransaction::new(destination, fee_rate_sat_vb);
    for target in targets {
        sweep.add_target(target);
    }
    let signer = InputSigner::new(secp, master, config.coin_type());
    sweep.sign(&signer, config.dust_limit())
}

#[derive(Clone, Debug)]
pub struct SweepRequest {
    /// Destination address or [`crate::wallet::ADDRESS_DERIVE_FROM_WALLET`].
    pub sweep_addr: String,
    /// Zero selects the default window.
    pub recovery_window: u32,
    /// sat/vB. Zero selects the configured default.
    pub fee_rate_sat_vb: u64,
    pub publish: bool,
    pub records: RecordSource,
    pub tweak_scheme: TweakScheme,
}

#[derive(Clone, Debug)]
pub struct SweepOutcome {
    pub sweep: SignedSweep,
    pub targets: Vec<TargetAddress>,
    pub not_found: Vec<AncientChannelRecord>,
    pub publish_receipt: Option<String>,
}

/// Finds every remote force close output of the wallet and sweeps it.
pub fn sweep_remote_closed(
    secp: &Secp256k1<All>,
    master: &ExtendedKey,
    config: &RecoveryConfig,
    chain: &dyn ChainLookup,
    request: &SweepRequest,
) -> RecoveryResult<SweepOutcome> {
    let (sweep_addr, destination) =
        prepare_sweep_address(secp, master, &request.sweep_addr, config)?;
    let window = config.effective_window(request.recovery_window);
    let fee_rate = config.effective_fee_rate(request.fee_rate_sat_vb);

    let mut targets = scan(secp, master, config, chain, window)?;

    let records = request.records.load(config.network)?;
    let matcher = LegacyMatcher::new(secp, master, config, window, request.tweak_scheme)?;
    let legacy = matcher.match_records(secp, master, &records, chain)?;
    if !legacy.not_found.is_empty() {
        warn!(
            "{} of {} ancient channel records not found in the first {} keys",
            legacy.not_found.len(),
            records.len(),
            window
        );
    }
    targets.extend(legacy.targets);

    let sweep = build_and_sign(secp, master, config, &targets, destination, fee_rate)?;
    info!("Sweeping {} inputs to {}", sweep.transaction.input.len(), sweep_addr);

    let publish_receipt = if request.publish {
        let receipt = chain.publish(&sweep.raw_hex())?;
        info!("Published TX {}, response: {}", sweep.txid(), receipt);
        Some(receipt)
    } else {
        None
    };

    Ok(SweepOutcome {
        sweep,
        targets,
        not_found: legacy.not_found,
        publish_receipt,
    })
}
