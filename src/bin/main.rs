//! Command line front end for recovering remote force-closed channel funds.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use bitcoin::secp256k1::{PublicKey, Secp256k1};
use bitcoin::Network;
use clap::{Parser, Subcommand};
use tracing::info;

use chansweep::ancient::RecordSource;
use chansweep::chain::EsploraClient;
use chansweep::config::RecoveryConfig;
use chansweep::crypto::TweakScheme;
use chansweep::derivation::{derive_path, identity_path, parse_path};
use chansweep::sweep::{sweep_remote_closed, SweepRequest};
use chansweep::wallet::{read_root_key, RootKeySource, ADDRESS_DERIVE_FROM_WALLET};
use chansweep::{cln, logging};

#[derive(Parser)]
#[command(
    name = "chansweep",
    about = "Recover funds from remote force-closed Lightning channels using only the wallet seed",
    version
)]
struct Cli {
    #[arg(long, env = "CHANSWEEP_CONFIG", help = "path to a TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_parser = clap::value_parser!(Network),
        help = "bitcoin, testnet, signet or regtest; overrides the configuration file"
    )]
    network: Option<Network>,

    #[clap(flatten)]
    root_key: RootKeyArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug, Clone)]
struct RootKeyArgs {
    #[arg(long, env = "CHANSWEEP_ROOTKEY", help = "BIP32 HD root key (xprv/tprv)")]
    rootkey: Option<String>,

    #[arg(long, env = "CHANSWEEP_MNEMONIC", help = "BIP39 mnemonic of the wallet")]
    mnemonic: Option<String>,

    #[arg(
        long,
        env = "CHANSWEEP_PASSPHRASE",
        default_value = "",
        help = "passphrase of the mnemonic"
    )]
    passphrase: String,

    #[arg(long, env = "CHANSWEEP_SEED", help = "hex encoded BIP32 seed")]
    seed: Option<String>,
}

impl RootKeyArgs {
    fn source(&self) -> Result<RootKeySource> {
        match (&self.rootkey, &self.mnemonic, &self.seed) {
            (Some(rootkey), None, None) => Ok(RootKeySource::Xpriv(rootkey.clone())),
            (None, Some(phrase), None) => Ok(RootKeySource::Mnemonic {
                phrase: phrase.clone(),
                passphrase: self.passphrase.clone(),
            }),
            (None, None, Some(seed)) => Ok(RootKeySource::SeedHex(seed.clone())),
            (None, None, None) => bail!("one of --rootkey, --mnemonic or --seed is required"),
            _ => bail!("only one of --rootkey, --mnemonic or --seed may be set"),
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    #[command(name = "sweepremoteclosed")]
    SweepRemoteClosed(SweepRemoteClosedArgs),

    #[command(name = "derivekey")]
    DeriveKey(DeriveKeyArgs),

    #[command(name = "clnfundingkey")]
    ClnFundingKey(ClnFundingKeyArgs),
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Go through all the addresses that could have funds of channels that were \
                   force-closed by the remote party and sweep them into one transaction")]
struct SweepRemoteClosedArgs {
    #[arg(long, default_value_t = 0, help = "number of keys to scan per derivation path (0 = default)")]
    recoverywindow: u32,

    #[arg(long, default_value_t = 0, help = "fee rate in sat/vByte (0 = configured default)")]
    feerate: u64,

    #[arg(
        long,
        help = "address to sweep the funds to, use 'fromseed' to derive one from the seed"
    )]
    sweepaddr: String,

    #[arg(long, default_value_t = false, help = "publish the sweep transaction")]
    publish: bool,

    #[arg(long, help = "block explorer API to use (overrides the configuration file)")]
    apiurl: Option<String>,

    #[arg(long, help = "JSON file with ancient channel records to use instead of the built-in list")]
    ancientchannels: Option<PathBuf>,

    #[arg(
        long,
        default_value = "bolt3",
        value_parser = clap::value_parser!(TweakScheme),
        help = "tweak of ancient channel keys: bolt3 or ecdh"
    )]
    tweak: TweakScheme,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Derive a key with a specific derivation path")]
struct DeriveKeyArgs {
    #[arg(long, help = "BIP32 derivation path to derive the key from, e.g. m/1017'/0'/3'/0/5")]
    path: Option<String>,

    #[arg(long, default_value_t = false, help = "derive the lnd node identity key")]
    identity: bool,

    #[arg(long, default_value_t = false, help = "don't output private key(s)")]
    neuter: bool,
}

#[derive(Parser, Debug, Clone)]
#[command(about = "Derive the funding key of a Core Lightning channel")]
struct ClnFundingKeyArgs {
    #[arg(long, env = "CHANSWEEP_HSM_SECRET", help = "hex encoded 32 byte hsm_secret")]
    hsmsecret: String,

    #[arg(long, help = "node public key of the channel peer")]
    peer: String,

    #[arg(long, help = "database id of the channel")]
    channel: u64,
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => RecoveryConfig::from_file(path)?,
        None => RecoveryConfig::default(),
    };
    if let Some(network) = cli.network {
        config.network = network;
    }

    match cli.command {
        Commands::SweepRemoteClosed(args) => handle_sweep(&config, &cli.root_key, args),
        Commands::DeriveKey(args) => handle_derive_key(&config, &cli.root_key, args),
        Commands::ClnFundingKey(args) => handle_cln_funding_key(args),
    }
}

fn handle_sweep(
    config: &RecoveryConfig,
    root_key: &RootKeyArgs,
    args: SweepRemoteClosedArgs,
) -> Result<()> {
    if args.sweepaddr != ADDRESS_DERIVE_FROM_WALLET {
        chansweep::wallet::check_address(&args.sweepaddr, config.network)?;
    }

    let mut config = config.clone();
    if let Some(api_url) = args.apiurl {
        config.api_url = api_url;
    }

    let secp = Secp256k1::new();
    let master = read_root_key(&root_key.source()?, config.network)?;
    let chain = EsploraClient::new(&config.api_url)?;
    let request = SweepRequest {
        sweep_addr: args.sweepaddr,
        recovery_window: args.recoverywindow,
        fee_rate_sat_vb: args.feerate,
        publish: args.publish,
        records: args
            .ancientchannels
            .map(RecordSource::File)
            .unwrap_or(RecordSource::Embedded),
        tweak_scheme: args.tweak,
    };

    let outcome = sweep_remote_closed(&secp, &master, &config, &chain, &request)
        .context("could not sweep remote closed channels")?;
    info!(
        "Swept {} targets, {} ancient channel records unmatched",
        outcome.targets.len(),
        outcome.not_found.len()
    );
    println!("Transaction: {}", outcome.sweep.raw_hex());
    println!("TXID: {}", outcome.sweep.txid());
    Ok(())
}

fn handle_derive_key(
    config: &RecoveryConfig,
    root_key: &RootKeyArgs,
    args: DeriveKeyArgs,
) -> Result<()> {
    let path = match (args.path, args.identity) {
        (Some(path), false) => parse_path(&path)?,
        (None, true) => identity_path(config.coin_type())?,
        _ => bail!("exactly one of --path or --identity is required"),
    };

    let secp = Secp256k1::new();
    let master = read_root_key(&root_key.source()?, config.network)?;
    let report = derive_path(&secp, &master, &path)?.report(&secp, config.network, args.neuter);

    println!("Path:\t\t\t\t{}", report.path);
    println!("Network: \t\t\t{}", report.network);
    println!("Public key: \t\t\t{}", report.public_key);
    println!("Extended public key (xpub): \t{}", report.xpub);
    println!("Address: \t\t\t{}", report.address);
    println!("Legacy address: \t\t{}", report.legacy_address);
    if let (Some(wif), Some(xpriv)) = (report.private_key_wif, report.xpriv) {
        println!("Private key (WIF): \t\t{}", wif);
        println!("Extended private key (xprv):\t{}", xpriv);
    }
    Ok(())
}

fn handle_cln_funding_key(args: ClnFundingKeyArgs) -> Result<()> {
    let hsm_secret = hex::decode(args.hsmsecret.trim()).context("invalid hsm secret hex")?;
    let peer = PublicKey::from_str(&args.peer).context("invalid peer public key")?;

    let secp = Secp256k1::new();
    let (_, node_key) = cln::node_key(&secp, &hsm_secret)?;
    let (_, funding_key) = cln::funding_key(&secp, &hsm_secret, &peer, args.channel)?;
    println!("Node key: \t\t{}", node_key);
    println!("Funding key: \t\t{}", funding_key);
    Ok(())
}
