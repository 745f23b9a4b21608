pub mod ancient;
pub mod chain;
pub mod cln;
pub mod config;
pub mod crypto;
pub mod derivation;
pub mod error;
pub mod logging;
pub mod scanner;
pub mod signer;
pub mod sweep;
pub mod targets;
pub mod wallet;

pub use ancient::{match_records, AncientChannelRecord, DerivationCache, LegacyMatcher, RecordSource};
pub use chain::{ChainLookup, EsploraClient, InMemoryChain, TxInfo, Utxo};
pub use config::RecoveryConfig;
pub use crypto::TweakScheme;
pub use derivation::{derive, DerivedKey, ExtendedKey, KeyLocator, KeyRing};
pub use error::{RecoveryError, RecoveryResult};
pub use scanner::scan;
pub use sweep::{build_and_sign, sweep_remote_closed, SignedSweep, SweepRequest};
pub use targets::{targets_for, KeyDescriptor, ScriptFamily, TargetAddress};
pub use wallet::{read_root_key, RootKeySource};
