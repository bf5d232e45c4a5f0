//! Stakeguard Core - policy verification for Babylon covenant staking
//!
//! Given a parameter blob and a view of the transaction being signed, this
//! crate rebuilds the staking tapscripts and taproot outputs the protocol
//! expects and refuses to sign unless the transaction matches them
//! byte for byte.
//!
//! The usual entry point is [`PolicyEngine`]:
//!
//! ```no_run
//! use stakeguard_core::{NoKeyDerivation, PolicyConfig, PolicyEngine, TxSummary};
//!
//! # fn run(blob: &[u8], tx: &TxSummary) -> stakeguard_core::Result<()> {
//! let mut engine = PolicyEngine::new(PolicyConfig::default());
//! engine.load_params(blob)?;
//! let verified = engine.verify(tx, &NoKeyDerivation)?;
//! println!("{} (fee {} sats)", verified.action.policy_name(), verified.fee);
//! engine.finish();
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod bip322;
pub mod config;
pub mod crypto;
pub mod error;
pub mod hd;
pub mod policy;
pub mod script;
pub mod session;
pub mod tlv;
pub mod tx;
pub mod types;

pub use address::{nums_key, taproot_script_pubkey, AddressVerifier, NUMS_KEY};
pub use bip322::{MessageIdentityVerifier, SignerKey};
pub use config::{FeeLimitBounds, Network, PolicyConfig};
pub use crypto::{K256Backend, PublicKey, TaprootCrypto};
pub use error::{BlobError, Error, Result};
pub use hd::{DerivationPath, KeyDerivation, NoKeyDerivation, Purpose};
pub use policy::{ActionParams, PolicyEngine, PolicyState, StakeParams, VerifiedAction};
pub use script::{ScriptBuilder, StakingLeaves};
pub use session::{Action, KeySetCache, MessageKey, SessionRecord};
pub use tlv::{parse_blob, BlobWriter};
pub use tx::{TxInput, TxOutput, TxSummary, TxView};
pub use types::{Parity, TapHash, Txid, XOnlyKey};
