//! Per-session policy engine
//!
//! A [`PolicyEngine`] owns one signing session: the parsed parameters, the
//! key-set cache and the session state. The host feeds it a parameter blob,
//! then a view of the transaction, and signs only after a successful
//! [`PolicyEngine::verify`].
//!
//! ```text
//! Unparsed --load_params--> Parsed --verify--> Verified
//!     ^                       |                  |
//!     |                       +---- failure ---> Rejected
//!     +---------------- finish ------------------+
//! ```

use tracing::{debug, info, instrument, warn};

use crate::address::{compute_fee, AddressVerifier};
use crate::bip322::{resolve_signer, MessageIdentityVerifier, SignerKey};
use crate::config::PolicyConfig;
use crate::crypto::{K256Backend, PublicKey, TaprootCrypto};
use crate::error::{Error, Result};
use crate::hd::{KeyDerivation, Purpose};
use crate::script::{check_timelock, ScriptBuilder};
use crate::session::{require, Action, KeySetCache, SessionRecord};
use crate::tlv::parse_blob;
use crate::tx::TxView;
use crate::types::{TapHash, XOnlyKey};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Unparsed,
    Parsed,
    Verified,
    Rejected,
}

/// Parameters shared by every action that rebuilds the staking scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeParams {
    pub staker: XOnlyKey,
    pub finality_providers: Vec<XOnlyKey>,
    pub covenant_keys: Vec<XOnlyKey>,
    pub covenant_quorum: u8,
    pub timelock: u64,
}

impl StakeParams {
    fn from_record(record: &SessionRecord) -> Result<Self> {
        let covenant_keys = record.covenant_keys()?.to_vec();
        let covenant_quorum = record.covenant_quorum()?;
        if covenant_quorum as usize > covenant_keys.len() {
            return Err(Error::InvalidQuorum {
                quorum: covenant_quorum,
                keys: covenant_keys.len(),
            });
        }
        let timelock = record.timelock()?;
        check_timelock(timelock)?;
        Ok(Self {
            staker: *record.staker_key()?,
            finality_providers: record.finality_providers()?.to_vec(),
            covenant_keys,
            covenant_quorum,
            timelock,
        })
    }
}

/// Action together with exactly the fields it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionParams {
    Staking(StakeParams),
    Expansion(StakeParams),
    Unbond {
        stake: StakeParams,
        fee_limit: u64,
    },
    Slashing {
        stake: StakeParams,
        fee_limit: u64,
        burn_address: Vec<u8>,
        /// Slashing of the unbonding output rather than the staking output
        from_unbonding: bool,
    },
    Withdraw,
    SignMessage {
        message: Vec<u8>,
        purpose: Purpose,
        signer: SignerKey,
    },
}

impl ActionParams {
    /// Build the typed parameters, failing on the first missing field
    ///
    /// `derived` is the key at the session derivation path, if one was sent.
    pub fn from_record(record: &SessionRecord, derived: Option<&PublicKey>) -> Result<Self> {
        let params = match record.action()? {
            Action::Staking => Self::Staking(StakeParams::from_record(record)?),
            Action::Expansion => Self::Expansion(StakeParams::from_record(record)?),
            Action::Unbond => Self::Unbond {
                stake: StakeParams::from_record(record)?,
                fee_limit: *require(&record.unbonding_fee_limit, "unbonding_fee_limit")?,
            },
            action @ (Action::Slashing | Action::SlashingUnbonding) => Self::Slashing {
                stake: StakeParams::from_record(record)?,
                fee_limit: *require(&record.slashing_fee_limit, "slashing_fee_limit")?,
                burn_address: require(&record.burn_address, "burn_address")?.clone(),
                from_unbonding: action == Action::SlashingUnbonding,
            },
            Action::Withdraw => Self::Withdraw,
            Action::SignMessage => {
                let purpose = require(&record.derivation_path, "derivation_path")?.purpose()?;
                Self::SignMessage {
                    message: require(&record.message, "message")?.clone(),
                    purpose,
                    signer: resolve_signer(purpose, record.message_key.as_ref(), derived)?,
                }
            }
        };
        Ok(params)
    }

    pub fn action(&self) -> Action {
        match self {
            Self::Staking(_) => Action::Staking,
            Self::Expansion(_) => Action::Expansion,
            Self::Unbond { .. } => Action::Unbond,
            Self::Slashing {
                from_unbonding: false,
                ..
            } => Action::Slashing,
            Self::Slashing {
                from_unbonding: true,
                ..
            } => Action::SlashingUnbonding,
            Self::Withdraw => Action::Withdraw,
            Self::SignMessage { .. } => Action::SignMessage,
        }
    }
}

/// Outcome of a successful verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedAction {
    pub action: Action,
    pub params: ActionParams,
    /// inputs_total - outputs_total, in sats
    pub fee: u64,
    /// Fee exceeds the configured threshold; the UI must ask before signing
    pub fee_warning: bool,
    /// Tapleaf the host should sign under, for script-path spends
    pub signing_leaf: Option<TapHash>,
}

fn check_cardinality<T: TxView + ?Sized>(action: Action, tx: &T) -> Result<()> {
    let inputs = tx.input_count();
    let outputs = tx.output_count();
    let (inputs_ok, min_outputs) = match action {
        Action::Staking => (inputs >= 1, 1),
        Action::Expansion => (inputs == 2, 1),
        Action::Unbond => (inputs == 1, 1),
        Action::Slashing | Action::SlashingUnbonding => (inputs == 1, 2),
        Action::Withdraw | Action::SignMessage => (inputs == 1, 0),
    };
    if !inputs_ok {
        return Err(Error::StructuralMismatch(format!(
            "{:?} cannot spend {} inputs",
            action, inputs
        )));
    }
    if outputs < min_outputs {
        return Err(Error::StructuralMismatch(format!(
            "{:?} needs at least {} outputs, found {}",
            action, min_outputs, outputs
        )));
    }
    Ok(())
}

/// One signing session
pub struct PolicyEngine<C: TaprootCrypto = K256Backend> {
    config: PolicyConfig,
    crypto: C,
    session: SessionRecord,
    key_cache: KeySetCache,
    state: PolicyState,
}

impl PolicyEngine<K256Backend> {
    /// Engine using the software crypto backend
    pub fn new(config: PolicyConfig) -> Self {
        Self::with_crypto(config, K256Backend)
    }
}

impl<C: TaprootCrypto> PolicyEngine<C> {
    pub fn with_crypto(config: PolicyConfig, crypto: C) -> Self {
        Self {
            config,
            crypto,
            session: SessionRecord::new(),
            key_cache: KeySetCache::new(),
            state: PolicyState::Unparsed,
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    pub fn session(&self) -> &SessionRecord {
        &self.session
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn key_cache(&self) -> &KeySetCache {
        &self.key_cache
    }

    /// Parse a parameter blob into a fresh session record
    ///
    /// The key-set cache survives re-parsing so later steps of the same
    /// transaction are compared against the approved key sets.
    #[instrument(skip_all, fields(len = blob.len()))]
    pub fn load_params(&mut self, blob: &[u8]) -> Result<()> {
        match parse_blob(&mut self.session, blob) {
            Ok(()) => {
                self.state = PolicyState::Parsed;
                info!(action = ?self.session.action, "parameters loaded");
                Ok(())
            }
            Err(e) => Err(self.reject(e)),
        }
    }

    /// Run every check the session's action requires against `tx`
    #[instrument(skip_all, fields(action = ?self.session.action))]
    pub fn verify<T, K>(&mut self, tx: &T, keys: &K) -> Result<VerifiedAction>
    where
        T: TxView + ?Sized,
        K: KeyDerivation + ?Sized,
    {
        match self.state {
            PolicyState::Parsed => {}
            PolicyState::Verified => {
                // an approved session stays intact until finish()
                warn!("verify called on an already verified session");
                return Err(Error::InvalidState(
                    "session already verified".to_string(),
                ));
            }
            state => {
                let err = Error::InvalidState(format!("verify called in state {:?}", state));
                return Err(self.reject(err));
            }
        }
        match self.run_checks(tx, keys) {
            Ok(verified) => {
                self.state = PolicyState::Verified;
                info!(
                    policy = verified.action.policy_name(),
                    fee = verified.fee,
                    fee_warning = verified.fee_warning,
                    "transaction verified"
                );
                Ok(verified)
            }
            Err(e) => Err(self.reject(e)),
        }
    }

    /// End the session, wiping parameters and the key-set cache
    pub fn finish(&mut self) {
        self.session.clear();
        self.key_cache.reset();
        self.state = PolicyState::Unparsed;
        debug!("session finished");
    }

    fn reject(&mut self, err: Error) -> Error {
        warn!(error = %err, "session rejected");
        self.session.clear();
        self.key_cache.reset();
        self.state = PolicyState::Rejected;
        err
    }

    /// Derive the key at the session path and reconcile it with a
    /// transmitted staker key
    fn resolve_staker<K: KeyDerivation + ?Sized>(&mut self, keys: &K) -> Result<Option<PublicKey>> {
        let Some(path) = self.session.derivation_path else {
            return Ok(None);
        };
        let derived = keys.derive_pubkey(&path)?;
        derived.validate()?;
        let x_only = derived.x_only();
        if let Some(sent) = self.session.staker_key {
            if sent != x_only {
                return Err(Error::IdentityMismatch(format!(
                    "staker key {} is not the key at {}",
                    sent.short(),
                    path.to_string_path()
                )));
            }
        }
        debug!(path = %path.to_string_path(), key = %x_only.short(), "staker key derived");
        self.session.staker_key = Some(x_only);
        Ok(Some(derived))
    }

    fn run_checks<T, K>(&mut self, tx: &T, keys: &K) -> Result<VerifiedAction>
    where
        T: TxView + ?Sized,
        K: KeyDerivation + ?Sized,
    {
        let derived = self.resolve_staker(keys)?;
        let params = ActionParams::from_record(&self.session, derived.as_ref())?;
        let action = params.action();

        check_cardinality(action, tx)?;
        let fee = compute_fee(tx)?;

        self.key_cache.check(&self.session)?;
        if action.is_slashing() {
            self.key_cache.capture(&self.session);
        }

        let verifier = AddressVerifier::new(&self.crypto, &self.config);
        let builder = ScriptBuilder::new(&self.session, &self.crypto);
        let signing_leaf = match &params {
            ActionParams::Staking(_) => {
                verifier.verify_staking(&self.session, tx)?;
                None
            }
            ActionParams::Expansion(_) => Some(verifier.verify_expansion(&self.session, tx)?),
            ActionParams::Unbond { .. } => {
                verifier.verify_unbond(&self.session, tx)?;
                Some(builder.unbonding_leaf()?)
            }
            ActionParams::Slashing { .. } => {
                verifier.verify_slashing(&self.session, tx)?;
                Some(builder.slashing_leaf()?)
            }
            ActionParams::Withdraw => None,
            ActionParams::SignMessage { signer, .. } => {
                MessageIdentityVerifier::new(&self.crypto).verify(&self.session, signer, tx)?;
                None
            }
        };

        let fee_warning = matches!(
            action,
            Action::Staking | Action::Expansion | Action::Withdraw
        ) && fee > self.config.high_fee_warning_sats;
        if fee_warning {
            warn!(fee, threshold = self.config.high_fee_warning_sats, "high fee");
        }

        Ok(VerifiedAction {
            action,
            params,
            fee,
            fee_warning,
            signing_leaf,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::taproot_script_pubkey;
    use crate::config::Network;
    use crate::hd::{DerivationPath, NoKeyDerivation};
    use crate::script::OP_RETURN;
    use crate::tlv::BlobWriter;
    use crate::tx::{TxInput, TxOutput, TxSummary};
    use crate::types::Txid;

    /// Returns one fixed key for every path
    struct FixedKey(PublicKey);

    impl KeyDerivation for FixedKey {
        fn derive_pubkey(&self, _path: &DerivationPath) -> Result<PublicKey> {
            Ok(self.0)
        }
    }

    // secp256k1 generator, a valid compressed key
    const G: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";

    fn generator() -> PublicKey {
        PublicKey::from_hex(G).unwrap()
    }

    fn keys(seeds: &[u8]) -> Vec<XOnlyKey> {
        seeds.iter().map(|s| XOnlyKey::new([*s; 32])).collect()
    }

    fn stake_blob(action: Action) -> BlobWriter {
        BlobWriter::new()
            .action(action)
            .finality_providers(&keys(&[1]))
            .covenant(&keys(&[2, 3]), 2)
            .staker_key(&generator().x_only())
            .timelock(1000)
    }

    fn staking_output(engine: &PolicyEngine) -> Vec<u8> {
        let root = ScriptBuilder::new(engine.session(), &K256Backend)
            .staking_root()
            .unwrap();
        let verifier = AddressVerifier::new(&K256Backend, engine.config());
        taproot_script_pubkey(&verifier.expected_output_key(&root).unwrap())
    }

    fn input(amount: u64) -> TxInput {
        TxInput::new(Txid::new([0x42; 32]), 0, amount)
    }

    #[test]
    fn test_staking_happy_path() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        assert_eq!(engine.state(), PolicyState::Unparsed);
        engine
            .load_params(&stake_blob(Action::Staking).finish())
            .unwrap();
        assert_eq!(engine.state(), PolicyState::Parsed);

        let tx = TxSummary::new()
            .with_input(input(100_000))
            .with_output(TxOutput::new(staking_output(&engine), 60_000))
            .with_output(TxOutput::new(vec![0x00, 0x14], 39_000));
        let verified = engine.verify(&tx, &NoKeyDerivation).unwrap();

        assert_eq!(engine.state(), PolicyState::Verified);
        assert_eq!(verified.action, Action::Staking);
        assert_eq!(verified.fee, 1_000);
        assert!(!verified.fee_warning);
        assert_eq!(verified.signing_leaf, None);
        assert!(matches!(verified.params, ActionParams::Staking(ref p) if p.timelock == 1000));
    }

    #[test]
    fn test_high_fee_warns_without_rejecting() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        engine
            .load_params(&stake_blob(Action::Staking).finish())
            .unwrap();
        let tx = TxSummary::new()
            .with_input(input(100_000))
            .with_output(TxOutput::new(staking_output(&engine), 50_000));
        let verified = engine.verify(&tx, &NoKeyDerivation).unwrap();
        assert_eq!(verified.fee, 50_000);
        assert!(verified.fee_warning);
    }

    #[test]
    fn test_failure_clears_everything() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        engine
            .load_params(&stake_blob(Action::Staking).finish())
            .unwrap();
        let tx = TxSummary::new()
            .with_input(input(100_000))
            .with_output(TxOutput::new(taproot_script_pubkey(&XOnlyKey::new([9; 32])), 1));
        assert!(matches!(
            engine.verify(&tx, &NoKeyDerivation),
            Err(Error::ScriptMismatch(_))
        ));
        assert_eq!(engine.state(), PolicyState::Rejected);
        assert!(engine.session().is_empty());

        // nothing left to verify against
        assert!(matches!(
            engine.verify(&tx, &NoKeyDerivation),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_verify_before_parse() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        let tx = TxSummary::new();
        assert!(matches!(
            engine.verify(&tx, &NoKeyDerivation),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(engine.state(), PolicyState::Rejected);
    }

    #[test]
    fn test_second_verify_keeps_approved_session() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        engine
            .load_params(&stake_blob(Action::Staking).finish())
            .unwrap();
        let tx = TxSummary::new()
            .with_input(input(100_000))
            .with_output(TxOutput::new(staking_output(&engine), 99_000));
        engine.verify(&tx, &NoKeyDerivation).unwrap();
        let approved = engine.session().clone();

        assert!(matches!(
            engine.verify(&tx, &NoKeyDerivation),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(engine.state(), PolicyState::Verified);
        assert_eq!(engine.session(), &approved);
        assert!(!engine.session().is_empty());
    }

    #[test]
    fn test_missing_field_per_action() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        let blob = BlobWriter::new()
            .action(Action::Staking)
            .staker_key(&generator().x_only())
            .timelock(1000)
            .finish();
        engine.load_params(&blob).unwrap();
        let tx = TxSummary::new().with_input(input(1)).with_output(TxOutput::new(vec![], 1));
        assert!(matches!(
            engine.verify(&tx, &NoKeyDerivation),
            Err(Error::MissingField(_))
        ));
    }

    #[test]
    fn test_input_cardinality() {
        let cases = [
            (Action::Unbond, 2usize),
            (Action::Withdraw, 2),
            (Action::Expansion, 1),
            (Action::Staking, 0),
        ];
        for (action, inputs) in cases {
            let mut engine = PolicyEngine::new(PolicyConfig::default());
            let blob = stake_blob(action)
                .unbonding_fee_limit(1_000)
                .finish();
            engine.load_params(&blob).unwrap();
            let mut tx = TxSummary::new().with_output(TxOutput::new(vec![], 0));
            for _ in 0..inputs {
                tx = tx.with_input(input(10_000));
            }
            assert!(
                matches!(
                    engine.verify(&tx, &NoKeyDerivation),
                    Err(Error::StructuralMismatch(_))
                ),
                "{:?} with {} inputs",
                action,
                inputs
            );
        }
    }

    #[test]
    fn test_withdraw_needs_only_one_input() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        engine
            .load_params(&BlobWriter::new().action(Action::Withdraw).finish())
            .unwrap();
        let tx = TxSummary::new()
            .with_input(input(20_000))
            .with_output(TxOutput::new(vec![0x51, 0x20], 19_000));
        let verified = engine.verify(&tx, &NoKeyDerivation).unwrap();
        assert_eq!(verified.params, ActionParams::Withdraw);
        assert_eq!(verified.fee, 1_000);
    }

    #[test]
    fn test_derived_staker_key() {
        let path = DerivationPath::taproot(1, 0, 0, 0);
        let blob = BlobWriter::new()
            .action(Action::Staking)
            .finality_providers(&keys(&[1]))
            .covenant(&keys(&[2, 3]), 2)
            .timelock(1000)
            .derivation_path(&path)
            .finish();

        let mut engine = PolicyEngine::new(PolicyConfig::default());
        engine.load_params(&blob).unwrap();
        assert_eq!(engine.session().staker_key, None);

        // build the expected output with the key the deriver will return
        let mut expected = engine.session().clone();
        expected.staker_key = Some(generator().x_only());
        let root = ScriptBuilder::new(&expected, &K256Backend)
            .staking_root()
            .unwrap();
        let config = PolicyConfig::default();
        let spk = taproot_script_pubkey(
            &AddressVerifier::new(&K256Backend, &config)
                .expected_output_key(&root)
                .unwrap(),
        );
        let tx = TxSummary::new()
            .with_input(input(10_000))
            .with_output(TxOutput::new(spk, 9_000));

        engine.verify(&tx, &FixedKey(generator())).unwrap();
        assert_eq!(engine.session().staker_key, Some(generator().x_only()));
    }

    #[test]
    fn test_transmitted_staker_must_match_derived() {
        let blob = stake_blob(Action::Staking)
            .derivation_path(&DerivationPath::taproot(1, 0, 0, 0))
            .finish();
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        engine.load_params(&blob).unwrap();

        // 2G, a valid key that is not the transmitted staker key
        let other = PublicKey::from_hex(
            "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5",
        )
        .unwrap();
        let tx = TxSummary::new().with_input(input(1)).with_output(TxOutput::new(vec![], 1));
        assert!(matches!(
            engine.verify(&tx, &FixedKey(other)),
            Err(Error::IdentityMismatch(_))
        ));
        assert_eq!(engine.state(), PolicyState::Rejected);
    }

    #[test]
    fn test_no_key_derivation_rejects_paths() {
        let blob = stake_blob(Action::Staking)
            .derivation_path(&DerivationPath::taproot(1, 0, 0, 0))
            .finish();
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        engine.load_params(&blob).unwrap();
        let tx = TxSummary::new().with_input(input(1)).with_output(TxOutput::new(vec![], 1));
        assert!(matches!(
            engine.verify(&tx, &NoKeyDerivation),
            Err(Error::InvalidDerivationPath(_))
        ));
    }

    fn slashing_setup(engine: &mut PolicyEngine, covenants: &[u8]) -> TxSummary {
        let blob = BlobWriter::new()
            .action(Action::Slashing)
            .finality_providers(&keys(&[1]))
            .covenant(&keys(covenants), 2)
            .staker_key(&generator().x_only())
            .timelock(1000)
            .slashing_fee_limit(2_000)
            .burn_address(&[OP_RETURN, 0x00])
            .finish();
        engine.load_params(&blob).unwrap();

        let leaf = ScriptBuilder::new(engine.session(), &K256Backend)
            .timelock_leaf()
            .unwrap();
        let change = AddressVerifier::new(&K256Backend, engine.config())
            .expected_output_key(&leaf)
            .unwrap();
        TxSummary::new()
            .with_input(input(50_000))
            .with_output(TxOutput::new(vec![OP_RETURN, 0x00], 5_000))
            .with_output(TxOutput::new(taproot_script_pubkey(&change), 43_000))
    }

    #[test]
    fn test_slashing_returns_slashing_leaf_and_pins_key_set() {
        let mut engine = PolicyEngine::new(PolicyConfig::for_network(Network::Mainnet));
        let tx = slashing_setup(&mut engine, &[2, 3]);
        let slashing_leaf = ScriptBuilder::new(engine.session(), &K256Backend)
            .slashing_leaf()
            .unwrap();

        let verified = engine.verify(&tx, &NoKeyDerivation).unwrap();
        assert_eq!(verified.signing_leaf, Some(slashing_leaf));
        assert!(engine.key_cache().is_populated());

        // second step of the same transaction with the same keys
        let tx = slashing_setup(&mut engine, &[2, 3]);
        assert!(engine.verify(&tx, &NoKeyDerivation).is_ok());

        // covenant set swapped between steps
        let tx = slashing_setup(&mut engine, &[3, 2]);
        assert!(matches!(
            engine.verify(&tx, &NoKeyDerivation),
            Err(Error::KeySetMismatch(_))
        ));
        assert!(!engine.key_cache().is_populated());
        assert!(engine.session().is_empty());
    }

    #[test]
    fn test_finish_resets_session_and_cache() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        let tx = slashing_setup(&mut engine, &[2, 3]);
        engine.verify(&tx, &NoKeyDerivation).unwrap();
        engine.finish();
        assert_eq!(engine.state(), PolicyState::Unparsed);
        assert!(engine.session().is_empty());
        assert!(!engine.key_cache().is_populated());

        // a new session may use a different committee
        let tx = slashing_setup(&mut engine, &[4, 5]);
        assert!(engine.verify(&tx, &NoKeyDerivation).is_ok());
    }

    #[test]
    fn test_parse_failure_rejects_and_clears_cache() {
        let mut engine = PolicyEngine::new(PolicyConfig::default());
        let tx = slashing_setup(&mut engine, &[2, 3]);
        engine.verify(&tx, &NoKeyDerivation).unwrap();

        assert!(engine.load_params(&[0x42, 0x00, 0x00]).is_err());
        assert_eq!(engine.state(), PolicyState::Rejected);
        assert!(!engine.key_cache().is_populated());
    }
}
