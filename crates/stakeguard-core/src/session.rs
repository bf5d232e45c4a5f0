//! Per-session parameter state and the cross-step key-set cache

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use crate::hd::DerivationPath;
use crate::types::{Txid, XOnlyKey};

/// Protocol action declared by the parameter blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    Staking = 1,
    Unbond = 2,
    Slashing = 3,
    SlashingUnbonding = 4,
    Withdraw = 5,
    SignMessage = 6,
    Expansion = 7,
}

impl Action {
    /// Decode the one-byte action code
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Staking),
            2 => Ok(Self::Unbond),
            3 => Ok(Self::Slashing),
            4 => Ok(Self::SlashingUnbonding),
            5 => Ok(Self::Withdraw),
            6 => Ok(Self::SignMessage),
            7 => Ok(Self::Expansion),
            other => Err(Error::UnsupportedAction(format!("action code {}", other))),
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Name shown to the user when asking for approval
    pub fn policy_name(&self) -> &'static str {
        match self {
            Self::Staking => "Staking transaction",
            Self::Unbond => "Unbonding",
            Self::Slashing => "Consent to slashing",
            Self::SlashingUnbonding => "Consent to unbonding slashing",
            Self::Withdraw => "Withdraw",
            Self::SignMessage => "Sign message",
            Self::Expansion => "Stake expansion",
        }
    }

    /// Actions whose first approval pins the key sets for later steps
    pub fn is_slashing(&self) -> bool {
        matches!(self, Self::Slashing | Self::SlashingUnbonding)
    }
}

impl TryFrom<u8> for Action {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Self::from_code(code)
    }
}

/// Key a BIP-322 message is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    XOnly(XOnlyKey),
    Compressed(PublicKey),
}

/// Validated parameters for one signing session
///
/// Every field is optional; a routine that needs a field asks for it through
/// [`require`] and fails with [`Error::MissingField`] when it was not sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub action: Option<Action>,
    pub finality_providers: Option<Vec<XOnlyKey>>,
    pub covenant_keys: Option<Vec<XOnlyKey>>,
    pub covenant_quorum: Option<u8>,
    pub staker_key: Option<XOnlyKey>,
    pub timelock: Option<u64>,
    pub slashing_fee_limit: Option<u64>,
    pub unbonding_fee_limit: Option<u64>,
    pub burn_address: Option<Vec<u8>>,
    pub message: Option<Vec<u8>>,
    pub message_key: Option<MessageKey>,
    pub txid: Option<Txid>,
    pub derivation_path: Option<DerivationPath>,
}

impl SessionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no field has been populated
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Wipe byte material and return every field to unset
    pub fn clear(&mut self) {
        if let Some(message) = self.message.as_mut() {
            message.zeroize();
        }
        if let Some(burn) = self.burn_address.as_mut() {
            burn.zeroize();
        }
        if let Some(path) = self.derivation_path.as_mut() {
            path.zeroize();
        }
        match self.message_key.as_mut() {
            Some(MessageKey::XOnly(key)) => key.zeroize(),
            Some(MessageKey::Compressed(key)) => key.zeroize(),
            None => {}
        }
        *self = Self::default();
    }

    pub fn action(&self) -> Result<Action> {
        self.action.ok_or(Error::MissingField("action"))
    }

    pub fn staker_key(&self) -> Result<&XOnlyKey> {
        require(&self.staker_key, "staker_key")
    }

    pub fn timelock(&self) -> Result<u64> {
        require(&self.timelock, "timelock").copied()
    }

    /// Finality providers; an empty list counts as absent
    pub fn finality_providers(&self) -> Result<&[XOnlyKey]> {
        require_non_empty(&self.finality_providers, "finality_providers")
    }

    /// Covenant keys; an empty list counts as absent
    pub fn covenant_keys(&self) -> Result<&[XOnlyKey]> {
        require_non_empty(&self.covenant_keys, "covenant_keys")
    }

    pub fn covenant_quorum(&self) -> Result<u8> {
        require(&self.covenant_quorum, "covenant_quorum").copied()
    }
}

/// Borrow an optional field or fail closed
pub fn require<'a, T>(field: &'a Option<T>, name: &'static str) -> Result<&'a T> {
    field.as_ref().ok_or(Error::MissingField(name))
}

fn require_non_empty<'a>(
    field: &'a Option<Vec<XOnlyKey>>,
    name: &'static str,
) -> Result<&'a [XOnlyKey]> {
    match field {
        Some(keys) if !keys.is_empty() => Ok(keys),
        _ => Err(Error::MissingField(name)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KeySetSnapshot {
    finality_providers: Option<Vec<XOnlyKey>>,
    covenant_keys: Option<Vec<XOnlyKey>>,
    covenant_quorum: Option<u8>,
}

impl KeySetSnapshot {
    fn of(record: &SessionRecord) -> Self {
        Self {
            finality_providers: record.finality_providers.clone(),
            covenant_keys: record.covenant_keys.clone(),
            covenant_quorum: record.covenant_quorum,
        }
    }
}

/// Snapshot of the finality-provider and covenant sets approved earlier in
/// the session, compared on every later step of the same transaction
#[derive(Debug, Clone, Default)]
pub struct KeySetCache {
    snapshot: Option<KeySetSnapshot>,
}

impl KeySetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_populated(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Record the current key sets unless a snapshot already exists
    pub fn capture(&mut self, record: &SessionRecord) {
        if self.snapshot.is_none() {
            debug!("capturing key sets for this session");
            self.snapshot = Some(KeySetSnapshot::of(record));
        }
    }

    /// Compare against the snapshot; a mismatch empties the cache
    pub fn check(&mut self, record: &SessionRecord) -> Result<()> {
        let Some(snapshot) = &self.snapshot else {
            return Ok(());
        };
        let current = KeySetSnapshot::of(record);
        if *snapshot == current {
            return Ok(());
        }

        let what = if snapshot.finality_providers != current.finality_providers {
            "finality providers"
        } else if snapshot.covenant_keys != current.covenant_keys {
            "covenant keys"
        } else {
            "covenant quorum"
        };
        warn!(changed = what, "key set differs from the approved snapshot");
        self.reset();
        Err(Error::KeySetMismatch(format!("{} changed since approval", what)))
    }

    pub fn reset(&mut self) {
        self.snapshot = None;
    }
}
