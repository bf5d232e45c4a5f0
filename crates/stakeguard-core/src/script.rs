//! Tapscript leaves for the staking output and their taproot trees
//!
//! Three leaves guard a staking output:
//! - slashing: staker + every finality provider + covenant quorum
//! - unbonding: staker + covenant quorum
//! - timelock: staker after a relative lock
//!
//! The full staking tree is `branch(slashing, branch(unbonding, timelock))`.
//! Once unbonded, the output is rebuilt as `branch(slashing, timelock)`.

use tracing::debug;

use crate::crypto::{TaprootCrypto, TAG_TAP_LEAF};
use crate::error::{Error, Result};
use crate::session::SessionRecord;
use crate::types::{TapHash, XOnlyKey};

pub const OP_0: u8 = 0x00;
pub const OP_PUSHBYTES_20: u8 = 0x14;
pub const OP_PUSHBYTES_32: u8 = 0x20;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_1: u8 = 0x51;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
pub const OP_CHECKSIGADD: u8 = 0xba;

/// BIP-342 tapscript leaf version
pub const TAPSCRIPT_LEAF_VERSION: u8 = 0xc0;

/// Largest lock value a leaf may carry
pub const MAX_TIMELOCK: u64 = 0x7fff_ffff;

/// Push `value` using the protocol's number encoding
///
/// 0 is `OP_0`, 1..=15 use `OP_1`..`OP_15`, everything else (16 included)
/// is a data push of the minimal little-endian sign-magnitude bytes.
pub fn push_int(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![OP_0];
    }
    if (1..=15).contains(&value) {
        return vec![0x50 + value as u8];
    }

    let negative = value < 0;
    let mut magnitude = value.unsigned_abs();
    let mut bytes = Vec::with_capacity(9);
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    let top = bytes.len() - 1;
    if bytes[top] & 0x80 != 0 {
        bytes.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        bytes[top] |= 0x80;
    }

    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

/// Read one number pushed by [`push_int`], returning it and the bytes consumed
///
/// Only the forms [`push_int`] emits are accepted; `OP_1NEGATE` and `OP_16`
/// are rejected.
pub fn read_push_int(script: &[u8]) -> Result<(i64, usize)> {
    let first = *script
        .first()
        .ok_or_else(|| Error::ScriptMismatch("expected a number push".to_string()))?;
    match first {
        OP_0 => Ok((0, 1)),
        0x51..=0x5f => Ok(((first - 0x50) as i64, 1)),
        1..=9 => {
            let len = first as usize;
            let data = script.get(1..1 + len).ok_or_else(|| {
                Error::ScriptMismatch(format!("number push of {} bytes is truncated", len))
            })?;
            let mut magnitude: u128 = 0;
            for (i, byte) in data.iter().enumerate() {
                let b = if i == len - 1 { byte & 0x7f } else { *byte };
                magnitude |= (b as u128) << (8 * i);
            }
            let negative = data[len - 1] & 0x80 != 0;
            let value = if negative {
                -(magnitude as i128)
            } else {
                magnitude as i128
            };
            let value = i64::try_from(value)
                .map_err(|_| Error::ScriptMismatch("number push out of range".to_string()))?;
            Ok((value, 1 + len))
        }
        other => Err(Error::ScriptMismatch(format!(
            "opcode 0x{:02x} is not a number push",
            other
        ))),
    }
}

/// Reject lock values outside (0, 0x7fffffff]
pub fn check_timelock(timelock: u64) -> Result<()> {
    if timelock == 0 || timelock > MAX_TIMELOCK {
        return Err(Error::InvalidTimelock(timelock));
    }
    Ok(())
}

fn push_key(script: &mut Vec<u8>, key: &XOnlyKey) {
    script.push(OP_PUSHBYTES_32);
    script.extend_from_slice(key.as_bytes());
}

fn push_key_verify(script: &mut Vec<u8>, key: &XOnlyKey) {
    push_key(script, key);
    script.push(OP_CHECKSIGVERIFY);
}

/// `<k0> CHECKSIG <k1> CHECKSIGADD ... <quorum> NUMEQUAL`
fn push_covenant_multisig(script: &mut Vec<u8>, covenant_keys: &[XOnlyKey], quorum: u8) {
    for (i, key) in covenant_keys.iter().enumerate() {
        push_key(script, key);
        script.push(if i == 0 { OP_CHECKSIG } else { OP_CHECKSIGADD });
    }
    script.extend_from_slice(&push_int(quorum as i64));
    script.push(OP_NUMEQUAL);
}

/// Staker, every finality provider, then the covenant quorum
pub fn slashing_script(
    staker: &XOnlyKey,
    finality_providers: &[XOnlyKey],
    covenant_keys: &[XOnlyKey],
    quorum: u8,
) -> Vec<u8> {
    let mut script = Vec::with_capacity(34 * (2 + finality_providers.len() + covenant_keys.len()));
    push_key_verify(&mut script, staker);
    for fp in finality_providers {
        push_key_verify(&mut script, fp);
    }
    push_covenant_multisig(&mut script, covenant_keys, quorum);
    script
}

/// Staker and the covenant quorum
pub fn unbonding_script(staker: &XOnlyKey, covenant_keys: &[XOnlyKey], quorum: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(34 * (2 + covenant_keys.len()));
    push_key_verify(&mut script, staker);
    push_covenant_multisig(&mut script, covenant_keys, quorum);
    script
}

/// Staker after `timelock` blocks of relative lock
pub fn timelock_script(staker: &XOnlyKey, timelock: u64) -> Result<Vec<u8>> {
    check_timelock(timelock)?;
    let mut script = Vec::with_capacity(40);
    push_key_verify(&mut script, staker);
    script.extend_from_slice(&push_int(timelock as i64));
    script.push(OP_CHECKSEQUENCEVERIFY);
    Ok(script)
}

/// Bitcoin CompactSize length prefix
fn compact_size(len: usize, out: &mut Vec<u8>) {
    match len {
        0..=0xfc => out.push(len as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(len as u16).to_le_bytes());
        }
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
}

/// TapLeaf hash of a tapscript
pub fn leaf_hash<C: TaprootCrypto + ?Sized>(crypto: &C, script: &[u8]) -> TapHash {
    let mut payload = Vec::with_capacity(script.len() + 4);
    payload.push(TAPSCRIPT_LEAF_VERSION);
    compact_size(script.len(), &mut payload);
    payload.extend_from_slice(script);
    TapHash::new(crypto.tagged_hash(TAG_TAP_LEAF, &payload))
}

/// Leaf hashes of one staking output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakingLeaves {
    pub slashing: TapHash,
    pub unbonding: TapHash,
    pub timelock: TapHash,
}

impl StakingLeaves {
    /// `branch(slashing, branch(unbonding, timelock))`
    pub fn staking_root<C: TaprootCrypto + ?Sized>(&self, crypto: &C) -> TapHash {
        let inner = crypto.tap_branch(&self.unbonding, &self.timelock);
        crypto.tap_branch(&self.slashing, &inner)
    }

    /// `branch(slashing, timelock)`
    pub fn post_unbonding_root<C: TaprootCrypto + ?Sized>(&self, crypto: &C) -> TapHash {
        crypto.tap_branch(&self.slashing, &self.timelock)
    }
}

/// Builds leaves and roots from a session record
pub struct ScriptBuilder<'a, C: TaprootCrypto + ?Sized> {
    record: &'a SessionRecord,
    crypto: &'a C,
}

impl<'a, C: TaprootCrypto + ?Sized> ScriptBuilder<'a, C> {
    pub fn new(record: &'a SessionRecord, crypto: &'a C) -> Self {
        Self { record, crypto }
    }

    fn committee(&self) -> Result<(&'a [XOnlyKey], u8)> {
        let keys = self.record.covenant_keys()?;
        let quorum = self.record.covenant_quorum()?;
        if quorum as usize > keys.len() {
            return Err(Error::InvalidQuorum {
                quorum,
                keys: keys.len(),
            });
        }
        Ok((keys, quorum))
    }

    pub fn slashing_script(&self) -> Result<Vec<u8>> {
        let staker = self.record.staker_key()?;
        let fps = self.record.finality_providers()?;
        let (covenants, quorum) = self.committee()?;
        Ok(slashing_script(staker, fps, covenants, quorum))
    }

    pub fn unbonding_script(&self) -> Result<Vec<u8>> {
        let staker = self.record.staker_key()?;
        let (covenants, quorum) = self.committee()?;
        Ok(unbonding_script(staker, covenants, quorum))
    }

    pub fn timelock_script(&self) -> Result<Vec<u8>> {
        timelock_script(self.record.staker_key()?, self.record.timelock()?)
    }

    pub fn slashing_leaf(&self) -> Result<TapHash> {
        Ok(leaf_hash(self.crypto, &self.slashing_script()?))
    }

    pub fn unbonding_leaf(&self) -> Result<TapHash> {
        Ok(leaf_hash(self.crypto, &self.unbonding_script()?))
    }

    pub fn timelock_leaf(&self) -> Result<TapHash> {
        Ok(leaf_hash(self.crypto, &self.timelock_script()?))
    }

    /// All three leaves; fails without partial output if any field is missing
    pub fn leaves(&self) -> Result<StakingLeaves> {
        let leaves = StakingLeaves {
            slashing: self.slashing_leaf()?,
            unbonding: self.unbonding_leaf()?,
            timelock: self.timelock_leaf()?,
        };
        debug!(
            slashing = %leaves.slashing.to_hex(),
            unbonding = %leaves.unbonding.to_hex(),
            timelock = %leaves.timelock.to_hex(),
            "built staking leaves"
        );
        Ok(leaves)
    }

    pub fn staking_root(&self) -> Result<TapHash> {
        Ok(self.leaves()?.staking_root(self.crypto))
    }

    /// Root of the output left after unbonding; needs no unbonding fields
    pub fn post_unbonding_root(&self) -> Result<TapHash> {
        let slashing = self.slashing_leaf()?;
        let timelock = self.timelock_leaf()?;
        Ok(self.crypto.tap_branch(&slashing, &timelock))
    }
}
