//! Output and fee checks for each staking action
//!
//! Every protocol output is a key-path-disabled taproot output: the NUMS key
//! tweaked by the root of the relevant script tree, serialized as
//! `OP_1 PUSH32 <key>`.

use tracing::{debug, warn};

use crate::config::PolicyConfig;
use crate::crypto::TaprootCrypto;
use crate::error::{Error, Result};
use crate::script::{ScriptBuilder, OP_1, OP_PUSHBYTES_32, OP_RETURN};
use crate::session::{require, SessionRecord};
use crate::tx::TxView;
use crate::types::{TapHash, XOnlyKey};

/// BIP-341 unspendable internal key `lift_x(SHA256(G))`
pub const NUMS_KEY: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a, 0x5e,
    0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a, 0xc0,
];

pub fn nums_key() -> XOnlyKey {
    XOnlyKey::new(NUMS_KEY)
}

/// `OP_1 PUSH32 <key>`
pub fn taproot_script_pubkey(key: &XOnlyKey) -> Vec<u8> {
    let mut spk = Vec::with_capacity(34);
    spk.push(OP_1);
    spk.push(OP_PUSHBYTES_32);
    spk.extend_from_slice(key.as_bytes());
    spk
}

/// inputs_total - outputs_total, rejecting transactions that create value
pub fn compute_fee<T: TxView + ?Sized>(tx: &T) -> Result<u64> {
    let inputs = tx.inputs_total_amount()?;
    let outputs = tx.outputs_total_amount()?;
    inputs.checked_sub(outputs).ok_or_else(|| {
        Error::FeePolicyViolation(format!(
            "outputs ({} sats) exceed inputs ({} sats)",
            outputs, inputs
        ))
    })
}

pub struct AddressVerifier<'a, C: TaprootCrypto + ?Sized> {
    crypto: &'a C,
    config: &'a PolicyConfig,
}

impl<'a, C: TaprootCrypto + ?Sized> AddressVerifier<'a, C> {
    pub fn new(crypto: &'a C, config: &'a PolicyConfig) -> Self {
        Self { crypto, config }
    }

    /// NUMS key tweaked by `root`
    pub fn expected_output_key(&self, root: &TapHash) -> Result<XOnlyKey> {
        let (key, _parity) = self.crypto.tweak_pubkey(&nums_key(), root)?;
        Ok(key)
    }

    /// Output `index` must be exactly `OP_1 PUSH32 <expected>`
    pub fn check_taproot_output<T: TxView + ?Sized>(
        &self,
        tx: &T,
        index: usize,
        expected: &XOnlyKey,
        what: &str,
    ) -> Result<()> {
        let output = tx.get_output(index)?;
        let spk = &output.script_pubkey;
        if spk.len() != 34 || spk[0] != OP_1 || spk[1] != OP_PUSHBYTES_32 {
            warn!(index, what, "output is not a taproot output");
            return Err(Error::ScriptMismatch(format!(
                "output {} ({}) is not a taproot output",
                index, what
            )));
        }
        if spk[2..] != expected.as_bytes()[..] {
            warn!(
                index,
                what,
                expected = %expected.to_hex(),
                actual = %hex::encode(&spk[2..]),
                "output key mismatch"
            );
            return Err(Error::ScriptMismatch(format!(
                "output {} ({}) does not commit to the expected scripts",
                index, what
            )));
        }
        debug!(index, what, key = %expected.short(), "output key matches");
        Ok(())
    }

    fn bounded_limit(&self, limit: u64, name: &str) -> Result<u64> {
        if let Some(bounds) = self.config.fee_limit_bounds {
            if !bounds.contains(limit) {
                return Err(Error::FeePolicyViolation(format!(
                    "{} fee limit {} outside {}..={}",
                    name, limit, bounds.min, bounds.max
                )));
            }
        }
        Ok(limit)
    }

    /// Output 0 commits to the full staking tree
    pub fn verify_staking<T: TxView + ?Sized>(
        &self,
        record: &SessionRecord,
        tx: &T,
    ) -> Result<()> {
        let root = ScriptBuilder::new(record, self.crypto).staking_root()?;
        let expected = self.expected_output_key(&root)?;
        self.check_taproot_output(tx, 0, &expected, "staking")
    }

    /// Burn output 0, timelocked change output 1 and a fee of at least the limit
    pub fn verify_slashing<T: TxView + ?Sized>(
        &self,
        record: &SessionRecord,
        tx: &T,
    ) -> Result<u64> {
        let limit = self.bounded_limit(
            *require(&record.slashing_fee_limit, "slashing_fee_limit")?,
            "slashing",
        )?;
        let burn = require(&record.burn_address, "burn_address")?;

        let fee = compute_fee(tx)?;
        if fee < limit {
            warn!(fee, limit, "slashing fee below limit");
            return Err(Error::FeePolicyViolation(format!(
                "slashing fee {} is below the limit {}",
                fee, limit
            )));
        }

        // output 1 is tweaked by the timelock leaf hash alone, not a branch
        let timelock_leaf = ScriptBuilder::new(record, self.crypto).timelock_leaf()?;
        let expected = self.expected_output_key(&timelock_leaf)?;
        self.check_taproot_output(tx, 1, &expected, "slashing change")?;

        let burn_output = tx.get_output(0)?;
        if burn_output.script_pubkey != *burn {
            warn!(
                expected = %hex::encode(burn),
                actual = %hex::encode(&burn_output.script_pubkey),
                "burn output mismatch"
            );
            return Err(Error::ScriptMismatch(
                "output 0 does not pay the burn address".to_string(),
            ));
        }
        if self.config.network.requires_op_return_burn()
            && burn_output.script_pubkey.first() != Some(&OP_RETURN)
        {
            return Err(Error::ScriptMismatch(
                "burn output must be OP_RETURN on mainnet".to_string(),
            ));
        }
        Ok(fee)
    }

    /// Output 0 commits to the post-unbonding tree and the fee is exactly the limit
    pub fn verify_unbond<T: TxView + ?Sized>(&self, record: &SessionRecord, tx: &T) -> Result<u64> {
        let limit = self.bounded_limit(
            *require(&record.unbonding_fee_limit, "unbonding_fee_limit")?,
            "unbonding",
        )?;

        let fee = compute_fee(tx)?;
        if fee != limit {
            warn!(fee, limit, "unbonding fee differs from limit");
            return Err(Error::FeePolicyViolation(format!(
                "unbonding fee {} must equal {}",
                fee, limit
            )));
        }

        let root = ScriptBuilder::new(record, self.crypto).post_unbonding_root()?;
        let expected = self.expected_output_key(&root)?;
        self.check_taproot_output(tx, 0, &expected, "unbonding")?;
        Ok(fee)
    }

    /// Staking output check plus input 0 spending the previous stake through
    /// the unbonding leaf
    pub fn verify_expansion<T: TxView + ?Sized>(
        &self,
        record: &SessionRecord,
        tx: &T,
    ) -> Result<TapHash> {
        let builder = ScriptBuilder::new(record, self.crypto);
        let leaves = builder.leaves()?;
        let expected = self.expected_output_key(&leaves.staking_root(self.crypto))?;
        self.check_taproot_output(tx, 0, &expected, "expanded staking")?;

        let previous = tx.get_input(0)?;
        if previous.tap_leaf_hash != Some(leaves.unbonding) {
            warn!(
                declared = ?previous.tap_leaf_hash.map(|h| h.to_hex()),
                "input 0 does not spend through the unbonding leaf"
            );
            return Err(Error::ScriptMismatch(
                "input 0 must spend the previous stake through the unbonding leaf".to_string(),
            ));
        }

        let funding = tx.get_input(1)?;
        if let Some(leaf) = funding.tap_leaf_hash {
            warn!(declared = %leaf.to_hex(), "input 1 spends through a tapleaf");
            return Err(Error::ScriptMismatch(
                "input 1 must be a plain funding output".to_string(),
            ));
        }
        Ok(leaves.unbonding)
    }
}
