//! Read-only view of the transaction being signed
//!
//! The host owns PSBT parsing; verification only needs the values below.

use crate::error::{Error, Result};
use crate::types::{TapHash, Txid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub script_pubkey: Vec<u8>,
    pub amount: u64,
}

impl TxOutput {
    pub fn new(script_pubkey: Vec<u8>, amount: u64) -> Self {
        Self {
            script_pubkey,
            amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    /// Previous transaction id, internal byte order
    pub prev_txid: Txid,
    pub prev_vout: u32,
    /// Value of the spent output (witness UTXO amount)
    pub amount: u64,
    /// Tapleaf the input declares it is spent through, if any
    pub tap_leaf_hash: Option<TapHash>,
}

impl TxInput {
    pub fn new(prev_txid: Txid, prev_vout: u32, amount: u64) -> Self {
        Self {
            prev_txid,
            prev_vout,
            amount,
            tap_leaf_hash: None,
        }
    }

    pub fn with_tap_leaf(mut self, leaf: TapHash) -> Self {
        self.tap_leaf_hash = Some(leaf);
        self
    }
}

/// Transaction access consumed by the verifiers
pub trait TxView {
    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    fn get_output(&self, index: usize) -> Result<TxOutput>;

    fn get_input(&self, index: usize) -> Result<TxInput>;

    fn inputs_total_amount(&self) -> Result<u64> {
        (0..self.input_count()).try_fold(0u64, |acc, i| {
            acc.checked_add(self.get_input(i)?.amount)
                .ok_or_else(|| Error::StructuralMismatch("input amounts overflow".to_string()))
        })
    }

    fn outputs_total_amount(&self) -> Result<u64> {
        (0..self.output_count()).try_fold(0u64, |acc, i| {
            acc.checked_add(self.get_output(i)?.amount)
                .ok_or_else(|| Error::StructuralMismatch("output amounts overflow".to_string()))
        })
    }
}

/// Owned transaction summary filled in by the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxSummary {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl TxSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: TxInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_output(mut self, output: TxOutput) -> Self {
        self.outputs.push(output);
        self
    }
}

impl TxView for TxSummary {
    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn get_output(&self, index: usize) -> Result<TxOutput> {
        self.outputs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::StructuralMismatch(format!("no output at index {}", index)))
    }

    fn get_input(&self, index: usize) -> Result<TxInput> {
        self.inputs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::StructuralMismatch(format!("no input at index {}", index)))
    }
}
