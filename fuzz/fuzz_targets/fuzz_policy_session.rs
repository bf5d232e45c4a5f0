#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stakeguard_core::{
    NoKeyDerivation, PolicyConfig, PolicyEngine, PolicyState, TxInput, TxOutput, TxSummary, Txid,
};

#[derive(Debug, Arbitrary)]
struct SessionInput {
    blob: Vec<u8>,
    inputs: Vec<([u8; 32], u32, u64)>,
    outputs: Vec<(Vec<u8>, u64)>,
}

fuzz_target!(|input: SessionInput| {
    let mut engine = PolicyEngine::new(PolicyConfig::default());
    if engine.load_params(&input.blob).is_err() {
        assert_eq!(engine.state(), PolicyState::Rejected);
        assert!(engine.session().is_empty());
        return;
    }

    let mut tx = TxSummary::new();
    for (txid, vout, amount) in input.inputs.into_iter().take(4) {
        tx = tx.with_input(TxInput::new(Txid::new(txid), vout, amount));
    }
    for (spk, amount) in input.outputs.into_iter().take(4) {
        tx = tx.with_output(TxOutput::new(spk, amount));
    }

    // Any outcome is fine as long as a rejection wipes the session
    if engine.verify(&tx, &NoKeyDerivation).is_err() {
        assert_eq!(engine.state(), PolicyState::Rejected);
        assert!(engine.session().is_empty());
        assert!(!engine.key_cache().is_populated());
    }
});
