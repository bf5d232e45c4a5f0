#![no_main]

use libfuzzer_sys::fuzz_target;
use stakeguard_core::tlv::{decode, parse_blob};
use stakeguard_core::SessionRecord;

fuzz_target!(|data: &[u8]| {
    let mut session = SessionRecord::new();

    // Parsing must never panic; a failed parse leaves nothing behind
    match parse_blob(&mut session, data) {
        Ok(()) => {
            let again = decode(data).unwrap();
            assert_eq!(session, again);

            if let (Some(covs), Some(quorum)) = (&session.covenant_keys, session.covenant_quorum) {
                assert!(quorum as usize <= covs.len());
            }
        }
        Err(_) => assert!(session.is_empty()),
    }
});
