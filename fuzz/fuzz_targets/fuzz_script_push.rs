#![no_main]

use libfuzzer_sys::fuzz_target;
use stakeguard_core::script::{push_int, read_push_int, timelock_script, MAX_TIMELOCK};
use stakeguard_core::XOnlyKey;

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 {
        return;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[..8]);
    let value = i64::from_le_bytes(raw);

    // Minimal encoding round-trips
    let encoded = push_int(value);
    let (decoded, used) = read_push_int(&encoded).unwrap();
    assert_eq!(decoded, value);
    assert_eq!(used, encoded.len());

    // Decoding arbitrary bytes should not panic
    let _ = read_push_int(&data[8..]);

    let timelock = value as u64;
    let staker = XOnlyKey::new([0x02; 32]);
    let valid = timelock != 0 && timelock <= MAX_TIMELOCK;
    assert_eq!(timelock_script(&staker, timelock).is_ok(), valid);
});
