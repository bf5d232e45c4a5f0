#![no_main]

use libfuzzer_sys::fuzz_target;
use stakeguard_core::hd::{DerivationPath, MAX_PATH_DEPTH};

fuzz_target!(|data: &[u8]| {
    // Blob encoding: big-endian u32 components
    if let Ok(path) = DerivationPath::from_be_bytes(data) {
        assert!(path.depth as usize >= 1);
        assert!(path.depth as usize <= MAX_PATH_DEPTH);
        assert_eq!(data.len(), path.depth as usize * 4);

        // Round-trip
        let reserialized = path.to_be_bytes();
        assert_eq!(reserialized, data);
        let path2 = DerivationPath::from_be_bytes(&reserialized).unwrap();
        assert_eq!(path, path2);

        // These should not panic
        let _ = path.to_string_path();
        let _ = path.purpose();
    }

    // Try creating from components
    if !data.is_empty() {
        let num_components = (data[0] % 12) as usize;
        if data.len() >= 1 + num_components * 4 {
            let components: Vec<u32> = data[1..1 + num_components * 4]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();

            let valid = (1..=MAX_PATH_DEPTH).contains(&num_components);
            match DerivationPath::new(&components) {
                Ok(path) => {
                    assert!(valid);
                    assert_eq!(path.as_slice(), &components[..]);
                }
                Err(_) => assert!(!valid),
            }
        }
    }
});
