//! BIP-32 derivation paths and the key-derivation capability

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::crypto::PublicKey;
use crate::error::{Error, Result};

/// Deepest path accepted from a parameter blob
pub const MAX_PATH_DEPTH: usize = 10;

/// Derivation path as carried in the parameter blob (u32 big-endian components)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivationPath {
    /// Path components; hardened indices have the high bit set
    pub components: [u32; MAX_PATH_DEPTH],
    /// Number of valid components
    pub depth: u8,
}

impl DerivationPath {
    /// BIP-32 hardened derivation bit
    pub const HARDENED: u32 = 0x80000000;

    /// Create a new derivation path from components
    pub fn new(components: &[u32]) -> Result<Self> {
        if components.is_empty() || components.len() > MAX_PATH_DEPTH {
            return Err(Error::InvalidDerivationPath(format!(
                "depth {} outside 1..={}",
                components.len(),
                MAX_PATH_DEPTH
            )));
        }
        let mut path = Self {
            components: [0; MAX_PATH_DEPTH],
            depth: components.len() as u8,
        };
        path.components[..components.len()].copy_from_slice(components);
        Ok(path)
    }

    /// Taproot staker path: m/86'/coin'/account'/change/index
    pub fn taproot(coin: u32, account: u32, change: u32, index: u32) -> Self {
        let mut components = [0; MAX_PATH_DEPTH];
        components[..5].copy_from_slice(&[
            86 | Self::HARDENED,
            coin | Self::HARDENED,
            account | Self::HARDENED,
            change,
            index,
        ]);
        Self {
            components,
            depth: 5,
        }
    }

    /// Native segwit path: m/84'/coin'/account'/change/index
    pub fn native_segwit(coin: u32, account: u32, change: u32, index: u32) -> Self {
        let mut components = [0; MAX_PATH_DEPTH];
        components[..5].copy_from_slice(&[
            84 | Self::HARDENED,
            coin | Self::HARDENED,
            account | Self::HARDENED,
            change,
            index,
        ]);
        Self {
            components,
            depth: 5,
        }
    }

    /// Decode a blob value: a non-empty run of big-endian u32s
    pub fn from_be_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return Err(Error::InvalidDerivationPath(format!(
                "length {} is not a positive multiple of 4",
                bytes.len()
            )));
        }
        let components: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(&components)
    }

    /// Encode as big-endian u32s
    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.as_slice()
            .iter()
            .flat_map(|c| c.to_be_bytes())
            .collect()
    }

    /// Valid components only
    pub fn as_slice(&self) -> &[u32] {
        &self.components[..self.depth as usize]
    }

    /// Address type selected by the first path component
    pub fn purpose(&self) -> Result<Purpose> {
        let first = self
            .as_slice()
            .first()
            .copied()
            .ok_or_else(|| Error::InvalidDerivationPath("empty path".to_string()))?;
        match first & !Self::HARDENED {
            84 => Ok(Purpose::NativeSegwit),
            86 => Ok(Purpose::Taproot),
            other => Err(Error::UnsupportedAction(format!(
                "derivation purpose {}",
                other
            ))),
        }
    }

    /// Get path as a string (e.g., "m/86'/1'/0'/0/0")
    pub fn to_string_path(&self) -> String {
        let mut path = String::from("m");
        for &component in self.as_slice() {
            if component & Self::HARDENED != 0 {
                path.push_str(&format!("/{}'", component & !Self::HARDENED));
            } else {
                path.push_str(&format!("/{}", component));
            }
        }
        path
    }
}

impl Zeroize for DerivationPath {
    fn zeroize(&mut self) {
        self.components.zeroize();
        self.depth.zeroize();
    }
}

/// BIP-44 style purpose field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Purpose {
    /// 84: P2WPKH, signer identified by a compressed key
    NativeSegwit,
    /// 86: P2TR, signer identified by an x-only key
    Taproot,
}

/// Key derivation capability provided by the host or secure element
pub trait KeyDerivation {
    /// Derive the compressed public key at `path`
    fn derive_pubkey(&self, path: &DerivationPath) -> Result<PublicKey>;
}

/// Deriver for hosts that always transmit the staker key; any path fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyDerivation;

impl KeyDerivation for NoKeyDerivation {
    fn derive_pubkey(&self, path: &DerivationPath) -> Result<PublicKey> {
        Err(Error::InvalidDerivationPath(format!(
            "no key derivation available for {}",
            path.to_string_path()
        )))
    }
}
