//! Hashing and taproot key-tweak primitives
//!
//! Verification code reaches these through the [`TaprootCrypto`] trait so a
//! host with a secure element can route them to its own implementation.
//! [`K256Backend`] is the pure software backend built on `k256` and `sha2`.

use k256::{
    elliptic_curve::{sec1::ToEncodedPoint, PrimeField},
    FieldBytes, ProjectivePoint, Scalar,
};
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::types::{hex_bytes_33, Parity, TapHash, XOnlyKey};

/// BIP-341 tag for leaf hashes
pub const TAG_TAP_LEAF: &[u8] = b"TapLeaf";
/// BIP-341 tag for branch hashes
pub const TAG_TAP_BRANCH: &[u8] = b"TapBranch";
/// BIP-341 tag for the output key tweak
pub const TAG_TAP_TWEAK: &[u8] = b"TapTweak";
/// BIP-322 tag for the message hash
pub const TAG_BIP322_MESSAGE: &[u8] = b"BIP0322-signed-message";

/// Compressed public key (33 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "hex_bytes_33")] pub [u8; 33]);

impl PublicKey {
    /// Create a new PublicKey from compressed bytes
    pub fn new(bytes: [u8; 33]) -> Self {
        Self(bytes)
    }

    /// Get the compressed bytes
    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 33];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| Error::Crypto(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Drop the parity prefix, keeping the 32-byte x coordinate
    pub fn x_only(&self) -> XOnlyKey {
        let mut x = [0u8; 32];
        x.copy_from_slice(&self.0[1..]);
        XOnlyKey::new(x)
    }

    /// Check the bytes decode to a point on secp256k1
    pub fn validate(&self) -> Result<()> {
        k256::PublicKey::from_sec1_bytes(&self.0)
            .map(|_| ())
            .map_err(|e| Error::Crypto(format!("Invalid public key: {}", e)))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Zeroize for PublicKey {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Hash and tweak operations consumed by script building and verification
pub trait TaprootCrypto {
    /// SHA256(SHA256(tag) || SHA256(tag) || payload)
    fn tagged_hash(&self, tag: &[u8], payload: &[u8]) -> [u8; 32];

    /// Tweak an x-only internal key by a merkle root (BIP-341 output key)
    fn tweak_pubkey(&self, internal: &XOnlyKey, merkle_root: &TapHash)
        -> Result<(XOnlyKey, Parity)>;

    /// SHA256(SHA256(data))
    fn sha256d(&self, data: &[u8]) -> [u8; 32];

    /// RIPEMD160(SHA256(data))
    fn hash160(&self, data: &[u8]) -> [u8; 20];

    /// Combine two tree nodes, ordering them lexicographically first
    fn tap_branch(&self, a: &TapHash, b: &TapHash) -> TapHash {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let mut payload = [0u8; 64];
        payload[..32].copy_from_slice(lo.as_bytes());
        payload[32..].copy_from_slice(hi.as_bytes());
        TapHash::new(self.tagged_hash(TAG_TAP_BRANCH, &payload))
    }
}

/// Software backend over `k256`, `sha2` and `ripemd`
#[derive(Debug, Clone, Copy, Default)]
pub struct K256Backend;

impl TaprootCrypto for K256Backend {
    fn tagged_hash(&self, tag: &[u8], payload: &[u8]) -> [u8; 32] {
        tagged_hash(tag, payload)
    }

    fn tweak_pubkey(
        &self,
        internal: &XOnlyKey,
        merkle_root: &TapHash,
    ) -> Result<(XOnlyKey, Parity)> {
        let mut sec1 = [0u8; 33];
        sec1[0] = 0x02;
        sec1[1..].copy_from_slice(internal.as_bytes());
        let point = k256::PublicKey::from_sec1_bytes(&sec1).map_err(|_| {
            Error::Crypto(format!("internal key {} is not on the curve", internal.short()))
        })?;

        let t = tagged_hash(
            TAG_TAP_TWEAK,
            &sha_concat(internal.as_bytes(), merkle_root.as_bytes()),
        );
        let scalar: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(&t)).into();
        let scalar =
            scalar.ok_or_else(|| Error::Crypto("tweak exceeds the curve order".to_string()))?;

        let tweaked = point.to_projective() + ProjectivePoint::GENERATOR * scalar;
        if tweaked == ProjectivePoint::IDENTITY {
            return Err(Error::Crypto("tweaked key is the point at infinity".to_string()));
        }

        let encoded = tweaked.to_affine().to_encoded_point(true);
        let bytes = encoded.as_bytes();
        if bytes.len() != 33 {
            return Err(Error::Crypto("unexpected tweaked key encoding".to_string()));
        }
        let mut x = [0u8; 32];
        x.copy_from_slice(&bytes[1..]);
        let parity = if bytes[0] == 0x03 {
            Parity::Odd
        } else {
            Parity::Even
        };
        Ok((XOnlyKey::new(x), parity))
    }

    fn sha256d(&self, data: &[u8]) -> [u8; 32] {
        sha256(&sha256(data))
    }

    fn hash160(&self, data: &[u8]) -> [u8; 20] {
        Ripemd160::digest(sha256(data)).into()
    }
}

fn sha_concat(a: &[u8; 32], b: &[u8; 32]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(a);
    out[32..].copy_from_slice(b);
    out
}

/// Hash data using SHA256
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// BIP-340 tagged hash
pub fn tagged_hash(tag: &[u8], payload: &[u8]) -> [u8; 32] {
    let tag_hash = sha256(tag);
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(payload);
    hasher.finalize().into()
}
