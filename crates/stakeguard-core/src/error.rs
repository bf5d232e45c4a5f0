//! Error types for stakeguard

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures while decoding the tagged parameter blob
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    /// Fewer than three bytes left where a record header was expected
    #[error("truncated record header at offset {offset}")]
    TruncatedHeader { offset: usize },

    /// Declared value length runs past the end of the buffer
    #[error("tag 0x{tag:02x} declares {declared} bytes but only {remaining} remain")]
    TruncatedValue {
        tag: u8,
        declared: usize,
        remaining: usize,
    },

    /// Value length not allowed for this tag
    #[error("tag 0x{tag:02x} has invalid length {len}")]
    InvalidLength { tag: u8, len: usize },

    #[error("unknown tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("tag 0x{0:02x} appears more than once")]
    DuplicateTag(u8),

    /// Key list larger than the protocol maximum
    #[error("tag 0x{tag:02x} carries {count} keys (max {max})")]
    TooManyKeys { tag: u8, count: usize, max: usize },

    /// Count record disagrees with the list it describes
    #[error("{field}: count record says {declared}, list holds {actual}")]
    CountMismatch {
        field: &'static str,
        declared: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed, truncated or oversized parameter blob
    #[error("Parse error: {0}")]
    Parse(#[from] BlobError),

    /// A field the requested action needs was not supplied
    #[error("Missing field: {0}")]
    MissingField(&'static str),

    /// Input or output cardinality violates the action contract
    #[error("Structural mismatch: {0}")]
    StructuralMismatch(String),

    /// Reconstructed script differs from the declared output
    #[error("Script mismatch: {0}")]
    ScriptMismatch(String),

    #[error("Fee policy violation: {0}")]
    FeePolicyViolation(String),

    /// BIP-322 derived id or derived key does not match
    #[error("Identity mismatch: {0}")]
    IdentityMismatch(String),

    /// Unrecognized action code or derivation path purpose
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("Invalid timelock: {0}")]
    InvalidTimelock(u64),

    #[error("Invalid covenant quorum {quorum} for {keys} keys")]
    InvalidQuorum { quorum: u8, keys: usize },

    /// Finality-provider or covenant set changed between processing steps
    #[error("Key set mismatch: {0}")]
    KeySetMismatch(String),

    #[error("Invalid derivation path: {0}")]
    InvalidDerivationPath(String),

    /// Operation called in the wrong session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
