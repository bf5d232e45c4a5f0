//! BIP-322 proof-of-possession: rebuilds the virtual `to_spend` transaction
//! for a message and checks its id against the transaction being signed.

use bech32::{Bech32, Hrp};
use tracing::{debug, instrument, warn};

use crate::crypto::{PublicKey, TaprootCrypto, TAG_BIP322_MESSAGE};
use crate::error::{Error, Result};
use crate::hd::Purpose;
use crate::script::{OP_0, OP_1, OP_PUSHBYTES_20, OP_PUSHBYTES_32};
use crate::session::{require, MessageKey, SessionRecord};
use crate::tx::TxView;
use crate::types::{Txid, XOnlyKey};

/// Human-readable prefix the message is re-encoded under
pub const MESSAGE_HRP: &str = "bbn";

/// Byte offset of the message hash in the `to_spend` serialization
pub const MESSAGE_HASH_OFFSET: usize = 44;
/// Byte offset of the signer key (or key hash) in the `to_spend` serialization
pub const SIGNER_KEY_OFFSET: usize = 92;

/// Key the message is attributed to, shaped by address type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerKey {
    /// P2TR: x-only output key
    Taproot(XOnlyKey),
    /// P2WPKH: compressed key, hashed into the witness program
    NativeSegwit(PublicKey),
}

/// Bech32 encoding of the raw message bytes under [`MESSAGE_HRP`]
pub fn encode_message(message: &[u8]) -> Result<String> {
    let hrp = Hrp::parse(MESSAGE_HRP).map_err(|e| Error::Crypto(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, message)
        .map_err(|e| Error::Crypto(format!("bech32 encoding failed: {}", e)))
}

/// Tagged hash of the bech32 string
pub fn message_hash<C: TaprootCrypto + ?Sized>(crypto: &C, message: &[u8]) -> Result<[u8; 32]> {
    let encoded = encode_message(message)?;
    Ok(crypto.tagged_hash(TAG_BIP322_MESSAGE, encoded.as_bytes()))
}

/// Legacy serialization of the `to_spend` transaction
pub fn to_spend_tx<C: TaprootCrypto + ?Sized>(
    crypto: &C,
    message_hash: &[u8; 32],
    signer: &SignerKey,
) -> Vec<u8> {
    let mut tx = Vec::with_capacity(128);
    // version, one input spending 000..000:0xffffffff
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx.push(0x01);
    tx.extend_from_slice(&[0u8; 32]);
    tx.extend_from_slice(&u32::MAX.to_le_bytes());
    // scriptSig: OP_0 PUSH32 <message hash>
    tx.push(0x22);
    tx.push(OP_0);
    tx.push(OP_PUSHBYTES_32);
    tx.extend_from_slice(message_hash);
    tx.extend_from_slice(&0u32.to_le_bytes());
    // one zero-value output paying the signer
    tx.push(0x01);
    tx.extend_from_slice(&0u64.to_le_bytes());
    match signer {
        SignerKey::Taproot(key) => {
            tx.push(0x22);
            tx.push(OP_1);
            tx.push(OP_PUSHBYTES_32);
            tx.extend_from_slice(key.as_bytes());
        }
        SignerKey::NativeSegwit(key) => {
            tx.push(0x16);
            tx.push(OP_0);
            tx.push(OP_PUSHBYTES_20);
            tx.extend_from_slice(&crypto.hash160(key.as_bytes()));
        }
    }
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx
}

/// Id of the `to_spend` transaction for `message` and `signer`
pub fn to_spend_txid<C: TaprootCrypto + ?Sized>(
    crypto: &C,
    message: &[u8],
    signer: &SignerKey,
) -> Result<Txid> {
    let hash = message_hash(crypto, message)?;
    let tx = to_spend_tx(crypto, &hash, signer);
    Ok(Txid::new(crypto.sha256d(&tx)))
}

/// Pick the signer key for `purpose` from the transmitted message key and
/// the key derived from the session path; when both exist they must agree
pub fn resolve_signer(
    purpose: Purpose,
    message_key: Option<&MessageKey>,
    derived: Option<&PublicKey>,
) -> Result<SignerKey> {
    if let (Some(claimed), Some(derived)) = (message_key, derived) {
        let agrees = match claimed {
            MessageKey::XOnly(k) => *k == derived.x_only(),
            MessageKey::Compressed(k) => k == derived,
        };
        if !agrees {
            return Err(Error::IdentityMismatch(
                "message key differs from the derived key".to_string(),
            ));
        }
    }

    match purpose {
        Purpose::Taproot => match (message_key, derived) {
            (Some(MessageKey::XOnly(k)), _) => Ok(SignerKey::Taproot(*k)),
            (Some(MessageKey::Compressed(k)), _) => Ok(SignerKey::Taproot(k.x_only())),
            (None, Some(k)) => Ok(SignerKey::Taproot(k.x_only())),
            (None, None) => Err(Error::MissingField("message_key")),
        },
        Purpose::NativeSegwit => match (message_key, derived) {
            (Some(MessageKey::Compressed(k)), _) => Ok(SignerKey::NativeSegwit(*k)),
            (_, Some(k)) => Ok(SignerKey::NativeSegwit(*k)),
            (Some(MessageKey::XOnly(_)), None) => Err(Error::IdentityMismatch(
                "a P2WPKH signer needs a compressed key".to_string(),
            )),
            (None, None) => Err(Error::MissingField("message_key")),
        },
    }
}

pub struct MessageIdentityVerifier<'a, C: TaprootCrypto + ?Sized> {
    crypto: &'a C,
}

impl<'a, C: TaprootCrypto + ?Sized> MessageIdentityVerifier<'a, C> {
    pub fn new(crypto: &'a C) -> Self {
        Self { crypto }
    }

    /// Input 0 of `tx` must spend the `to_spend` transaction for the session
    /// message; a txid carried in the blob must agree as well
    #[instrument(skip_all)]
    pub fn verify<T: TxView + ?Sized>(
        &self,
        record: &SessionRecord,
        signer: &SignerKey,
        tx: &T,
    ) -> Result<Txid> {
        let message = require(&record.message, "message")?;
        let derived = to_spend_txid(self.crypto, message, signer)?;
        let spent = tx.get_input(0)?.prev_txid;

        if derived != spent {
            warn!(
                derived = %derived.to_hex(),
                spent = %spent.to_hex(),
                "to_spend id does not match input 0"
            );
            return Err(Error::IdentityMismatch(
                "input 0 does not spend the message's to_spend transaction".to_string(),
            ));
        }
        if let Some(explicit) = record.txid {
            if explicit != derived {
                warn!(explicit = %explicit.to_hex(), "blob txid disagrees with message");
                return Err(Error::IdentityMismatch(
                    "txid record does not match the message".to_string(),
                ));
            }
        }
        debug!(txid = %derived.to_display_hex(), "message identity verified");
        Ok(derived)
    }
}
