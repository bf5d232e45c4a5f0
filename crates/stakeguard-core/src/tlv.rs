//! Parameter blob codec
//!
//! The blob is a run of `tag(1) || len(2, BE) || value(len)` records. Parsing
//! is strict: unknown or repeated tags, bad lengths and truncation all abort
//! the parse and leave the session record empty.

use tracing::{debug, instrument, warn};

use crate::crypto::PublicKey;
use crate::error::{BlobError, Error, Result};
use crate::hd::{DerivationPath, MAX_PATH_DEPTH};
use crate::session::{Action, MessageKey, SessionRecord};
use crate::types::{Txid, XOnlyKey};

/// Record tags
pub mod tag {
    pub const ACTION: u8 = 0x77;
    pub const FP_COUNT: u8 = 0xf9;
    pub const FP_LIST: u8 = 0xf8;
    pub const COV_KEY_COUNT: u8 = 0xc0;
    pub const COV_KEY_LIST: u8 = 0xc1;
    pub const STAKER_PK: u8 = 0x51;
    pub const COV_QUORUM: u8 = 0x01;
    pub const TIMELOCK: u8 = 0x71;
    pub const SLASHING_FEE_LIMIT: u8 = 0xfe;
    pub const UNBONDING_FEE_LIMIT: u8 = 0xff;
    pub const MESSAGE: u8 = 0x6d;
    pub const MESSAGE_KEY: u8 = 0x6b;
    pub const TXID: u8 = 0x74;
    pub const BURN_ADDRESS: u8 = 0xb0;
    pub const DERIVATION_PATH: u8 = 0x70;
}

/// Most keys accepted in a finality-provider or covenant list
pub const MAX_KEYS: usize = 16;
/// Longest message accepted for signing
pub const MAX_MESSAGE_LEN: usize = 40;
/// Longest burn scriptPubKey accepted
pub const MAX_BURN_ADDRESS_LEN: usize = 32;

const HEADER_LEN: usize = 3;

/// Reset `record`, then fill it from `data`
///
/// On failure the record is left empty, never half-populated.
#[instrument(skip_all, fields(len = data.len()))]
pub fn parse_blob(record: &mut SessionRecord, data: &[u8]) -> Result<()> {
    record.clear();
    match decode(data) {
        Ok(parsed) => {
            debug!(action = ?parsed.action, "parameter blob accepted");
            *record = parsed;
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "parameter blob rejected");
            Err(e)
        }
    }
}

/// Decode a blob into a fresh record
pub fn decode(data: &[u8]) -> Result<SessionRecord> {
    let mut record = SessionRecord::default();
    let mut seen = [false; 256];
    let mut fp_count: Option<usize> = None;
    let mut cov_count: Option<usize> = None;

    let mut offset = 0;
    while offset < data.len() {
        if data.len() - offset < HEADER_LEN {
            return Err(BlobError::TruncatedHeader { offset }.into());
        }
        let tag = data[offset];
        let declared = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
        let start = offset + HEADER_LEN;
        let remaining = data.len() - start;
        if declared > remaining {
            return Err(BlobError::TruncatedValue {
                tag,
                declared,
                remaining,
            }
            .into());
        }
        if std::mem::replace(&mut seen[tag as usize], true) {
            return Err(BlobError::DuplicateTag(tag).into());
        }

        let value = &data[start..start + declared];
        match tag {
            tag::ACTION => {
                let [code] = fixed::<1>(tag, value)?;
                record.action = Some(Action::from_code(code)?);
            }
            tag::FP_COUNT => fp_count = Some(fixed::<1>(tag, value)?[0] as usize),
            tag::FP_LIST => record.finality_providers = Some(key_list(tag, value)?),
            tag::COV_KEY_COUNT => cov_count = Some(fixed::<1>(tag, value)?[0] as usize),
            tag::COV_KEY_LIST => record.covenant_keys = Some(key_list(tag, value)?),
            tag::STAKER_PK => record.staker_key = Some(XOnlyKey::new(fixed(tag, value)?)),
            tag::COV_QUORUM => record.covenant_quorum = Some(fixed::<1>(tag, value)?[0]),
            tag::TIMELOCK => record.timelock = Some(u64::from_be_bytes(fixed(tag, value)?)),
            tag::SLASHING_FEE_LIMIT => {
                record.slashing_fee_limit = Some(u64::from_be_bytes(fixed(tag, value)?))
            }
            tag::UNBONDING_FEE_LIMIT => {
                record.unbonding_fee_limit = Some(u64::from_be_bytes(fixed(tag, value)?))
            }
            tag::MESSAGE => {
                if value.len() > MAX_MESSAGE_LEN {
                    return Err(invalid_length(tag, value));
                }
                record.message = Some(value.to_vec());
            }
            tag::MESSAGE_KEY => {
                record.message_key = Some(match value.len() {
                    32 => MessageKey::XOnly(XOnlyKey::new(fixed(tag, value)?)),
                    33 => MessageKey::Compressed(PublicKey::new(fixed(tag, value)?)),
                    _ => return Err(invalid_length(tag, value)),
                });
            }
            tag::TXID => record.txid = Some(Txid::new(fixed(tag, value)?)),
            tag::BURN_ADDRESS => {
                if value.is_empty() || value.len() > MAX_BURN_ADDRESS_LEN {
                    return Err(invalid_length(tag, value));
                }
                record.burn_address = Some(value.to_vec());
            }
            tag::DERIVATION_PATH => {
                if value.is_empty() || value.len() % 4 != 0 || value.len() / 4 > MAX_PATH_DEPTH {
                    return Err(invalid_length(tag, value));
                }
                record.derivation_path = Some(DerivationPath::from_be_bytes(value)?);
            }
            unknown => return Err(BlobError::UnknownTag(unknown).into()),
        }
        offset = start + declared;
    }

    check_count("finality_providers", fp_count, &record.finality_providers)?;
    check_count("covenant_keys", cov_count, &record.covenant_keys)?;
    if let (Some(quorum), Some(keys)) = (record.covenant_quorum, &record.covenant_keys) {
        if quorum as usize > keys.len() {
            return Err(Error::InvalidQuorum {
                quorum,
                keys: keys.len(),
            });
        }
    }
    Ok(record)
}

fn invalid_length(tag: u8, value: &[u8]) -> Error {
    BlobError::InvalidLength {
        tag,
        len: value.len(),
    }
    .into()
}

fn fixed<const N: usize>(tag: u8, value: &[u8]) -> std::result::Result<[u8; N], BlobError> {
    value.try_into().map_err(|_| BlobError::InvalidLength {
        tag,
        len: value.len(),
    })
}

fn key_list(tag: u8, value: &[u8]) -> std::result::Result<Vec<XOnlyKey>, BlobError> {
    if value.len() % 32 != 0 {
        return Err(BlobError::InvalidLength {
            tag,
            len: value.len(),
        });
    }
    let count = value.len() / 32;
    if count > MAX_KEYS {
        return Err(BlobError::TooManyKeys {
            tag,
            count,
            max: MAX_KEYS,
        });
    }
    Ok(value
        .chunks_exact(32)
        .map(|chunk| {
            let mut key = [0u8; 32];
            key.copy_from_slice(chunk);
            XOnlyKey::new(key)
        })
        .collect())
}

fn check_count(
    field: &'static str,
    declared: Option<usize>,
    list: &Option<Vec<XOnlyKey>>,
) -> std::result::Result<(), BlobError> {
    if let (Some(declared), Some(list)) = (declared, list) {
        if declared != list.len() {
            return Err(BlobError::CountMismatch {
                field,
                declared,
                actual: list.len(),
            });
        }
    }
    Ok(())
}

/// Builder for parameter blobs, used by hosts and tests
#[derive(Debug, Clone, Default)]
pub struct BlobWriter {
    buf: Vec<u8>,
}

impl BlobWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one record
    ///
    /// `value` must fit a u16 length; debug builds panic otherwise.
    pub fn raw(mut self, tag: u8, value: &[u8]) -> Self {
        debug_assert!(
            value.len() <= u16::MAX as usize,
            "tag 0x{:02x} value of {} bytes does not fit a record",
            tag,
            value.len()
        );
        let len = value.len().min(u16::MAX as usize);
        self.buf.push(tag);
        self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        self.buf.extend_from_slice(&value[..len]);
        self
    }

    pub fn action(self, action: Action) -> Self {
        self.raw(tag::ACTION, &[action.code()])
    }

    /// Count and list records for the finality providers
    pub fn finality_providers(self, keys: &[XOnlyKey]) -> Self {
        self.raw(tag::FP_COUNT, &[count_byte(keys)])
            .raw(tag::FP_LIST, &concat_keys(keys))
    }

    /// Count, list and quorum records for the covenant committee
    pub fn covenant(self, keys: &[XOnlyKey], quorum: u8) -> Self {
        self.raw(tag::COV_KEY_COUNT, &[count_byte(keys)])
            .raw(tag::COV_KEY_LIST, &concat_keys(keys))
            .raw(tag::COV_QUORUM, &[quorum])
    }

    pub fn staker_key(self, key: &XOnlyKey) -> Self {
        self.raw(tag::STAKER_PK, key.as_bytes())
    }

    pub fn timelock(self, timelock: u64) -> Self {
        self.raw(tag::TIMELOCK, &timelock.to_be_bytes())
    }

    pub fn slashing_fee_limit(self, sats: u64) -> Self {
        self.raw(tag::SLASHING_FEE_LIMIT, &sats.to_be_bytes())
    }

    pub fn unbonding_fee_limit(self, sats: u64) -> Self {
        self.raw(tag::UNBONDING_FEE_LIMIT, &sats.to_be_bytes())
    }

    pub fn burn_address(self, script_pubkey: &[u8]) -> Self {
        self.raw(tag::BURN_ADDRESS, script_pubkey)
    }

    pub fn message(self, message: &[u8]) -> Self {
        self.raw(tag::MESSAGE, message)
    }

    pub fn message_key(self, key: &MessageKey) -> Self {
        match key {
            MessageKey::XOnly(k) => self.raw(tag::MESSAGE_KEY, k.as_bytes()),
            MessageKey::Compressed(k) => self.raw(tag::MESSAGE_KEY, k.as_bytes()),
        }
    }

    pub fn txid(self, txid: &Txid) -> Self {
        self.raw(tag::TXID, txid.as_bytes())
    }

    pub fn derivation_path(self, path: &DerivationPath) -> Self {
        self.raw(tag::DERIVATION_PATH, &path.to_be_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn count_byte(keys: &[XOnlyKey]) -> u8 {
    debug_assert!(
        keys.len() <= u8::MAX as usize,
        "{} keys do not fit a count record",
        keys.len()
    );
    keys.len().min(u8::MAX as usize) as u8
}

fn concat_keys(keys: &[XOnlyKey]) -> Vec<u8> {
    keys.iter().flat_map(|k| k.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seeds: &[u8]) -> Vec<XOnlyKey> {
        seeds.iter().map(|s| XOnlyKey::new([*s; 32])).collect()
    }

    fn staking_blob() -> Vec<u8> {
        BlobWriter::new()
            .action(Action::Staking)
            .finality_providers(&keys(&[1]))
            .covenant(&keys(&[2, 3]), 2)
            .staker_key(&XOnlyKey::new([4; 32]))
            .timelock(1000)
            .finish()
    }

    #[test]
    fn test_parse_full_staking_blob() {
        let mut record = SessionRecord::new();
        parse_blob(&mut record, &staking_blob()).unwrap();

        assert_eq!(record.action, Some(Action::Staking));
        assert_eq!(record.finality_providers, Some(keys(&[1])));
        assert_eq!(record.covenant_keys, Some(keys(&[2, 3])));
        assert_eq!(record.covenant_quorum, Some(2));
        assert_eq!(record.staker_key, Some(XOnlyKey::new([4; 32])));
        assert_eq!(record.timelock, Some(1000));
        assert_eq!(record.slashing_fee_limit, None);
    }

    #[test]
    fn test_empty_blob_is_an_empty_record() {
        let mut record = SessionRecord::new();
        parse_blob(&mut record, &[]).unwrap();
        assert!(record.is_empty());
    }

    #[test]
    fn test_reparse_resets_previous_fields() {
        let mut record = SessionRecord::new();
        parse_blob(&mut record, &staking_blob()).unwrap();
        let withdraw = BlobWriter::new().action(Action::Withdraw).finish();
        parse_blob(&mut record, &withdraw).unwrap();
        assert_eq!(record.action, Some(Action::Withdraw));
        assert_eq!(record.timelock, None);
    }

    #[test]
    fn test_timelock_is_big_endian() {
        let blob = [tag::TIMELOCK, 0, 8, 0, 0, 0, 0, 0, 0, 0x03, 0xf0];
        let record = decode(&blob).unwrap();
        assert_eq!(record.timelock, Some(1008));
    }

    #[test]
    fn test_truncated_header() {
        let mut blob = staking_blob();
        blob.extend_from_slice(&[tag::TIMELOCK, 0]);
        let mut record = SessionRecord::new();
        let err = parse_blob(&mut record, &blob).unwrap_err();
        assert!(matches!(
            err,
            Error::Parse(BlobError::TruncatedHeader { .. })
        ));
        assert!(record.is_empty());
    }

    #[test]
    fn test_value_past_end() {
        let blob = [tag::STAKER_PK, 0, 32, 1, 2, 3];
        assert!(matches!(
            decode(&blob),
            Err(Error::Parse(BlobError::TruncatedValue {
                tag: tag::STAKER_PK,
                declared: 32,
                remaining: 3
            }))
        ));
    }

    #[test]
    fn test_wrong_fixed_length() {
        let blob = BlobWriter::new().raw(tag::TIMELOCK, &[0; 4]).finish();
        assert!(matches!(
            decode(&blob),
            Err(Error::Parse(BlobError::InvalidLength { tag: tag::TIMELOCK, len: 4 }))
        ));
    }

    #[test]
    fn test_unknown_tag_leaves_record_reset() {
        let mut record = SessionRecord::new();
        parse_blob(&mut record, &staking_blob()).unwrap();

        let mut blob = staking_blob();
        blob.extend_from_slice(&[0x42, 0, 1, 0]);
        let err = parse_blob(&mut record, &blob).unwrap_err();
        assert!(matches!(err, Error::Parse(BlobError::UnknownTag(0x42))));
        assert!(record.is_empty());
    }

    #[test]
    fn test_duplicate_tag() {
        let blob = BlobWriter::new().timelock(1).timelock(2).finish();
        assert!(matches!(
            decode(&blob),
            Err(Error::Parse(BlobError::DuplicateTag(tag::TIMELOCK)))
        ));
    }

    #[test]
    fn test_key_list_bounds() {
        let ragged = BlobWriter::new().raw(tag::FP_LIST, &[0; 33]).finish();
        assert!(matches!(
            decode(&ragged),
            Err(Error::Parse(BlobError::InvalidLength { .. }))
        ));

        let too_many = BlobWriter::new()
            .raw(tag::COV_KEY_LIST, &[7; 32 * (MAX_KEYS + 1)])
            .finish();
        assert!(matches!(
            decode(&too_many),
            Err(Error::Parse(BlobError::TooManyKeys { count: 17, .. }))
        ));

        let max = BlobWriter::new()
            .raw(tag::COV_KEY_LIST, &[7; 32 * MAX_KEYS])
            .finish();
        assert_eq!(decode(&max).unwrap().covenant_keys.unwrap().len(), MAX_KEYS);
    }

    #[test]
    fn test_count_record_must_match_list() {
        let blob = BlobWriter::new()
            .raw(tag::FP_COUNT, &[2])
            .raw(tag::FP_LIST, &[1; 32])
            .finish();
        assert!(matches!(
            decode(&blob),
            Err(Error::Parse(BlobError::CountMismatch {
                field: "finality_providers",
                declared: 2,
                actual: 1
            }))
        ));

        // order of count and list records does not matter
        let reversed = BlobWriter::new()
            .raw(tag::COV_KEY_LIST, &[1; 64])
            .raw(tag::COV_KEY_COUNT, &[2])
            .finish();
        assert!(decode(&reversed).is_ok());
    }

    #[test]
    fn test_quorum_above_key_count() {
        let blob = BlobWriter::new().covenant(&keys(&[1, 2]), 3).finish();
        assert!(matches!(
            decode(&blob),
            Err(Error::InvalidQuorum { quorum: 3, keys: 2 })
        ));
    }

    #[test]
    fn test_unknown_action_code() {
        let blob = BlobWriter::new().raw(tag::ACTION, &[9]).finish();
        assert!(matches!(decode(&blob), Err(Error::UnsupportedAction(_))));
    }

    #[test]
    fn test_message_fields() {
        let path = DerivationPath::taproot(1, 0, 0, 0);
        let compressed = PublicKey::new([2; 33]);
        let blob = BlobWriter::new()
            .action(Action::SignMessage)
            .message(b"bbn1stakerproofofpossession")
            .message_key(&MessageKey::Compressed(compressed))
            .txid(&Txid::new([5; 32]))
            .derivation_path(&path)
            .finish();
        let record = decode(&blob).unwrap();
        assert_eq!(
            record.message.as_deref(),
            Some(&b"bbn1stakerproofofpossession"[..])
        );
        assert_eq!(record.message_key, Some(MessageKey::Compressed(compressed)));
        assert_eq!(record.txid, Some(Txid::new([5; 32])));
        assert_eq!(record.derivation_path, Some(path));

        let long = BlobWriter::new()
            .message(&[b'a'; MAX_MESSAGE_LEN + 1])
            .finish();
        assert!(decode(&long).is_err());

        let bad_key = BlobWriter::new().raw(tag::MESSAGE_KEY, &[2; 31]).finish();
        assert!(decode(&bad_key).is_err());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "does not fit a record")]
    fn test_writer_refuses_oversized_value() {
        let _ = BlobWriter::new().message(&vec![0u8; u16::MAX as usize + 1]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "do not fit a count record")]
    fn test_writer_refuses_oversized_key_count() {
        let _ = BlobWriter::new().finality_providers(&keys(&[1; 256]));
    }

    #[test]
    fn test_burn_address_and_path_lengths() {
        assert!(decode(&BlobWriter::new().burn_address(&[]).finish()).is_err());
        assert!(decode(&BlobWriter::new().burn_address(&[0x6a; 33]).finish()).is_err());
        assert!(decode(&BlobWriter::new().burn_address(&[0x6a]).finish()).is_ok());

        assert!(decode(&BlobWriter::new().raw(tag::DERIVATION_PATH, &[0; 6]).finish()).is_err());
        assert!(decode(&BlobWriter::new().raw(tag::DERIVATION_PATH, &[0; 44]).finish()).is_err());
        assert!(decode(&BlobWriter::new().raw(tag::DERIVATION_PATH, &[]).finish()).is_err());
    }
}
