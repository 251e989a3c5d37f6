//! Key encoding utilities for `RocksDB`.

use zg_broker_core::{SettlementPair, UsageRecordId};

/// Create a usage record key from its ID.
#[must_use]
pub fn usage_key(id: &UsageRecordId) -> Vec<u8> {
    id.to_bytes().to_vec()
}

/// Create a pair nonce key.
///
/// Format: `user (20 bytes) || provider (20 bytes)`
#[must_use]
pub fn pair_nonce_key(pair: &SettlementPair) -> Vec<u8> {
    let mut key = Vec::with_capacity(40);
    key.extend_from_slice(pair.user.as_bytes());
    key.extend_from_slice(pair.provider.as_bytes());
    key
}

/// Encode a nonce value.
#[must_use]
pub fn encode_nonce(nonce: u64) -> [u8; 8] {
    nonce.to_be_bytes()
}

/// Decode a nonce value; `None` if the slice is not 8 bytes.
#[must_use]
pub fn decode_nonce(value: &[u8]) -> Option<u64> {
    value.try_into().ok().map(u64::from_be_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use zg_broker_core::AccountAddress;

    #[test]
    fn pair_nonce_key_format() {
        let pair = SettlementPair {
            user: AccountAddress::from_bytes([1; 20]),
            provider: AccountAddress::from_bytes([2; 20]),
        };
        let key = pair_nonce_key(&pair);
        assert_eq!(key.len(), 40);
        assert_eq!(&key[..20], &[1; 20]);
        assert_eq!(&key[20..], &[2; 20]);
    }

    #[test]
    fn usage_key_length() {
        let id = UsageRecordId::generate();
        assert_eq!(usage_key(&id).len(), 16);
    }

    #[test]
    fn nonce_encoding() {
        assert_eq!(decode_nonce(&encode_nonce(u64::MAX)), Some(u64::MAX));
        assert_eq!(decode_nonce(&[1, 2]), None);
    }
}
