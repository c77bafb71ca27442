//! Byte-key layout for the two on-disk UTXO tables. Column families already
//! separate the `h` and `u` tables, so the leading discriminator byte the
//! design describes is folded into the CF choice rather than the key bytes;
//! the remaining fields are exactly as specified (see DESIGN.md).

use crate::types::AddressFingerprint;

/// `tx_hash[0..4] ‖ idx_u16_le ‖ tx_ordinal_u32_le` — key into the `h` table.
pub fn h_key(tx_hash: &[u8; 32], idx: u16, tx_ordinal: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.extend_from_slice(&tx_hash[0..4]);
    key.extend_from_slice(&idx.to_le_bytes());
    key.extend_from_slice(&tx_ordinal.to_le_bytes());
    key
}

/// Prefix used to scan the `h` table for a given `(tx_hash, idx)`, before
/// the `tx_ordinal` that disambiguates collisions is known.
pub fn h_prefix(tx_hash: &[u8; 32], idx: u16) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(6);
    prefix.extend_from_slice(&tx_hash[0..4]);
    prefix.extend_from_slice(&idx.to_le_bytes());
    prefix
}

/// Recover the `tx_ordinal` suffix of an `h`-table key found via
/// [`h_prefix`].
pub fn h_key_tx_ordinal(key: &[u8]) -> Option<u32> {
    if key.len() != 10 {
        return None;
    }
    Some(u32::from_le_bytes(key[6..10].try_into().ok()?))
}

/// `address_fingerprint ‖ idx_u16_le ‖ tx_ordinal_u32_le` — key into the `u`
/// table.
pub fn u_key(fingerprint: &AddressFingerprint, idx: u16, tx_ordinal: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.extend_from_slice(&fingerprint.0);
    key.extend_from_slice(&idx.to_le_bytes());
    key.extend_from_slice(&tx_ordinal.to_le_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h_key_round_trips_tx_ordinal() {
        let tx_hash = [7u8; 32];
        let key = h_key(&tx_hash, 3, 99);
        assert_eq!(&key[0..6], h_prefix(&tx_hash, 3).as_slice());
        assert_eq!(h_key_tx_ordinal(&key), Some(99));
    }
}
