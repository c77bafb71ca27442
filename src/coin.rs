//! `Coin`: the capability set a concrete chain's block format and script
//! dialect must provide. The core engine never parses raw bytes itself; it
//! only calls through this trait. `PivxLikeCoin` is a concrete, UTXO-style
//! implementation used by the test suite and the default binary wiring —
//! production deployments are expected to supply their own `Coin`.

use byteorder::{LittleEndian, ReadBytesExt};
use ripemd160::{Digest as RipemdDigest, Ripemd160};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};

use crate::error::ChainError;
use crate::types::{AddressFingerprint, ParsedBlock, ParsedInput, ParsedOutput, ParsedTx};

pub trait Coin: Send + Sync {
    fn block(&self, raw: &[u8], height: u32) -> Result<ParsedBlock, ChainError>;
    fn header_hash(&self, header: &[u8]) -> [u8; 32];
    fn header_prevhash(&self, header: &[u8]) -> [u8; 32];
    fn hashx_from_script(&self, script: &[u8]) -> Option<AddressFingerprint>;
    fn genesis_block(&self, raw: &[u8]) -> Vec<u8>;

    /// ETA-estimation tunables (§6) — never consulted by correctness-critical
    /// code, only by the prefetcher's progress logging. Plain methods rather
    /// than associated constants so `Coin` stays dyn-compatible: the engine
    /// and chain controller hold it as `&dyn Coin`.
    fn tx_count(&self) -> u64;
    fn tx_count_height(&self) -> u32;
    fn tx_per_block(&self) -> u32;

    /// Header length in bytes, used to split header from the tx payload.
    fn header_len(&self) -> usize {
        80
    }
}

fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(&first);
    second.into()
}

fn read_varint(cursor: &mut Cursor<&[u8]>) -> Result<u64, ChainError> {
    let first = cursor
        .read_u8()
        .map_err(|e| ChainError::Decode(e.to_string()))?;
    let value = match first {
        0x00..=0xfc => u64::from(first),
        0xfd => u64::from(
            cursor
                .read_u16::<LittleEndian>()
                .map_err(|e| ChainError::Decode(e.to_string()))?,
        ),
        0xfe => u64::from(
            cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| ChainError::Decode(e.to_string()))?,
        ),
        0xff => cursor
            .read_u64::<LittleEndian>()
            .map_err(|e| ChainError::Decode(e.to_string()))?,
    };
    Ok(value)
}

fn read_script(cursor: &mut Cursor<&[u8]>) -> Result<Vec<u8>, ChainError> {
    let len = read_varint(cursor)? as usize;
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|e| ChainError::Decode(e.to_string()))?;
    Ok(buf)
}

/// A UTXO-model chain with a classic `nVersion | vin | vout | nLockTime`
/// transaction layout and P2PKH/P2SH/P2PK scripts, grounded on the PIVX-style
/// wire format. Other chains plug in their own `Coin`.
pub struct PivxLikeCoin {
    genesis_raw: Vec<u8>,
}

impl PivxLikeCoin {
    pub fn new(genesis_raw: Vec<u8>) -> Self {
        Self { genesis_raw }
    }

    fn deserialize_tx(cursor: &mut Cursor<&[u8]>) -> Result<ParsedTx, ChainError> {
        let start = cursor.position() as usize;
        let version = cursor
            .read_i32::<LittleEndian>()
            .map_err(|e| ChainError::Decode(e.to_string()))?;

        let input_count = read_varint(cursor)?;
        let mut inputs = Vec::with_capacity(input_count as usize);
        let mut is_coinbase = false;
        for i in 0..input_count {
            let mut prev_hash = [0u8; 32];
            cursor
                .read_exact(&mut prev_hash)
                .map_err(|e| ChainError::Decode(e.to_string()))?;
            let prev_idx = cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| ChainError::Decode(e.to_string()))?;
            let _script_sig = read_script(cursor)?;
            let _sequence = cursor
                .read_u32::<LittleEndian>()
                .map_err(|e| ChainError::Decode(e.to_string()))?;

            if i == 0 && prev_hash == [0u8; 32] && prev_idx == 0xffff_ffff {
                is_coinbase = true;
            }
            inputs.push(ParsedInput {
                prev_tx_hash: prev_hash,
                prev_idx: prev_idx as u16,
                is_coinbase,
            });
        }

        let output_count = read_varint(cursor)?;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = cursor
                .read_i64::<LittleEndian>()
                .map_err(|e| ChainError::Decode(e.to_string()))? as u64;
            let script = read_script(cursor)?;
            outputs.push(ParsedOutput { script, value });
        }

        let _lock_time = cursor
            .read_u32::<LittleEndian>()
            .map_err(|e| ChainError::Decode(e.to_string()))?;

        let end = cursor.position() as usize;
        let raw_tx = &cursor.get_ref()[start..end];
        let tx_hash = sha256d(raw_tx);
        let _ = version;

        Ok(ParsedTx {
            tx_hash,
            is_coinbase,
            inputs,
            outputs,
        })
    }
}

impl Coin for PivxLikeCoin {
    fn block(&self, raw: &[u8], _height: u32) -> Result<ParsedBlock, ChainError> {
        let header_len = self.header_len();
        if raw.len() < header_len {
            return Err(ChainError::Decode("raw block shorter than header".into()));
        }
        let header = raw[..header_len].to_vec();
        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&header[4..36]);

        let mut cursor = Cursor::new(&raw[header_len..]);
        let tx_count = read_varint(&mut cursor)?;
        let mut txs = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            txs.push(Self::deserialize_tx(&mut cursor)?);
        }

        Ok(ParsedBlock {
            header,
            prev_hash,
            txs,
        })
    }

    fn header_hash(&self, header: &[u8]) -> [u8; 32] {
        sha256d(header)
    }

    fn header_prevhash(&self, header: &[u8]) -> [u8; 32] {
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&header[4..36]);
        prev
    }

    fn hashx_from_script(&self, script: &[u8]) -> Option<AddressFingerprint> {
        if script.is_empty() {
            return None;
        }
        let hash160 = match script {
            // P2PKH: OP_DUP OP_HASH160 <20> ... OP_EQUALVERIFY OP_CHECKSIG
            [0x76, 0xa9, 0x14, rest @ ..] if rest.len() == 22 => rest[..20].to_vec(),
            // P2SH: OP_HASH160 <20> OP_EQUAL
            [0xa9, 0x14, rest @ ..] if rest.len() == 21 => rest[..20].to_vec(),
            other => {
                let sha = Sha256::digest(other);
                Ripemd160::digest(&sha).to_vec()
            }
        };
        let digest = Sha256::digest(&hash160);
        AddressFingerprint::from_slice(&digest[..11])
    }

    fn genesis_block(&self, _raw: &[u8]) -> Vec<u8> {
        self.genesis_raw.clone()
    }

    fn tx_count(&self) -> u64 {
        100_000_000
    }

    fn tx_count_height(&self) -> u32 {
        3_000_000
    }

    fn tx_per_block(&self) -> u32 {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashx_from_p2pkh_is_stable() {
        let coin = PivxLikeCoin::new(vec![0u8; 80]);
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0xab; 20]);
        script.extend_from_slice(&[0x88, 0xac]);

        let fp1 = coin.hashx_from_script(&script);
        let fp2 = coin.hashx_from_script(&script);
        assert_eq!(fp1, fp2);
        assert!(fp1.is_some());
    }

    #[test]
    fn empty_script_has_no_fingerprint() {
        let coin = PivxLikeCoin::new(vec![0u8; 80]);
        assert!(coin.hashx_from_script(&[]).is_none());
    }

    #[test]
    fn distinct_scripts_give_distinct_fingerprints() {
        let coin = PivxLikeCoin::new(vec![0u8; 80]);
        let mut a = vec![0x76, 0xa9, 0x14];
        a.extend_from_slice(&[0x01; 20]);
        a.extend_from_slice(&[0x88, 0xac]);
        let mut b = vec![0x76, 0xa9, 0x14];
        b.extend_from_slice(&[0x02; 20]);
        b.extend_from_slice(&[0x88, 0xac]);

        assert_ne!(coin.hashx_from_script(&a), coin.hashx_from_script(&b));
    }

    /// Regression test for the P2PKH script-length guard: it must match the
    /// standard 25-byte `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    /// form and take the fast hash160-extraction path rather than falling
    /// through to the generic sha256+ripemd160-of-whole-script branch, which
    /// would silently produce a different (and non-standard) fingerprint.
    #[test]
    fn p2pkh_fingerprint_uses_embedded_hash160_not_whole_script_hash() {
        let coin = PivxLikeCoin::new(vec![0u8; 80]);
        let pubkey_hash = [0xab; 20];
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&pubkey_hash);
        script.extend_from_slice(&[0x88, 0xac]);
        assert_eq!(script.len(), 25, "standard P2PKH script is 25 bytes");

        let expected = {
            let digest = Sha256::digest(pubkey_hash);
            AddressFingerprint::from_slice(&digest[..11]).unwrap()
        };
        assert_eq!(coin.hashx_from_script(&script), Some(expected));
    }

    #[test]
    fn p2sh_fingerprint_uses_embedded_hash160() {
        let coin = PivxLikeCoin::new(vec![0u8; 80]);
        let script_hash = [0xcd; 20];
        let mut script = vec![0xa9, 0x14];
        script.extend_from_slice(&script_hash);
        script.push(0x87);
        assert_eq!(script.len(), 23, "standard P2SH script is 23 bytes");

        let expected = {
            let digest = Sha256::digest(script_hash);
            AddressFingerprint::from_slice(&digest[..11]).unwrap()
        };
        assert_eq!(coin.hashx_from_script(&script), Some(expected));
    }
}
