//! Core data model: the parsed-block shape handed in by a `Coin`, the UTXO
//! record, chain state, and the dispatcher's tagged work items.

use std::fmt;

/// 11-byte truncated hash of an output's locking script.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressFingerprint(pub [u8; 11]);

impl AddressFingerprint {
    pub const LEN: usize = 11;

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; Self::LEN] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for AddressFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fp:{}", hex::encode(self.0))
    }
}

impl fmt::Display for AddressFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// `(address_fingerprint, tx_ordinal, amount)`, the value half of a UTXO.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct UtxoValue {
    pub fingerprint: AddressFingerprint,
    pub tx_ordinal: u32,
    pub amount: u64,
}

impl UtxoValue {
    pub const ENCODED_LEN: usize = AddressFingerprint::LEN + 4 + 8;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0..11].copy_from_slice(&self.fingerprint.0);
        out[11..15].copy_from_slice(&self.tx_ordinal.to_le_bytes());
        out[15..23].copy_from_slice(&self.amount.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return None;
        }
        let fingerprint = AddressFingerprint::from_slice(&bytes[0..11])?;
        let tx_ordinal = u32::from_le_bytes(bytes[11..15].try_into().ok()?);
        let amount = u64::from_le_bytes(bytes[15..23].try_into().ok()?);
        Some(Self {
            fingerprint,
            tx_ordinal,
            amount,
        })
    }
}

/// A transaction input: the previous output it spends, or none for a
/// coinbase input.
#[derive(Clone, Debug)]
pub struct ParsedInput {
    pub prev_tx_hash: [u8; 32],
    pub prev_idx: u16,
    pub is_coinbase: bool,
}

/// A transaction output: a locking script and a value.
#[derive(Clone, Debug)]
pub struct ParsedOutput {
    pub script: Vec<u8>,
    pub value: u64,
}

#[derive(Clone, Debug)]
pub struct ParsedTx {
    pub tx_hash: [u8; 32],
    pub is_coinbase: bool,
    pub inputs: Vec<ParsedInput>,
    pub outputs: Vec<ParsedOutput>,
}

#[derive(Clone, Debug)]
pub struct ParsedBlock {
    pub header: Vec<u8>,
    pub prev_hash: [u8; 32],
    pub txs: Vec<ParsedTx>,
}

/// Monotonically grown chain-state tuple, with the three shadow copies
/// tracked separately by the flush coordinator (`db_*`/`fs_*`/live).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChainState {
    pub height: u32,
    pub tip: [u8; 32],
    pub tx_count: u64,
}

impl ChainState {
    /// The state of a fresh store, before the genesis block has been
    /// advanced. `height` uses `u32::MAX` as a "before height 0" sentinel
    /// (genesis is height 0, so a plain `0` can't double as "nothing
    /// indexed yet"); `advance_blocks` reaches real height 0 via
    /// `height.wrapping_add(1)` on this sentinel.
    pub fn fresh() -> Self {
        Self {
            height: u32::MAX,
            tip: [0u8; 32],
            tx_count: 0,
        }
    }
}

/// Tagged messages consumed by the single-consumer work dispatcher.
#[derive(Debug)]
pub enum WorkItem {
    RawBlocks {
        blocks: Vec<Vec<u8>>,
        first: u32,
    },
    PrefetcherCaughtUp,
    ReorgChain {
        count: Option<u32>,
    },
}
