//! Transactions and their historical encodings. Two layouts coexist: early
//! transactions carry an embedded timestamp, later versions drop it and blank
//! scriptSigs out of the txid so signatures do not determine identity.

use crate::codec::{serialize_hash, CodecError, Decodable, Encodable, Hash256, Reader};
use crate::script::ScriptPubKey;

pub type Amount = i64;

pub const COIN: Amount = 1_000_000;
pub const MAX_MONEY: Amount = 100_000_000 * COIN;

pub const TX_VERSION_GENESIS: i32 = 1;
pub const TX_VERSION_NOTXTIME: i32 = 2;
pub const TX_VERSION_IMMALLEABLE: i32 = 3;
pub const TX_VERSION_FEELESS: i32 = 4;

/// A reference to a previous transaction output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPoint {
    pub hash: Hash256,
    pub n: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, n: u32) -> Self {
        OutPoint { hash, n }
    }

    pub fn null() -> Self {
        OutPoint {
            hash: Hash256::ZERO,
            n: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash.is_zero() && self.n == u32::MAX
    }
}

impl Encodable for OutPoint {
    fn encode(&self, out: &mut Vec<u8>) {
        self.hash.encode(out);
        self.n.encode(out);
    }
}

impl Decodable for OutPoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(OutPoint {
            hash: Hash256::decode(r)?,
            n: u32::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    /// DER signature for pay-to-pubkey spends; arbitrary bytes in a coinbase.
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn is_final(&self) -> bool {
        self.sequence == u32::MAX
    }
}

impl Encodable for TxIn {
    fn encode(&self, out: &mut Vec<u8>) {
        self.prevout.encode(out);
        self.script_sig.encode(out);
        self.sequence.encode(out);
    }
}

impl Decodable for TxIn {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxIn {
            prevout: OutPoint::decode(r)?,
            script_sig: Vec::<u8>::decode(r)?,
            sequence: u32::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: ScriptPubKey,
}

impl TxOut {
    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl Encodable for TxOut {
    fn encode(&self, out: &mut Vec<u8>) {
        self.value.encode(out);
        self.script_pubkey.encode(out);
    }
}

impl Decodable for TxOut {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(TxOut {
            value: Amount::decode(r)?,
            script_pubkey: ScriptPubKey::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    /// Embedded timestamp; only serialized (and only meaningful) below
    /// `TX_VERSION_NOTXTIME`.
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn has_timestamp(&self) -> bool {
        self.version < TX_VERSION_NOTXTIME
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null() && !self.vout.is_empty()
    }

    /// Coinstake marker: spends real inputs, first output empty.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    pub fn is_qpos(&self) -> bool {
        self.vout.iter().any(|o| o.script_pubkey.qpos().is_some())
    }

    /// Transaction id. From `TX_VERSION_IMMALLEABLE` on, scriptSigs are
    /// blanked (except in a coinbase) so the id can itself be signed.
    pub fn txid(&self) -> Hash256 {
        if self.version >= TX_VERSION_IMMALLEABLE && !self.is_coinbase() {
            let mut blanked = self.clone();
            for input in &mut blanked.vin {
                input.script_sig.clear();
            }
            serialize_hash(&blanked)
        } else {
            serialize_hash(self)
        }
    }

    pub fn total_output_value(&self) -> Amount {
        self.vout.iter().map(|o| o.value).sum()
    }

    pub fn is_final(&self, block_height: i32, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        const LOCKTIME_THRESHOLD: i64 = 500_000_000;
        let cutoff = if (self.lock_time as i64) < LOCKTIME_THRESHOLD {
            block_height as i64
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.vin.iter().all(|input| input.is_final())
    }
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        if self.version < TX_VERSION_NOTXTIME {
            self.time.encode(out);
        }
        self.vin.encode(out);
        self.vout.encode(out);
        self.lock_time.encode(out);
    }
}

impl Decodable for Transaction {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = i32::decode(r)?;
        let time = if version < TX_VERSION_NOTXTIME {
            u32::decode(r)?
        } else {
            0
        };
        Ok(Transaction {
            version,
            time,
            vin: Vec::<TxIn>::decode(r)?,
            vout: Vec::<TxOut>::decode(r)?,
            lock_time: u32::decode(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::QposOpTag;

    fn sample_tx(version: i32) -> Transaction {
        Transaction {
            version,
            time: 1000,
            vin: vec![TxIn {
                prevout: OutPoint::new(Hash256([1; 32]), 0),
                script_sig: vec![0xde, 0xad],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 5 * COIN,
                script_pubkey: ScriptPubKey::OpReturn(vec![1]),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn txid_ignores_signatures_after_immalleable() {
        let tx = sample_tx(TX_VERSION_IMMALLEABLE);
        let mut resigned = tx.clone();
        resigned.vin[0].script_sig = vec![0xbe, 0xef, 0x00];
        assert_eq!(tx.txid(), resigned.txid());

        let old = sample_tx(TX_VERSION_GENESIS);
        let mut old_resigned = old.clone();
        old_resigned.vin[0].script_sig = vec![0xbe, 0xef, 0x00];
        assert_ne!(old.txid(), old_resigned.txid());
    }

    #[test]
    fn timestamp_only_serialized_for_early_versions() {
        let with_time = sample_tx(TX_VERSION_GENESIS);
        let without = sample_tx(TX_VERSION_NOTXTIME);
        assert_eq!(with_time.to_bytes().len(), without.to_bytes().len() + 4);
        let decoded = Transaction::from_bytes(&without.to_bytes()).unwrap();
        assert_eq!(decoded.time, 0);
    }

    #[test]
    fn coinstake_classification() {
        let mut tx = sample_tx(TX_VERSION_IMMALLEABLE);
        tx.vout.insert(
            0,
            TxOut {
                value: 0,
                script_pubkey: ScriptPubKey::Empty,
            },
        );
        assert!(tx.is_coinstake());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn qpos_detection() {
        let mut tx = sample_tx(TX_VERSION_IMMALLEABLE);
        assert!(!tx.is_qpos());
        tx.vout.push(TxOut {
            value: 0,
            script_pubkey: ScriptPubKey::Qpos {
                tag: QposOpTag::Enable,
                payload: vec![1, 0, 0, 0],
            },
        });
        assert!(tx.is_qpos());
    }
}
