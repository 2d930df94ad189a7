//! Blocks and headers. Three proof types share one header layout; qPoS
//! headers additionally commit to their height and producing staker.

use num_bigint::BigUint;

use crate::codec::{CodecError, Decodable, Encodable, Hash256, Reader};
use crate::params::ChainParams;
use crate::tx::{Amount, OutPoint, Transaction};
use quill_crypto::{chain9, sha256d};

pub const BLOCK_VERSION_GENESIS: i32 = 1;
pub const BLOCK_VERSION_PURCHASE: i32 = 2;
pub const BLOCK_VERSION_QPOS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofType {
    Pow,
    Pos,
    QPos,
}

/// Header fields alone, for callers that do not need the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub hash_prev: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    pub height: i32,
    pub staker_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub version: i32,
    pub hash_prev: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
    /// qPoS header extension; zero on earlier versions.
    pub height: i32,
    pub staker_id: u32,
    pub vtx: Vec<Transaction>,
    pub signature: Vec<u8>,
}

impl Block {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            hash_prev: self.hash_prev,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
            height: self.height,
            staker_id: self.staker_id,
        }
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        self.version.encode(&mut out);
        self.hash_prev.encode(&mut out);
        self.merkle_root.encode(&mut out);
        self.time.encode(&mut out);
        self.bits.encode(&mut out);
        self.nonce.encode(&mut out);
        if self.version >= BLOCK_VERSION_QPOS {
            self.height.encode(&mut out);
            self.staker_id.encode(&mut out);
        }
        out
    }

    /// Block identity: the nine-stage composed hash over the header bytes.
    /// One historical height mixes in the hash-of-NFT-hashes constant.
    pub fn hash(&self, params: &ChainParams) -> Hash256 {
        let inner = Hash256(chain9(&self.header_bytes()));
        if self.version >= BLOCK_VERSION_QPOS && self.height == params.nft_hash_height {
            let mut buf = Vec::with_capacity(64);
            params.nft_hash.encode(&mut buf);
            inner.encode(&mut buf);
            Hash256(chain9(&buf))
        } else {
            inner
        }
    }

    /// Exactly one of PoW, PoS, qPoS. Staker id zero is reserved for
    /// "no staker", so any nonzero id marks a qPoS block.
    pub fn proof_type(&self) -> ProofType {
        if self.staker_id > 0 {
            ProofType::QPos
        } else if self.vtx.len() > 1 && self.vtx[1].is_coinstake() {
            ProofType::Pos
        } else {
            ProofType::Pow
        }
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.proof_type() == ProofType::Pos
    }

    pub fn is_qpos(&self) -> bool {
        self.proof_type() == ProofType::QPos
    }

    /// The staked prevout and stake time of a PoS block.
    pub fn proof_of_stake(&self) -> Option<(OutPoint, u32)> {
        if !self.is_proof_of_stake() {
            return None;
        }
        let stake = &self.vtx[1];
        let stake_time = if stake.has_timestamp() {
            stake.time
        } else {
            self.time
        };
        Some((stake.vin[0].prevout, stake_time))
    }

    pub fn build_merkle_root(&self) -> Hash256 {
        let mut layer: Vec<Hash256> = self.vtx.iter().map(|tx| tx.txid()).collect();
        if layer.is_empty() {
            return Hash256::ZERO;
        }
        while layer.len() > 1 {
            let mut next = Vec::with_capacity((layer.len() + 1) / 2);
            for pair in layer.chunks(2) {
                let right = if pair.len() == 2 { pair[1] } else { pair[0] };
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0].0);
                buf[32..].copy_from_slice(&right.0);
                next.push(Hash256(sha256d(&buf)));
            }
            layer = next;
        }
        layer[0]
    }

    pub fn total_output_value(&self) -> Amount {
        self.vtx.iter().map(|tx| tx.total_output_value()).sum()
    }

    /// Transactions counted toward block volume; the coinstake is schedule
    /// overhead, not user traffic.
    pub fn tx_volume(&self) -> u32 {
        if self.is_proof_of_stake() {
            self.vtx.len() as u32 - 1
        } else {
            self.vtx.len() as u32
        }
    }

    /// Entropy bit for the stake modifier: low bit of the block hash.
    pub fn stake_entropy_bit(&self, params: &ChainParams) -> u32 {
        (self.hash(params).low_u64() & 1) as u32
    }

    pub fn max_transaction_time(&self) -> i64 {
        let max = self
            .vtx
            .iter()
            .filter(|tx| tx.has_timestamp())
            .map(|tx| tx.time as i64)
            .max()
            .unwrap_or(0);
        if max == 0 && !self.vtx.is_empty() {
            self.time as i64
        } else {
            max
        }
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header_bytes());
        self.vtx.encode(out);
        self.signature.encode(out);
    }
}

impl Decodable for Block {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = i32::decode(r)?;
        let hash_prev = Hash256::decode(r)?;
        let merkle_root = Hash256::decode(r)?;
        let time = u32::decode(r)?;
        let bits = u32::decode(r)?;
        let nonce = u32::decode(r)?;
        let (height, staker_id) = if version >= BLOCK_VERSION_QPOS {
            (i32::decode(r)?, u32::decode(r)?)
        } else {
            (0, 0)
        };
        Ok(Block {
            version,
            hash_prev,
            merkle_root,
            time,
            bits,
            nonce,
            height,
            staker_id,
            vtx: Vec::<Transaction>::decode(r)?,
            signature: Vec::<u8>::decode(r)?,
        })
    }
}

/// Expand compact difficulty bits into a 256-bit target.
pub fn target_from_bits(bits: u32) -> Option<BigUint> {
    let exponent = (bits >> 24) as u32;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return None;
    }
    let target = if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3))
    };
    if target.bits() > 256 {
        return None;
    }
    Some(target)
}

/// PoW check: hash interpreted as a little-endian integer must not exceed
/// the target encoded by `bits`.
pub fn check_proof_of_work(hash: &Hash256, bits: u32) -> bool {
    match target_from_bits(bits) {
        Some(target) => BigUint::from_bytes_le(&hash.0) <= target,
        None => false,
    }
}

/// Work contributed by a block at the given difficulty: `2^256 / (target+1)`.
pub fn block_work(bits: u32) -> BigUint {
    match target_from_bits(bits) {
        Some(target) => (BigUint::from(1u8) << 256u32) / (target + 1u8),
        None => BigUint::from(0u8),
    }
}
