//! The consensus wire codec: little-endian, compact-size prefixed,
//! append-only. Transaction ids, block hashes and registry snapshots are all
//! derived from these encodings, so every implementation detail here is a
//! consensus rule.

use std::collections::BTreeMap;

use thiserror::Error;

use quill_crypto::{sha256d, PubKey, PUBKEY_LEN};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),
    #[error("non-canonical compact size")]
    BadCompactSize,
    #[error("declared size {0} exceeds remaining input")]
    BadSize(u64),
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

/// A cursor over an input slice.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd(self.pos));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Everything left in the input; used by the qPoS purchase payload whose
    /// trailing field runs to end of script.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }
}

pub trait Encodable {
    fn encode(&self, out: &mut Vec<u8>);

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

pub trait Decodable: Sized {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(bytes);
        let value = Self::decode(&mut r)?;
        if !r.is_empty() {
            return Err(CodecError::InvalidValue("trailing bytes"));
        }
        Ok(value)
    }
}

/// sha256d over the consensus encoding of a value.
pub fn serialize_hash<T: Encodable>(value: &T) -> Hash256 {
    Hash256(sha256d(&value.to_bytes()))
}

pub fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

pub fn read_compact_size(r: &mut Reader<'_>) -> Result<u64, CodecError> {
    let first = r.take(1)?[0];
    let n = match first {
        0xfd => u16::from_le_bytes(r.take(2)?.try_into().unwrap()) as u64,
        0xfe => u32::from_le_bytes(r.take(4)?.try_into().unwrap()) as u64,
        0xff => u64::from_le_bytes(r.take(8)?.try_into().unwrap()),
        b => b as u64,
    };
    // reject non-canonical encodings so hashes are unique per value
    let minimal = match n {
        0..=0xfc => first < 0xfd,
        0xfd..=0xffff => first == 0xfd,
        0x1_0000..=0xffff_ffff => first == 0xfe,
        _ => first == 0xff,
    };
    if !minimal {
        return Err(CodecError::BadCompactSize);
    }
    if n > r.remaining() as u64 {
        // every compact size in this format prefixes that many elements or
        // bytes, each at least one byte long
        return Err(CodecError::BadSize(n));
    }
    Ok(n)
}

macro_rules! impl_int_codec {
    ($($t:ty),*) => {
        $(
            impl Encodable for $t {
                fn encode(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }
            }
            impl Decodable for $t {
                fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
                    Ok(<$t>::from_le_bytes(
                        r.take(std::mem::size_of::<$t>())?.try_into().unwrap(),
                    ))
                }
            }
        )*
    };
}

impl_int_codec!(u8, u16, u32, u64, i32, i64);

impl Encodable for bool {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
}

impl Decodable for bool {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        match r.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::InvalidValue("bool")),
        }
    }
}

impl Encodable for String {
    fn encode(&self, out: &mut Vec<u8>) {
        write_compact_size(out, self.len() as u64);
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decodable for String {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let n = read_compact_size(r)? as usize;
        String::from_utf8(r.take(n)?.to_vec()).map_err(|_| CodecError::InvalidValue("utf8 string"))
    }
}

impl<T: Encodable> Encodable for [T] {
    fn encode(&self, out: &mut Vec<u8>) {
        write_compact_size(out, self.len() as u64);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Encodable> Encodable for Vec<T> {
    fn encode(&self, out: &mut Vec<u8>) {
        self.as_slice().encode(out);
    }
}

impl<T: Decodable> Decodable for Vec<T> {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let n = read_compact_size(r)? as usize;
        let mut items = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            items.push(T::decode(r)?);
        }
        Ok(items)
    }
}

impl<A: Encodable, B: Encodable> Encodable for (A, B) {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
        self.1.encode(out);
    }
}

impl<A: Decodable, B: Decodable> Decodable for (A, B) {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok((A::decode(r)?, B::decode(r)?))
    }
}

// Maps serialize in key order, which BTreeMap guarantees; replay determinism
// depends on it.
impl<K: Encodable + Ord, V: Encodable> Encodable for BTreeMap<K, V> {
    fn encode(&self, out: &mut Vec<u8>) {
        write_compact_size(out, self.len() as u64);
        for (k, v) in self {
            k.encode(out);
            v.encode(out);
        }
    }
}

impl<K: Decodable + Ord + Clone, V: Decodable> Decodable for BTreeMap<K, V> {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let n = read_compact_size(r)? as usize;
        let mut map = BTreeMap::new();
        let mut last: Option<K> = None;
        for _ in 0..n {
            let k = K::decode(r)?;
            let v = V::decode(r)?;
            if let Some(prev) = &last {
                if prev >= &k {
                    return Err(CodecError::InvalidValue("map keys out of order"));
                }
            }
            last = Some(k.clone());
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl Encodable for PubKey {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl Decodable for PubKey {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        PubKey::from_slice(r.take(PUBKEY_LEN)?).map_err(|_| CodecError::InvalidValue("pubkey"))
    }
}

/// A 32-byte digest with total order. The all-zero value is the null
/// sentinel throughout the chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CodecError::InvalidValue("hash length"))?;
        Ok(Hash256(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CodecError> {
        let mut bytes = hex::decode(s).map_err(|_| CodecError::InvalidValue("hash hex"))?;
        // display order is byte-reversed
        bytes.reverse();
        Hash256::from_slice(&bytes)
    }

    /// Low 64 bits, little-endian; feeds the stake entropy bit.
    pub fn low_u64(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap())
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bytes = self.0;
        bytes.reverse();
        f.write_str(&hex::encode(bytes))
    }
}

impl Encodable for Hash256 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Decodable for Hash256 {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Hash256::from_slice(r.take(32)?)
    }
}
