//! Minimal output scripts. The chain recognises plain pay-to-pubkey spends,
//! empty coinstake markers, data carriers, and qPoS operation carriers whose
//! payload bytes are parsed by the registry layer.

use crate::codec::{CodecError, Decodable, Encodable, Hash256, Reader};
use quill_crypto::{sha256d, PubKey};

/// Opcode tags for qPoS operation outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QposOpTag {
    Purchase1 = 1,
    Purchase3 = 2,
    SetOwner = 3,
    SetManager = 4,
    SetDelegate = 5,
    SetController = 6,
    Enable = 7,
    Disable = 8,
    Claim = 9,
    SetMeta = 10,
}

impl QposOpTag {
    pub fn from_u8(b: u8) -> Result<Self, CodecError> {
        use QposOpTag::*;
        Ok(match b {
            1 => Purchase1,
            2 => Purchase3,
            3 => SetOwner,
            4 => SetManager,
            5 => SetDelegate,
            6 => SetController,
            7 => Enable,
            8 => Disable,
            9 => Claim,
            10 => SetMeta,
            _ => return Err(CodecError::InvalidValue("qpos opcode")),
        })
    }

    pub fn is_purchase(&self) -> bool {
        matches!(self, QposOpTag::Purchase1 | QposOpTag::Purchase3)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptPubKey {
    /// Zero-value empty output marking a coinstake.
    Empty,
    PayToPubKey(PubKey),
    OpReturn(Vec<u8>),
    /// A qPoS operation: opcode plus an opaque payload the registry parses.
    Qpos { tag: QposOpTag, payload: Vec<u8> },
}

impl ScriptPubKey {
    pub fn is_empty(&self) -> bool {
        matches!(self, ScriptPubKey::Empty)
    }

    pub fn qpos(&self) -> Option<(QposOpTag, &[u8])> {
        match self {
            ScriptPubKey::Qpos { tag, payload } => Some((*tag, payload)),
            _ => None,
        }
    }

    pub fn pay_to(&self) -> Option<&PubKey> {
        match self {
            ScriptPubKey::PayToPubKey(key) => Some(key),
            _ => None,
        }
    }
}

impl Encodable for ScriptPubKey {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ScriptPubKey::Empty => out.push(0),
            ScriptPubKey::PayToPubKey(key) => {
                out.push(1);
                key.encode(out);
            }
            ScriptPubKey::OpReturn(data) => {
                out.push(2);
                data.encode(out);
            }
            ScriptPubKey::Qpos { tag, payload } => {
                out.push(3);
                out.push(*tag as u8);
                payload.encode(out);
            }
        }
    }
}

impl Decodable for ScriptPubKey {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(match r.take(1)?[0] {
            0 => ScriptPubKey::Empty,
            1 => ScriptPubKey::PayToPubKey(PubKey::decode(r)?),
            2 => ScriptPubKey::OpReturn(Vec::<u8>::decode(r)?),
            3 => {
                let tag = QposOpTag::from_u8(r.take(1)?[0])?;
                ScriptPubKey::Qpos {
                    tag,
                    payload: Vec::<u8>::decode(r)?,
                }
            }
            _ => return Err(CodecError::InvalidValue("script kind")),
        })
    }
}

/// Digest an input signature commits to: the containing txid and the input's
/// position. Signatures do not cover themselves, so txids stay immalleable.
pub fn spend_digest(txid: &Hash256, input_index: u32) -> [u8; 32] {
    let mut buf = Vec::with_capacity(36);
    buf.extend_from_slice(&txid.0);
    buf.extend_from_slice(&input_index.to_le_bytes());
    sha256d(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decodable, Encodable};

    #[test]
    fn script_roundtrip() {
        let scripts = vec![
            ScriptPubKey::Empty,
            ScriptPubKey::OpReturn(b"memo".to_vec()),
            ScriptPubKey::Qpos {
                tag: QposOpTag::Claim,
                payload: vec![7; 41],
            },
        ];
        for s in scripts {
            let bytes = s.to_bytes();
            assert_eq!(ScriptPubKey::from_bytes(&bytes).unwrap(), s);
        }
    }

    #[test]
    fn bad_opcode_is_rejected() {
        let bytes = [3u8, 99, 0];
        assert!(ScriptPubKey::from_bytes(&bytes).is_err());
    }

    #[test]
    fn spend_digest_binds_index() {
        let txid = Hash256([9; 32]);
        assert_ne!(spend_digest(&txid, 0), spend_digest(&txid, 1));
    }
}
