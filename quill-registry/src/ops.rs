//! qPoS operation payloads. Each operation rides in a transaction output as
//! an opcode plus payload; the parser is an explicit little-endian byte
//! reader. Parsed operations are staged on the block index and applied by
//! the registry in block order.

use quill_core::{
    Amount, CodecError, Decodable, Encodable, Network, QposOpTag, Reader, ScriptPubKey,
    Transaction,
};
use quill_crypto::PubKey;

use crate::alias::to_lowercase_safe;
use crate::error::RegistryError;
use crate::meta::{check_meta_key, KeyAuthority, QP_MAX_META_KEY_LENGTH, QP_MAX_META_VALUE_LENGTH};
use crate::nft::{nft_lookup, nfts};
use crate::QP_MAX_NFT_ID;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRole {
    Owner,
    Manager,
    Delegate,
    Controller,
}

impl KeyRole {
    fn to_u8(self) -> u8 {
        match self {
            KeyRole::Owner => 0,
            KeyRole::Manager => 1,
            KeyRole::Delegate => 2,
            KeyRole::Controller => 3,
        }
    }

    fn from_u8(b: u8) -> Result<Self, CodecError> {
        Ok(match b {
            0 => KeyRole::Owner,
            1 => KeyRole::Manager,
            2 => KeyRole::Delegate,
            3 => KeyRole::Controller,
            _ => return Err(CodecError::InvalidValue("key role")),
        })
    }
}

/// A parsed qPoS operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QposOp {
    Purchase {
        /// Display-case alias; for NFT claims, the character's nickname.
        alias: String,
        /// Claimed NFT id, zero for plain aliases.
        nft_id: u32,
        /// One key (owner=delegate=controller) or three (owner, delegate,
        /// controller).
        keys: Vec<PubKey>,
        /// Delegate payout in centi-milli-percent; zero for one-key buys.
        pcm: u32,
        /// Amount paid, validated against the staker price window.
        value: Amount,
    },
    SetKey {
        role: KeyRole,
        id: u32,
        key: PubKey,
        /// New payout; meaningful only when `role` is `Delegate`.
        pcm: u32,
    },
    SetState {
        id: u32,
        enable: bool,
    },
    Claim {
        key: PubKey,
        value: Amount,
    },
    SetMeta {
        id: u32,
        key: String,
        value: String,
    },
}

impl QposOp {
    /// Staker the op targets, when it targets one.
    pub fn staker_id(&self) -> Option<u32> {
        match self {
            QposOp::SetKey { id, .. } | QposOp::SetState { id, .. } | QposOp::SetMeta { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }

    /// Role keys allowed to sign this op; `None` means the op is not
    /// authorized by a staker key (purchases pay, claims sign with the
    /// claimed key itself).
    pub fn required_authority(&self) -> Option<KeyAuthority> {
        match self {
            QposOp::Purchase { .. } => None,
            QposOp::SetKey { role, .. } => Some(match role {
                KeyRole::Owner | KeyRole::Controller => KeyAuthority::OWNER,
                KeyRole::Manager | KeyRole::Delegate => KeyAuthority::OM,
            }),
            QposOp::SetState { .. } => Some(KeyAuthority::OMC),
            QposOp::Claim { .. } => None,
            QposOp::SetMeta { key, .. } => Some(check_meta_key(key)),
        }
    }
}

fn read_pubkey(r: &mut Reader<'_>) -> Result<PubKey, RegistryError> {
    let bytes = r
        .take(33)
        .map_err(|_| RegistryError::MalformedOp("truncated pubkey"))?;
    PubKey::from_slice(bytes).map_err(|_| RegistryError::MalformedOp("malformed pubkey"))
}

fn read_u32(r: &mut Reader<'_>, what: &'static str) -> Result<u32, RegistryError> {
    let bytes = r.take(4).map_err(|_| RegistryError::MalformedOp(what))?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(r: &mut Reader<'_>, what: &'static str) -> Result<u64, RegistryError> {
    let bytes = r.take(8).map_err(|_| RegistryError::MalformedOp(what))?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

/// Bytes up to the first NUL, as a string.
fn until_nul(bytes: &[u8]) -> Result<String, RegistryError> {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..end].to_vec())
        .map_err(|_| RegistryError::MalformedOp("non-utf8 text"))
}

fn parse_purchase(
    tag: QposOpTag,
    payload: &[u8],
    network: Network,
) -> Result<QposOp, RegistryError> {
    let mut r = Reader::new(payload);
    let value = read_u64(&mut r, "truncated purchase value")? as Amount;
    let nkeys = if tag == QposOpTag::Purchase1 { 1 } else { 3 };
    let mut keys = Vec::with_capacity(nkeys);
    for _ in 0..nkeys {
        keys.push(read_pubkey(&mut r)?);
    }
    let pcm = if nkeys == 3 {
        read_u32(&mut r, "truncated payout")?
    } else {
        0
    };
    let mut alias = until_nul(r.take_rest())?;

    // A pure-decimal alias is an NFT id; a known nickname also claims the
    // character. Either way the registered nickname becomes the alias.
    let mut nft_id = 0u32;
    if !alias.is_empty() && alias.bytes().all(|b| b.is_ascii_digit()) {
        let id: u64 = alias.parse().unwrap_or(u64::from(QP_MAX_NFT_ID) + 1);
        if id > u64::from(QP_MAX_NFT_ID) {
            return Err(RegistryError::NftUnavailable(QP_MAX_NFT_ID));
        }
        nft_id = id as u32;
        if let Some(n) = nfts(network).get(&nft_id) {
            alias = n.nickname.clone();
        }
        // unknown ids keep the digit alias and fail alias validation later
    } else if let Some(&id) = nft_lookup(network).get(&to_lowercase_safe(&alias)) {
        nft_id = id;
    }

    Ok(QposOp::Purchase {
        alias,
        nft_id,
        keys,
        pcm,
        value,
    })
}

fn parse_setkey(tag: QposOpTag, payload: &[u8]) -> Result<QposOp, RegistryError> {
    let role = match tag {
        QposOpTag::SetOwner => KeyRole::Owner,
        QposOpTag::SetManager => KeyRole::Manager,
        QposOpTag::SetDelegate => KeyRole::Delegate,
        _ => KeyRole::Controller,
    };
    let mut r = Reader::new(payload);
    let id = read_u32(&mut r, "truncated staker id")?;
    let key = read_pubkey(&mut r)?;
    let pcm = if role == KeyRole::Delegate {
        read_u32(&mut r, "truncated payout")?
    } else {
        0
    };
    Ok(QposOp::SetKey { role, id, key, pcm })
}

fn parse_setmeta(payload: &[u8]) -> Result<QposOp, RegistryError> {
    let mut r = Reader::new(payload);
    let id = read_u32(&mut r, "truncated staker id")?;
    let key_raw = r
        .take(QP_MAX_META_KEY_LENGTH)
        .map_err(|_| RegistryError::MalformedOp("truncated meta key"))?;
    let value_raw = r
        .take(QP_MAX_META_VALUE_LENGTH)
        .map_err(|_| RegistryError::MalformedOp("truncated meta value"))?;
    Ok(QposOp::SetMeta {
        id,
        key: until_nul(key_raw)?,
        value: until_nul(value_raw)?,
    })
}

/// Parse a single qPoS output payload.
pub fn parse_qpos_output(
    tag: QposOpTag,
    payload: &[u8],
    network: Network,
) -> Result<QposOp, RegistryError> {
    match tag {
        QposOpTag::Purchase1 | QposOpTag::Purchase3 => parse_purchase(tag, payload, network),
        QposOpTag::SetOwner | QposOpTag::SetManager | QposOpTag::SetDelegate
        | QposOpTag::SetController => parse_setkey(tag, payload),
        QposOpTag::Enable | QposOpTag::Disable => {
            let mut r = Reader::new(payload);
            Ok(QposOp::SetState {
                id: read_u32(&mut r, "truncated staker id")?,
                enable: tag == QposOpTag::Enable,
            })
        }
        QposOpTag::Claim => {
            let mut r = Reader::new(payload);
            let key = read_pubkey(&mut r)?;
            let value = read_u64(&mut r, "truncated claim value")? as Amount;
            Ok(QposOp::Claim { key, value })
        }
        QposOpTag::SetMeta => parse_setmeta(payload),
    }
}

/// Every qPoS operation carried by a transaction, in output order.
pub fn extract_ops(tx: &Transaction, network: Network) -> Result<Vec<QposOp>, RegistryError> {
    let mut ops = Vec::new();
    for out in &tx.vout {
        if let ScriptPubKey::Qpos { tag, payload } = &out.script_pubkey {
            ops.push(parse_qpos_output(*tag, payload, network)?);
        }
    }
    Ok(ops)
}

// Disk codec for staged ops on block index records.

impl Encodable for QposOp {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            QposOp::Purchase {
                alias,
                nft_id,
                keys,
                pcm,
                value,
            } => {
                out.push(0);
                alias.encode(out);
                nft_id.encode(out);
                keys.encode(out);
                pcm.encode(out);
                value.encode(out);
            }
            QposOp::SetKey { role, id, key, pcm } => {
                out.push(1);
                out.push(role.to_u8());
                id.encode(out);
                key.encode(out);
                pcm.encode(out);
            }
            QposOp::SetState { id, enable } => {
                out.push(2);
                id.encode(out);
                enable.encode(out);
            }
            QposOp::Claim { key, value } => {
                out.push(3);
                key.encode(out);
                value.encode(out);
            }
            QposOp::SetMeta { id, key, value } => {
                out.push(4);
                id.encode(out);
                key.encode(out);
                value.encode(out);
            }
        }
    }
}

impl Decodable for QposOp {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(match r.take(1)?[0] {
            0 => QposOp::Purchase {
                alias: String::decode(r)?,
                nft_id: u32::decode(r)?,
                keys: Vec::<PubKey>::decode(r)?,
                pcm: u32::decode(r)?,
                value: Amount::decode(r)?,
            },
            1 => QposOp::SetKey {
                role: KeyRole::from_u8(r.take(1)?[0])?,
                id: u32::decode(r)?,
                key: PubKey::decode(r)?,
                pcm: u32::decode(r)?,
            },
            2 => QposOp::SetState {
                id: u32::decode(r)?,
                enable: bool::decode(r)?,
            },
            3 => QposOp::Claim {
                key: PubKey::decode(r)?,
                value: Amount::decode(r)?,
            },
            4 => QposOp::SetMeta {
                id: u32::decode(r)?,
                key: String::decode(r)?,
                value: String::decode(r)?,
            },
            _ => return Err(CodecError::InvalidValue("qpos op kind")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_crypto::KeyPair;

    fn key() -> PubKey {
        KeyPair::generate().public()
    }

    fn purchase_payload(value: u64, keys: &[PubKey], pcm: Option<u32>, alias: &[u8]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&value.to_le_bytes());
        for k in keys {
            p.extend_from_slice(k.as_bytes());
        }
        if let Some(pcm) = pcm {
            p.extend_from_slice(&pcm.to_le_bytes());
        }
        p.extend_from_slice(alias);
        p
    }

    #[test]
    fn parse_single_key_purchase() {
        let k = key();
        let payload = purchase_payload(42_000, &[k], None, b"alice");
        let op = parse_qpos_output(QposOpTag::Purchase1, &payload, Network::Testnet).unwrap();
        match op {
            QposOp::Purchase {
                alias,
                nft_id,
                keys,
                pcm,
                value,
            } => {
                assert_eq!(alias, "alice");
                assert_eq!(nft_id, 0);
                assert_eq!(keys, vec![k]);
                assert_eq!(pcm, 0);
                assert_eq!(value, 42_000);
            }
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn parse_three_key_purchase_with_payout() {
        let keys = [key(), key(), key()];
        let payload = purchase_payload(9, &keys, Some(25_000), b"bob99");
        let op = parse_qpos_output(QposOpTag::Purchase3, &payload, Network::Testnet).unwrap();
        match op {
            QposOp::Purchase { keys: k, pcm, .. } => {
                assert_eq!(k.len(), 3);
                assert_eq!(pcm, 25_000);
            }
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn digit_alias_claims_nft_nickname() {
        let k = key();
        let payload = purchase_payload(9, &[k], None, b"1");
        let op = parse_qpos_output(QposOpTag::Purchase1, &payload, Network::Testnet).unwrap();
        match op {
            QposOp::Purchase { alias, nft_id, .. } => {
                assert_eq!(nft_id, 1);
                assert_eq!(alias, "Testa");
            }
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn nickname_purchase_claims_nft() {
        let k = key();
        let payload = purchase_payload(9, &[k], None, b"mockram");
        let op = parse_qpos_output(QposOpTag::Purchase1, &payload, Network::Testnet).unwrap();
        match op {
            QposOp::Purchase { nft_id, alias, .. } => {
                assert_eq!(nft_id, 2);
                assert_eq!(alias, "mockram");
            }
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn oversized_nft_id_is_rejected() {
        let k = key();
        let payload = purchase_payload(9, &[k], None, b"2000000");
        assert!(parse_qpos_output(QposOpTag::Purchase1, &payload, Network::Testnet).is_err());
    }

    #[test]
    fn setmeta_null_padding() {
        let mut payload = 7u32.to_le_bytes().to_vec();
        let mut k = b"certified_node".to_vec();
        k.resize(16, 0);
        payload.extend_from_slice(&k);
        let mut v = b"node.example.com".to_vec();
        v.resize(40, 0);
        payload.extend_from_slice(&v);
        let op = parse_qpos_output(QposOpTag::SetMeta, &payload, Network::Testnet).unwrap();
        assert_eq!(
            op,
            QposOp::SetMeta {
                id: 7,
                key: "certified_node".to_string(),
                value: "node.example.com".to_string(),
            }
        );
    }

    #[test]
    fn truncated_claim_is_malformed() {
        let payload = key().as_bytes()[..20].to_vec();
        assert!(parse_qpos_output(QposOpTag::Claim, &payload, Network::Testnet).is_err());
    }

    #[test]
    fn op_codec_roundtrip() {
        let ops = vec![
            QposOp::SetKey {
                role: KeyRole::Delegate,
                id: 3,
                key: key(),
                pcm: 50_000,
            },
            QposOp::SetState { id: 3, enable: false },
            QposOp::Claim {
                key: key(),
                value: 1234,
            },
        ];
        let bytes = ops.to_bytes();
        assert_eq!(Vec::<QposOp>::from_bytes(&bytes).unwrap(), ops);
    }
}
