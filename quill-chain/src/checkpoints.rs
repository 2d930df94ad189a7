//! Checkpoints: a static hardened `height -> hash` table lives in the chain
//! parameters; this module adds the signed sync-checkpoint protocol — a
//! master-key-signed hash that constrains the best chain to its descendants.

use quill_core::{CodecError, Decodable, Encodable, Hash256, Reader};
use quill_crypto::{sha256d, KeyPair, PubKey};

use crate::error::ConsensusError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedSyncCheckpoint {
    pub version: i32,
    pub hash_checkpoint: Hash256,
}

impl Encodable for UnsignedSyncCheckpoint {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.hash_checkpoint.encode(out);
    }
}

impl Decodable for UnsignedSyncCheckpoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(UnsignedSyncCheckpoint {
            version: i32::decode(r)?,
            hash_checkpoint: Hash256::decode(r)?,
        })
    }
}

/// The wire message: serialized payload plus a DER ECDSA signature over
/// sha256d of the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCheckpoint {
    pub msg: Vec<u8>,
    pub sig: Vec<u8>,
}

impl SyncCheckpoint {
    pub fn sign(hash_checkpoint: Hash256, master: &KeyPair) -> Self {
        let payload = UnsignedSyncCheckpoint {
            version: 1,
            hash_checkpoint,
        };
        let msg = payload.to_bytes();
        let sig = master.sign(&sha256d(&msg));
        SyncCheckpoint { msg, sig }
    }

    /// Verify the master signature and recover the payload.
    pub fn verify(&self, master: &PubKey) -> Result<UnsignedSyncCheckpoint, ConsensusError> {
        master
            .verify(&sha256d(&self.msg), &self.sig)
            .map_err(|_| ConsensusError::BadSignatureEncoding)?;
        Ok(UnsignedSyncCheckpoint::from_bytes(&self.msg)?)
    }

    pub fn hash_checkpoint(&self) -> Result<Hash256, ConsensusError> {
        Ok(UnsignedSyncCheckpoint::from_bytes(&self.msg)?.hash_checkpoint)
    }
}

impl Encodable for SyncCheckpoint {
    fn encode(&self, out: &mut Vec<u8>) {
        self.msg.encode(out);
        self.sig.encode(out);
    }
}

impl Decodable for SyncCheckpoint {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(SyncCheckpoint {
            msg: Vec::<u8>::decode(r)?,
            sig: Vec::<u8>::decode(r)?,
        })
    }
}

/// Mutable sync-checkpoint bookkeeping held by the chain state.
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    /// Current accepted sync checkpoint (genesis hash at startup).
    pub current: Hash256,
    /// A verified checkpoint whose block has not arrived yet.
    pub pending: Option<SyncCheckpoint>,
    /// Last checkpoint that failed the descendant rule.
    pub invalid: Hash256,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let master = KeyPair::generate();
        let hash = Hash256([3; 32]);
        let cp = SyncCheckpoint::sign(hash, &master);
        let payload = cp.verify(&master.public()).unwrap();
        assert_eq!(payload.hash_checkpoint, hash);

        let other = KeyPair::generate();
        assert!(cp.verify(&other.public()).is_err());

        let mut tampered = cp.clone();
        tampered.msg = UnsignedSyncCheckpoint {
            version: 1,
            hash_checkpoint: Hash256([4; 32]),
        }
        .to_bytes();
        assert!(tampered.verify(&master.public()).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let master = KeyPair::generate();
        let cp = SyncCheckpoint::sign(Hash256([9; 32]), &master);
        let bytes = cp.to_bytes();
        assert_eq!(SyncCheckpoint::from_bytes(&bytes).unwrap(), cp);
    }
}
