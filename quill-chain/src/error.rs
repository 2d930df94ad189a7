//! The consensus error taxonomy. Malformed and Invariant failures carry a
//! DoS score the caller attaches to the originating peer; Transient failures
//! queue their input for retry; Fatal failures abort the batch and surface
//! upward.

use thiserror::Error;

use quill_core::{CodecError, Hash256, OutPoint};
use quill_registry::RegistryError;
use quill_storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Malformed,
    Invariant,
    Transient,
    Fatal,
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    // ---- malformed ----
    #[error("malformed input: {0}")]
    Malformed(#[from] CodecError),
    #[error("bad block-file magic")]
    BadMagic,
    #[error("bad signature encoding")]
    BadSignatureEncoding,

    // ---- invariant ----
    #[error("block already known: {0}")]
    DuplicateBlock(Hash256),
    #[error("merkle root mismatch")]
    BadMerkleRoot,
    #[error("bad proof: {0}")]
    BadProof(&'static str),
    #[error("block timestamp violates ordering rules")]
    BadTimestamp,
    #[error("qPoS block timestamp outside the producer's slot window")]
    TimestampOutOfWindow,
    #[error("value out of money range")]
    ValueOutOfRange,
    #[error("inputs below outputs plus fees")]
    InputsBelowOutputs,
    #[error("double spend of {0:?}")]
    DoubleSpend(OutPoint),
    #[error("spends an immature coinbase or coinstake")]
    SpendsImmature,
    #[error("operation signer not authorized")]
    BadSigner,
    #[error("block signature invalid")]
    BadBlockSignature,
    #[error("block conflicts with a hardened checkpoint at height {0}")]
    HardenedCheckpointMismatch(i32),
    #[error("block is not a descendant of the sync checkpoint")]
    CheckpointNotDescendant,
    #[error("registry rejected the block: {0}")]
    Registry(#[from] RegistryError),

    // ---- transient ----
    #[error("missing previous output {0:?}")]
    MissingPrevout(OutPoint),
    #[error("orphan block: parent {0} unknown")]
    OrphanBlock(Hash256),
    #[error("sync checkpoint pending: block {0} not yet known")]
    PendingSyncCheckpoint(Hash256),

    // ---- fatal ----
    #[error("durable store failure: {0}")]
    Store(#[from] StoreError),
    #[error("registry replay diverged: {0}")]
    ReplayFailed(String),
}

impl ConsensusError {
    pub fn kind(&self) -> ErrorKind {
        use ConsensusError::*;
        match self {
            Malformed(_) | BadMagic | BadSignatureEncoding => ErrorKind::Malformed,
            DuplicateBlock(_) | BadMerkleRoot | BadProof(_) | BadTimestamp
            | TimestampOutOfWindow | ValueOutOfRange | InputsBelowOutputs | DoubleSpend(_)
            | SpendsImmature | BadSigner | BadBlockSignature | HardenedCheckpointMismatch(_)
            | CheckpointNotDescendant | Registry(_) => ErrorKind::Invariant,
            MissingPrevout(_) | OrphanBlock(_) | PendingSyncCheckpoint(_) => ErrorKind::Transient,
            Store(_) | ReplayFailed(_) => ErrorKind::Fatal,
        }
    }

    /// DoS score for the peer that delivered the offending input.
    pub fn dos_points(&self) -> u32 {
        use ConsensusError::*;
        match self.kind() {
            ErrorKind::Malformed => 100,
            ErrorKind::Invariant => match self {
                DuplicateBlock(_) => 0,
                BadMerkleRoot | BadProof(_) | DoubleSpend(_) | BadBlockSignature => 100,
                HardenedCheckpointMismatch(_) | CheckpointNotDescendant => 100,
                Registry(RegistryError::ClaimTooSoon) => 10,
                _ => 50,
            },
            ErrorKind::Transient | ErrorKind::Fatal => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_and_scores() {
        let orphan = ConsensusError::OrphanBlock(Hash256::ZERO);
        assert_eq!(orphan.kind(), ErrorKind::Transient);
        assert_eq!(orphan.dos_points(), 0);

        let merkle = ConsensusError::BadMerkleRoot;
        assert_eq!(merkle.kind(), ErrorKind::Invariant);
        assert_eq!(merkle.dos_points(), 100);

        let claim = ConsensusError::Registry(RegistryError::ClaimTooSoon);
        assert_eq!(claim.kind(), ErrorKind::Invariant);
        assert_eq!(claim.dos_points(), 10);

        let mal = ConsensusError::Malformed(CodecError::BadCompactSize);
        assert_eq!(mal.kind(), ErrorKind::Malformed);
        assert_eq!(mal.dos_points(), 100);
    }
}
