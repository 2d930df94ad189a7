//! Hashing and signature primitives for the quill consensus core.
//!
//! Block identity uses `chain9`, a nine-stage composed digest over the header
//! bytes. Transaction ids, merkle nodes and checkpoint payloads use double
//! SHA-256. Keys are 33-byte compressed secp256k1 points and signatures are
//! DER-encoded ECDSA over 32-byte digests.

use once_cell::sync::Lazy;
use secp256k1::{ecdsa, All, Message, Secp256k1};
use sha2::{Digest, Sha256, Sha512};
use sha3::Sha3_512;
use thiserror::Error;

pub const PUBKEY_LEN: usize = 33;
pub const SECKEY_LEN: usize = 32;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("public key is not a valid compressed secp256k1 point")]
    BadPubKey,
    #[error("secret key out of range")]
    BadSecKey,
    #[error("signature is not valid DER")]
    BadSignatureEncoding,
    #[error("signature does not verify")]
    BadSignature,
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// Double SHA-256, the workhorse digest for txids and merkle nodes.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Nine-stage composed block hash.
///
/// Stages cycle Sha512, Sha3-512, BLAKE3 three times; the final BLAKE3 stage
/// yields the 32-byte digest. The stage list is a frozen consensus rule: any
/// change diverges every block hash on the network.
pub fn chain9(data: &[u8]) -> [u8; 32] {
    let mut buf: Vec<u8> = data.to_vec();
    for stage in 0..9 {
        buf = match stage % 3 {
            0 => Sha512::digest(&buf).to_vec(),
            1 => Sha3_512::digest(&buf).to_vec(),
            _ => blake3::hash(&buf).as_bytes().to_vec(),
        };
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&buf);
    out
}

/// A 33-byte compressed secp256k1 public key.
///
/// Ordering is byte-lexicographic so keys can serve as map keys in the
/// registry ledgers with a stable serialization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubKey(pub [u8; PUBKEY_LEN]);

impl PubKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != PUBKEY_LEN {
            return Err(KeyError::BadPubKey);
        }
        let mut buf = [0u8; PUBKEY_LEN];
        buf.copy_from_slice(bytes);
        let key = PubKey(buf);
        if !key.is_compressed() {
            return Err(KeyError::BadPubKey);
        }
        // full curve check, not just the prefix byte
        secp256k1::PublicKey::from_slice(bytes).map_err(|_| KeyError::BadPubKey)?;
        Ok(key)
    }

    pub fn is_compressed(&self) -> bool {
        self.0[0] == 0x02 || self.0[0] == 0x03
    }

    pub fn as_bytes(&self) -> &[u8; PUBKEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a DER ECDSA signature over a 32-byte digest.
    pub fn verify(&self, digest: &[u8; 32], sig_der: &[u8]) -> Result<(), KeyError> {
        let pk = secp256k1::PublicKey::from_slice(&self.0).map_err(|_| KeyError::BadPubKey)?;
        let sig = ecdsa::Signature::from_der(sig_der).map_err(|_| KeyError::BadSignatureEncoding)?;
        let msg = Message::from_digest(*digest);
        SECP.verify_ecdsa(&msg, &sig, &pk)
            .map_err(|_| KeyError::BadSignature)
    }
}

impl std::fmt::Display for PubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A signing keypair. Secret material only lives in tests and the checkpoint
/// master tooling; consensus validation never holds secrets.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: secp256k1::SecretKey,
    public: PubKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let (secret, public) = SECP.generate_keypair(&mut rand::thread_rng());
        KeyPair {
            secret,
            public: PubKey(public.serialize()),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        let secret = secp256k1::SecretKey::from_slice(bytes).map_err(|_| KeyError::BadSecKey)?;
        let public = secp256k1::PublicKey::from_secret_key(&SECP, &secret);
        Ok(KeyPair {
            secret,
            public: PubKey(public.serialize()),
        })
    }

    pub fn public(&self) -> PubKey {
        self.public
    }

    /// Produce a DER ECDSA signature over a 32-byte digest.
    pub fn sign(&self, digest: &[u8; 32]) -> Vec<u8> {
        let msg = Message::from_digest(*digest);
        SECP.sign_ecdsa(&msg, &self.secret).serialize_der().to_vec()
    }
}

/// Integer square root, used by the staker weight formula.
pub fn isqrt(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    let mut x = n;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + n / x) / 2;
    }
    x
}
