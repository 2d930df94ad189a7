//! The character NFT roster. A fixed per-network table maps NFT ids to their
//! registered nicknames; purchases may claim a character by id or nickname
//! and take over its nickname as the staker alias.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use quill_core::{Hash256, Network};
use quill_crypto::sha256d;

use crate::alias::to_lowercase_safe;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QpNft {
    /// sha256d of the character artwork.
    pub hash: Hash256,
    pub nickname: String,
    pub full_name: String,
    pub collection: String,
    pub artist: String,
    pub number: u32,
    pub of: u32,
    pub char_key: String,
}

fn nft(nick: &str, full: &str, number: u32, of: u32) -> QpNft {
    QpNft {
        hash: Hash256(sha256d(full.as_bytes())),
        nickname: nick.to_string(),
        full_name: full.to_string(),
        collection: "founders".to_string(),
        artist: "quill studio".to_string(),
        number,
        of,
        char_key: to_lowercase_safe(nick),
    }
}

static NFTS_MAIN: Lazy<BTreeMap<u32, QpNft>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    map.insert(1, nft("Aurelia", "Aurelia of the First Round", 1, 6));
    map.insert(2, nft("Brakkus", "Brakkus the Slotkeeper", 2, 6));
    map.insert(3, nft("Cinder", "Cinder Nine Hashes", 3, 6));
    map.insert(4, nft("Dray", "Dray the Missed", 4, 6));
    map.insert(5, nft("Evenfall", "Evenfall Queuewright", 5, 6));
    map.insert(6, nft("Fenwick", "Fenwick of the Forks", 6, 6));
    map
});

static NFTS_TEST: Lazy<BTreeMap<u32, QpNft>> = Lazy::new(|| {
    let mut map = BTreeMap::new();
    map.insert(1, nft("Testa", "Testa the Rehearsal", 1, 2));
    map.insert(2, nft("Mockram", "Mockram Dry Run", 2, 2));
    map
});

static NFT_LOOKUP_MAIN: Lazy<BTreeMap<String, u32>> = Lazy::new(|| {
    NFTS_MAIN
        .iter()
        .map(|(id, n)| (to_lowercase_safe(&n.nickname), *id))
        .collect()
});

static NFT_LOOKUP_TEST: Lazy<BTreeMap<String, u32>> = Lazy::new(|| {
    NFTS_TEST
        .iter()
        .map(|(id, n)| (to_lowercase_safe(&n.nickname), *id))
        .collect()
});

pub fn nfts(network: Network) -> &'static BTreeMap<u32, QpNft> {
    match network {
        Network::Mainnet => &NFTS_MAIN,
        Network::Testnet => &NFTS_TEST,
    }
}

/// Lowercased nickname to NFT id.
pub fn nft_lookup(network: Network) -> &'static BTreeMap<String, u32> {
    match network {
        Network::Mainnet => &NFT_LOOKUP_MAIN,
        Network::Testnet => &NFT_LOOKUP_TEST,
    }
}
