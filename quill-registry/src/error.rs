use quill_core::Amount;
use thiserror::Error;

/// Failures raised while parsing or applying qPoS operations and advancing
/// the registry. The chain layer folds these into its consensus taxonomy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no staker with id {0}")]
    NoSuchStaker(u32),
    #[error("alias {0:?} is not a valid staker alias")]
    AliasInvalid(String),
    #[error("alias {0:?} is already registered")]
    AliasTaken(String),
    #[error("purchase carries {0} keys; expected 1 or 3")]
    WrongKeyCount(usize),
    #[error("delegate payout {0} out of range (0, 100000]")]
    BadPayout(u32),
    #[error("nft {0} does not exist or is already owned")]
    NftUnavailable(u32),
    #[error("purchase paid {paid} against price {price}")]
    BadPrice { paid: Amount, price: Amount },
    #[error("claim key not present in the ledger")]
    ClaimUnknownKey,
    #[error("claim of {value} exceeds balance {balance}")]
    ClaimExceedsBalance { value: Amount, balance: Amount },
    #[error("too soon to claim again")]
    ClaimTooSoon,
    #[error("balance underflow")]
    BalanceUnderflow,
    #[error("meta key {0:?} is not in the whitelist")]
    BadMetaKey(String),
    #[error("meta value fails the character or length check")]
    BadMetaValue,
    #[error("staker {0} cannot be enabled under the re-enable policy")]
    CannotEnable(u32),
    #[error("staker {0} is not in the current queue")]
    NotInQueue(u32),
    #[error("staker slot {slot} is not the current slot {current}")]
    SlotMismatch { slot: u32, current: u32 },
    #[error("a block was already produced for this slot")]
    SlotAlreadyProduced,
    #[error("no qualified stakers to build a queue from")]
    NoQualifiedStakers,
    #[error("malformed qpos payload: {0}")]
    MalformedOp(&'static str),
    #[error("snapshot write failed: {0}")]
    SnapshotWrite(String),
}
