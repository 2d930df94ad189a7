//! Chain state: the in-memory block index, block connect/disconnect, best
//! chain selection with reorganization and registry replay, checkpoints, and
//! the startup bootstrap.

pub mod bootstrap;
pub mod checkpoints;
pub mod clock;
pub mod connect;
pub mod error;
pub mod index;
pub mod modifier;
pub mod reorg;
pub mod state;

pub use checkpoints::{SyncCheckpoint, UnsignedSyncCheckpoint};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConsensusError, ErrorKind};
pub use index::{BlockIndex, BlockIndexEntry, NodeId};
pub use state::{ChainState, Consensus, ShutdownFlag};
