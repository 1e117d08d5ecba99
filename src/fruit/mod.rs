//! Fruit memory pool.
//!
//! Candidate fruits enter from the network or the local sealer, pass the
//! admission rules against both chain heads, and wait in `pending` until a
//! snail block includes them. All map mutations happen on one writer task
//! fed by an MPSC channel; readers copy out under a shared lock.

mod journal;
mod pool;

pub use journal::SnailJournal;
pub use pool::{PoolProcess, SnailPool};

use crate::consensus;

/// Per-fruit admission failures reported back to batch callers. These
/// never escape the pool's event loop.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid sign")]
    InvalidSign,
    #[error("invalid hash")]
    InvalidHash,
    #[error("fruit pool capacity exceeded")]
    ExceedNumber,
    #[error("referenced fast block does not exist")]
    NotExist,
    #[error("snail chain below the fruit's pointer")]
    SnailHeightNotYet,
    #[error("fruit pointer outside the freshness window")]
    NotFresh,
}

impl From<consensus::Error> for Error {
    fn from(err: consensus::Error) -> Self {
        match err {
            consensus::Error::SnailHeightNotYet => Error::SnailHeightNotYet,
            consensus::Error::NotFresh | consensus::Error::UnknownPointer => Error::NotFresh,
            consensus::Error::InvalidPow => Error::InvalidHash,
            consensus::Error::InvalidSignHash => Error::InvalidSign,
        }
    }
}
