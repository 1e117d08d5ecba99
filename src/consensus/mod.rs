//! Engine-facing seams shared by the sealer, the fruit pool and the
//! election engine.
//!
//! The pool and the election engine never call into the sealer directly;
//! they hold these capability traits instead, which keeps the dependency
//! graph acyclic and lets tests substitute deterministic oracles.

use crate::blockcfg::{SnailBlock, SnailHeader};
use crate::chain::SnailChain;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

/// How far behind the snail head a fruit's pointer may lag and still be
/// accepted.
pub const FRUIT_FRESHNESS: u64 = 17;

/// Proof-of-work operating mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowMode {
    /// Full nonce search against the real targets.
    #[default]
    Real,
    /// Accept immediately with a zeroed seal; targets still verified as
    /// trivially satisfied.
    Fake,
    /// Accept everything, verify nothing.
    FullFake,
    /// Delegate sealing to a shared engine instance.
    Shared,
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The snail chain has not reached the fruit's pointer yet. Callers
    /// treat this as "retry later", never as a rejection.
    #[error("snail chain below the fruit's pointer")]
    SnailHeightNotYet,
    #[error("fruit pointer outside the freshness window")]
    NotFresh,
    #[error("proof of work below the required target")]
    InvalidPow,
    #[error("pointed snail block unknown")]
    UnknownPointer,
    #[error("invalid sign hash commitment")]
    InvalidSignHash,
}

/// Consensus queries the election and the pool need answered about snail
/// headers.
pub trait Engine: Send + Sync {
    /// Returns `(achieved, required)` difficulty for the sealed header,
    /// fruit- or block-side depending on `is_fruit`. The election's
    /// candidate weight is the surplus `achieved - required`.
    fn get_difficulty(&self, header: &SnailHeader, is_fruit: bool) -> (U256, U256);

    /// Checks that the fruit's `point_number` is inside the freshness
    /// window against the current snail head.
    fn verify_freshness(
        &self,
        chain: &dyn SnailChain,
        header: &SnailHeader,
    ) -> Result<(), Error>;

    /// Full header verification: seal validity against the active lookup
    /// table plus the freshness window.
    fn verify_snail_header(
        &self,
        chain: &dyn SnailChain,
        header: &SnailHeader,
    ) -> Result<(), Error>;
}

impl<E: Engine + ?Sized> Engine for std::sync::Arc<E> {
    fn get_difficulty(&self, header: &SnailHeader, is_fruit: bool) -> (U256, U256) {
        (**self).get_difficulty(header, is_fruit)
    }

    fn verify_freshness(
        &self,
        chain: &dyn SnailChain,
        header: &SnailHeader,
    ) -> Result<(), Error> {
        (**self).verify_freshness(chain, header)
    }

    fn verify_snail_header(
        &self,
        chain: &dyn SnailChain,
        header: &SnailHeader,
    ) -> Result<(), Error> {
        (**self).verify_snail_header(chain, header)
    }
}

/// Fruit admission validation used by the pool's single-writer loop.
pub trait SnailValidator: Send + Sync {
    fn validate_fruit(&self, chain: &dyn SnailChain, fruit: &SnailBlock) -> Result<(), Error>;
}

/// The standard validator: sign-hash integrity plus the engine's header
/// checks.
pub struct EngineValidator<E> {
    engine: E,
    /// When false only the cheap integrity check runs.
    full_validation: bool,
}

impl<E: Engine> EngineValidator<E> {
    pub fn new(engine: E, full_validation: bool) -> Self {
        EngineValidator {
            engine,
            full_validation,
        }
    }
}

impl<E: Engine> SnailValidator for EngineValidator<E> {
    fn validate_fruit(&self, chain: &dyn SnailChain, fruit: &SnailBlock) -> Result<(), Error> {
        if crate::crypto::calc_sign_hash(fruit.signs()) != fruit.header().sign_hash {
            return Err(Error::InvalidSignHash);
        }
        if !self.full_validation {
            return Ok(());
        }
        self.engine.verify_freshness(chain, fruit.header())?;
        self.engine.verify_snail_header(chain, fruit.header())
    }
}
