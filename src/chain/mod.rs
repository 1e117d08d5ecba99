//! Read-only chain adapter traits.
//!
//! The pool and the election engine never own chain state; they see the
//! two chains through these capability interfaces plus a head-event
//! subscription. Implementations must tolerate concurrent readers.

pub mod memchain;

use crate::blockcfg::{
    ChainFastEvent, ChainSnailHeadEvent, CommitteeMember, FastBlock, SnailBlock, SnailHeader,
};
use crate::event::Subscription;
use crate::storage::Database;
use primitive_types::H256;
use std::sync::Arc;

/// Read-only view over the BFT fast chain.
pub trait FastChain: Send + Sync {
    /// Head block of the fast chain.
    fn current_block(&self) -> Arc<FastBlock>;

    /// Block at the given height on the canonical chain.
    fn block_by_number(&self, number: u64) -> Option<Arc<FastBlock>>;

    /// Block by its hash, canonical or not.
    fn block_by_hash(&self, hash: H256) -> Option<Arc<FastBlock>>;

    /// Block matched by both hash and height; the fruit pool's existence
    /// check for a fruit's referenced fast block.
    fn get_block(&self, hash: H256, number: u64) -> Option<Arc<FastBlock>>;

    /// Head-change events.
    fn subscribe_chain_event(&self) -> Subscription<ChainFastEvent>;
}

/// Read-only view over the PoW snail chain.
pub trait SnailChain: Send + Sync {
    /// Head block of the snail chain.
    fn current_block(&self) -> Arc<SnailBlock>;

    /// Head header of the snail chain.
    fn current_header(&self) -> SnailHeader;

    /// Block matched by both hash and height.
    fn get_block(&self, hash: H256, number: u64) -> Option<Arc<SnailBlock>>;

    /// Block at the given height on the canonical chain.
    fn block_by_number(&self, number: u64) -> Option<Arc<SnailBlock>>;

    /// Header at the given height on the canonical chain.
    fn header_by_number(&self, number: u64) -> Option<SnailHeader>;

    /// The snail block containing the fruit that shadows `fast_hash`,
    /// along with the fruit's index inside it.
    fn fruit_by_fast_hash(&self, fast_hash: H256) -> Option<(Arc<SnailBlock>, u64)>;

    /// The committee written into the genesis block.
    fn genesis_committee(&self) -> Vec<CommitteeMember>;

    /// The opaque KV handle backing persisted committee state.
    fn database(&self) -> Arc<dyn Database>;

    /// Head-change events.
    fn subscribe_chain_head_event(&self) -> Subscription<ChainSnailHeadEvent>;
}
