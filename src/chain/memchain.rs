//! In-memory chain implementations.
//!
//! Deterministic, concurrency-safe stand-ins for the real chain stores,
//! used by the scenario tests and by startup scans in ephemeral setups.
//! Side blocks can be registered without becoming canonical, so reorg
//! reconciliation (walking parents back to a common ancestor) works the
//! same way it does against a persistent store.

use crate::blockcfg::{
    ChainFastEvent, ChainSnailHeadEvent, CommitteeMember, FastBlock, SnailBlock, SnailHeader,
    SwitchInfo,
};
use crate::chain::{FastChain, SnailChain};
use crate::event::{Feed, Subscription};
use crate::storage::{Database, MemDb};
use primitive_types::H256;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

struct SnailInner {
    by_hash: HashMap<H256, Arc<SnailBlock>>,
    canonical: HashMap<u64, Arc<SnailBlock>>,
    fruit_owner: HashMap<H256, Arc<SnailBlock>>,
    head: Arc<SnailBlock>,
}

/// In-memory snail chain.
pub struct MemorySnailChain {
    inner: RwLock<SnailInner>,
    genesis_committee: Vec<CommitteeMember>,
    db: Arc<dyn Database>,
    head_feed: Feed<ChainSnailHeadEvent>,
}

impl MemorySnailChain {
    pub fn new(genesis_committee: Vec<CommitteeMember>) -> Self {
        Self::with_database(genesis_committee, Arc::new(MemDb::new()))
    }

    pub fn with_database(
        genesis_committee: Vec<CommitteeMember>,
        db: Arc<dyn Database>,
    ) -> Self {
        let genesis = Arc::new(SnailBlock::new_block(
            SnailHeader::default(),
            Vec::new(),
            Vec::new(),
        ));
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash(), Arc::clone(&genesis));
        let mut canonical = HashMap::new();
        canonical.insert(0, Arc::clone(&genesis));
        MemorySnailChain {
            inner: RwLock::new(SnailInner {
                by_hash,
                canonical,
                fruit_owner: HashMap::new(),
                head: genesis,
            }),
            genesis_committee,
            db,
            head_feed: Feed::new(),
        }
    }

    /// Registers a block without touching the canonical chain; the block
    /// becomes reachable by hash only. Used to stage fork branches.
    pub fn insert(&self, block: Arc<SnailBlock>) {
        let mut inner = self.inner.write().unwrap();
        inner.by_hash.insert(block.hash(), block);
    }

    /// Appends `block` as the new canonical head and publishes the head
    /// event.
    pub fn extend(&self, block: Arc<SnailBlock>) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.by_hash.insert(block.hash(), Arc::clone(&block));
            inner.canonical.insert(block.number(), Arc::clone(&block));
            for fruit in block.fruits() {
                inner
                    .fruit_owner
                    .insert(fruit.fast_hash(), Arc::clone(&block));
            }
            inner.head = Arc::clone(&block);
        }
        self.head_feed.send(ChainSnailHeadEvent { block });
    }

    /// Makes a previously [`insert`](Self::insert)ed block the head,
    /// rebuilding the canonical index by walking its ancestry. This is
    /// how tests drive reorgs.
    pub fn set_head(&self, block: Arc<SnailBlock>) {
        {
            let mut inner = self.inner.write().unwrap();
            inner.by_hash.insert(block.hash(), Arc::clone(&block));

            let mut canonical = HashMap::new();
            let mut fruit_owner = HashMap::new();
            let mut cursor = Arc::clone(&block);
            loop {
                canonical.insert(cursor.number(), Arc::clone(&cursor));
                for fruit in cursor.fruits() {
                    fruit_owner
                        .entry(fruit.fast_hash())
                        .or_insert_with(|| Arc::clone(&cursor));
                }
                if cursor.number() == 0 {
                    break;
                }
                let parent = inner.by_hash.get(&cursor.parent_hash()).cloned();
                match parent {
                    Some(parent) => cursor = parent,
                    None => break,
                }
            }
            inner.canonical = canonical;
            inner.fruit_owner = fruit_owner;
            inner.head = Arc::clone(&block);
        }
        self.head_feed.send(ChainSnailHeadEvent { block });
    }
}

impl SnailChain for MemorySnailChain {
    fn current_block(&self) -> Arc<SnailBlock> {
        Arc::clone(&self.inner.read().unwrap().head)
    }

    fn current_header(&self) -> SnailHeader {
        self.inner.read().unwrap().head.header().clone()
    }

    fn get_block(&self, hash: H256, number: u64) -> Option<Arc<SnailBlock>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_hash
            .get(&hash)
            .filter(|b| b.number() == number)
            .cloned()
    }

    fn block_by_number(&self, number: u64) -> Option<Arc<SnailBlock>> {
        self.inner.read().unwrap().canonical.get(&number).cloned()
    }

    fn header_by_number(&self, number: u64) -> Option<SnailHeader> {
        self.inner
            .read()
            .unwrap()
            .canonical
            .get(&number)
            .map(|b| b.header().clone())
    }

    fn fruit_by_fast_hash(&self, fast_hash: H256) -> Option<(Arc<SnailBlock>, u64)> {
        let inner = self.inner.read().unwrap();
        let block = inner.fruit_owner.get(&fast_hash)?;
        let index = block
            .fruits()
            .iter()
            .position(|f| f.fast_hash() == fast_hash)? as u64;
        Some((Arc::clone(block), index))
    }

    fn genesis_committee(&self) -> Vec<CommitteeMember> {
        self.genesis_committee.clone()
    }

    fn database(&self) -> Arc<dyn Database> {
        Arc::clone(&self.db)
    }

    fn subscribe_chain_head_event(&self) -> Subscription<ChainSnailHeadEvent> {
        self.head_feed.subscribe()
    }
}

struct FastInner {
    by_hash: HashMap<H256, Arc<FastBlock>>,
    canonical: HashMap<u64, Arc<FastBlock>>,
    head: Arc<FastBlock>,
}

/// In-memory fast chain.
pub struct MemoryFastChain {
    inner: RwLock<FastInner>,
    event_feed: Feed<ChainFastEvent>,
}

impl MemoryFastChain {
    pub fn new() -> Self {
        let genesis = Arc::new(FastBlock::new(0, H256::zero(), None));
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash(), Arc::clone(&genesis));
        let mut canonical = HashMap::new();
        canonical.insert(0, Arc::clone(&genesis));
        MemoryFastChain {
            inner: RwLock::new(FastInner {
                by_hash,
                canonical,
                head: genesis,
            }),
            event_feed: Feed::new(),
        }
    }

    /// Appends one block carrying `switch_info` and publishes the head
    /// event. Returns the new head.
    pub fn extend(&self, switch_info: Option<SwitchInfo>) -> Arc<FastBlock> {
        let block = {
            let mut inner = self.inner.write().unwrap();
            let head = Arc::clone(&inner.head);
            let block = Arc::new(FastBlock::new(head.number() + 1, head.hash(), switch_info));
            inner.by_hash.insert(block.hash(), Arc::clone(&block));
            inner.canonical.insert(block.number(), Arc::clone(&block));
            inner.head = Arc::clone(&block);
            block
        };
        self.event_feed.send(ChainFastEvent {
            block: Arc::clone(&block),
        });
        block
    }

    /// Extends plain blocks until the head reaches `number`.
    pub fn advance_to(&self, number: u64) {
        while self.current_block().number() < number {
            self.extend(None);
        }
    }
}

impl Default for MemoryFastChain {
    fn default() -> Self {
        Self::new()
    }
}

impl FastChain for MemoryFastChain {
    fn current_block(&self) -> Arc<FastBlock> {
        Arc::clone(&self.inner.read().unwrap().head)
    }

    fn block_by_number(&self, number: u64) -> Option<Arc<FastBlock>> {
        self.inner.read().unwrap().canonical.get(&number).cloned()
    }

    fn block_by_hash(&self, hash: H256) -> Option<Arc<FastBlock>> {
        self.inner.read().unwrap().by_hash.get(&hash).cloned()
    }

    fn get_block(&self, hash: H256, number: u64) -> Option<Arc<FastBlock>> {
        let inner = self.inner.read().unwrap();
        inner
            .by_hash
            .get(&hash)
            .filter(|b| b.number() == number)
            .cloned()
    }

    fn subscribe_chain_event(&self) -> Subscription<ChainFastEvent> {
        self.event_feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockcfg::SnailHeader;

    fn block_on(parent: &SnailBlock, number: u64) -> Arc<SnailBlock> {
        let header = SnailHeader {
            parent_hash: parent.hash(),
            number,
            ..Default::default()
        };
        Arc::new(SnailBlock::new_block(header, Vec::new(), Vec::new()))
    }

    #[tokio::test]
    async fn extend_publishes_head_events() {
        let chain = MemorySnailChain::new(Vec::new());
        let mut sub = chain.subscribe_chain_head_event();

        let genesis = chain.current_block();
        let b1 = block_on(&genesis, 1);
        chain.extend(Arc::clone(&b1));

        let ev = sub.recv().await.unwrap();
        assert_eq!(ev.block.hash(), b1.hash());
        assert_eq!(chain.current_header().number, 1);
    }

    #[test]
    fn set_head_rebuilds_the_canonical_index() {
        let chain = MemorySnailChain::new(Vec::new());
        let genesis = chain.current_block();

        let a1 = block_on(&genesis, 1);
        let a2 = block_on(&a1, 2);
        chain.extend(Arc::clone(&a1));
        chain.extend(Arc::clone(&a2));

        let b1 = {
            let mut header = SnailHeader {
                parent_hash: genesis.hash(),
                number: 1,
                ..Default::default()
            };
            header.point_number = 1; // distinguish from a1
            Arc::new(SnailBlock::new_block(header, Vec::new(), Vec::new()))
        };
        chain.insert(Arc::clone(&b1));
        chain.set_head(Arc::clone(&b1));

        assert_eq!(chain.current_block().hash(), b1.hash());
        assert_eq!(chain.block_by_number(1).unwrap().hash(), b1.hash());
        assert!(chain.block_by_number(2).is_none());
        // the fork block is still reachable by hash
        assert!(chain.get_block(a2.hash(), 2).is_some());
    }

    #[test]
    fn fast_chain_lookup_by_hash_and_number() {
        let chain = MemoryFastChain::new();
        chain.advance_to(3);
        let head = chain.current_block();
        assert_eq!(head.number(), 3);
        assert!(chain.get_block(head.hash(), 3).is_some());
        assert!(chain.get_block(head.hash(), 2).is_none());
        assert_eq!(chain.block_by_number(2).unwrap().number(), 2);
    }
}
