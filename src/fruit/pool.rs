use crate::blockcfg::{ChainSnailHeadEvent, NewFruitsEvent, SnailBlock};
use crate::chain::{FastChain, SnailChain};
use crate::consensus::{self, Engine, SnailValidator};
use crate::crypto;
use crate::event::{Feed, Subscription};
use crate::fruit::{Error, SnailJournal};
use crate::settings::SnailPoolConfig;
use crate::utils::async_msg::{self, MessageBox, MessageQueue};
use futures::StreamExt;
use primitive_types::{H256, U256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

const FRUIT_CHAN_SIZE: usize = 1024;
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(8);
/// Reorgs deeper than this are reset without fruit reinjection.
const MAX_REORG_DEPTH: u64 = 64;

#[derive(Default)]
struct PoolInner {
    all_fruits: HashMap<H256, Arc<SnailBlock>>,
    pending: HashMap<H256, Arc<SnailBlock>>,
}

/// Shared handle onto the fruit pool. Cheap to clone; every mutation is
/// forwarded to the single writer loop behind [`PoolProcess`].
#[derive(Clone)]
pub struct SnailPool {
    config: SnailPoolConfig,
    chain: Arc<dyn SnailChain>,
    fastchain: Arc<dyn FastChain>,
    inner: Arc<RwLock<PoolInner>>,
    fruit_feed: Feed<NewFruitsEvent>,
    fruit_box: MessageBox<Arc<SnailBlock>>,
}

/// The pool's writer task: owns the fruit queue, the chain head
/// subscription and the journal. The subscription is taken at
/// construction so no head event can slip past before the loop runs.
pub struct PoolProcess {
    pool: SnailPool,
    engine: Arc<dyn Engine>,
    validator: Arc<dyn SnailValidator>,
    queue: MessageQueue<Arc<SnailBlock>>,
    head_events: Subscription<ChainSnailHeadEvent>,
    journal: Option<SnailJournal>,
}

impl SnailPool {
    pub fn new(
        config: SnailPoolConfig,
        fastchain: Arc<dyn FastChain>,
        chain: Arc<dyn SnailChain>,
        engine: Arc<dyn Engine>,
        validator: Arc<dyn SnailValidator>,
    ) -> (SnailPool, PoolProcess) {
        let config = config.sanitize();
        let (fruit_box, queue) = async_msg::channel(FRUIT_CHAN_SIZE);
        let journal = config.journal.as_ref().map(SnailJournal::new);
        let pool = SnailPool {
            config,
            chain,
            fastchain,
            inner: Arc::new(RwLock::new(PoolInner::default())),
            fruit_feed: Feed::new(),
            fruit_box,
        };
        let head_events = pool.chain.subscribe_chain_head_event();
        let process = PoolProcess {
            pool: pool.clone(),
            engine,
            validator,
            queue,
            head_events,
            journal,
        };
        (pool, process)
    }

    /// Enqueues a batch of fruits received from the network. The returned
    /// slice is aligned with the input; `None` marks a fruit handed to
    /// the writer loop.
    pub async fn add_remote_fruits(&self, fruits: Vec<SnailBlock>) -> Vec<Option<Error>> {
        self.enqueue(fruits).await
    }

    /// Enqueues a batch of locally mined fruits.
    pub async fn add_locals(&self, fruits: Vec<SnailBlock>) -> Vec<Option<Error>> {
        self.enqueue(fruits).await
    }

    async fn enqueue(&self, fruits: Vec<SnailBlock>) -> Vec<Option<Error>> {
        let mut errs = Vec::with_capacity(fruits.len());
        let mut sender = self.fruit_box.clone();
        for fruit in fruits {
            tracing::trace!(
                fast_number = fruit.fast_number(),
                pointer = fruit.point_number(),
                "fruit enqueued"
            );
            if crypto::calc_sign_hash(fruit.signs()) != fruit.header().sign_hash {
                tracing::debug!(
                    fast_number = fruit.fast_number(),
                    "rejecting fruit with broken sign hash"
                );
                errs.push(Some(Error::InvalidSign));
                continue;
            }
            if sender.send(Arc::new(fruit)).await.is_err() {
                tracing::warn!("fruit pool is shut down, dropping fruit");
            }
            errs.push(None);
        }
        errs
    }

    /// Copy of the verified fruits keyed by fast hash.
    pub fn pending_fruits(&self) -> HashMap<H256, Arc<SnailBlock>> {
        self.inner.read().unwrap().pending.clone()
    }

    /// Pending fruits sorted by fast number.
    pub fn content(&self) -> Vec<Arc<SnailBlock>> {
        let inner = self.inner.read().unwrap();
        sorted_by_fast_number(inner.pending.values().cloned())
    }

    /// Known-but-unverified fruits sorted by fast number.
    pub fn inspect(&self) -> Vec<Arc<SnailBlock>> {
        let inner = self.inner.read().unwrap();
        sorted_by_fast_number(
            inner
                .all_fruits
                .values()
                .filter(|f| !inner.pending.contains_key(&f.fast_hash()))
                .cloned(),
        )
    }

    /// `(pending, unverified)` counts.
    pub fn stats(&self) -> (usize, usize) {
        let inner = self.inner.read().unwrap();
        (
            inner.pending.len(),
            inner.all_fruits.len() - inner.pending.len(),
        )
    }

    /// Every known fruit sorted by fast number; the journal snapshot.
    pub fn local(&self) -> Vec<Arc<SnailBlock>> {
        let inner = self.inner.read().unwrap();
        sorted_by_fast_number(inner.all_fruits.values().cloned())
    }

    /// Drops the fruit for `fast_hash`; called when it was included on
    /// the snail chain.
    pub fn remove_pending_by_fast_hash(&self, fast_hash: H256) {
        let mut inner = self.inner.write().unwrap();
        inner.pending.remove(&fast_hash);
        inner.all_fruits.remove(&fast_hash);
    }

    /// Every fruit accepted into the pool.
    pub fn subscribe_new_fruit_event(&self) -> Subscription<NewFruitsEvent> {
        self.fruit_feed.subscribe()
    }
}

fn sorted_by_fast_number(
    fruits: impl Iterator<Item = Arc<SnailBlock>>,
) -> Vec<Arc<SnailBlock>> {
    let mut fruits: Vec<_> = fruits.collect();
    fruits.sort_by_key(|f| f.fast_number());
    fruits
}

fn hash_value(hash: H256) -> U256 {
    U256::from_big_endian(hash.as_bytes())
}

impl PoolProcess {
    /// Runs the pool's event loop until the chain head subscription
    /// closes. The loop is the only writer of the pool maps.
    pub async fn start(mut self) {
        self.reset(None, &self.pool.chain.current_block());
        self.load_journal();

        let mut report = tokio::time::interval(STATS_REPORT_INTERVAL);
        let mut journal = tokio::time::interval(self.pool.config.rejournal());
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        journal.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut head = self.pool.chain.current_block();
        loop {
            tokio::select! {
                event = self.head_events.recv() => match event {
                    Some(event) => {
                        self.reset(Some(&head), &event.block);
                        head = event.block;
                    }
                    // subscription closed on shutdown
                    None => break,
                },
                fruit = self.queue.next() => match fruit {
                    Some(fruit) => {
                        if let Err(err) = self.add_fruit(fruit) {
                            tracing::debug!(%err, "fruit rejected");
                        }
                    }
                    None => break,
                },
                _ = report.tick() => {
                    let (pending, unverified) = self.pool.stats();
                    tracing::debug!(pending, unverified, "fruit pool status");
                }
                _ = journal.tick() => self.rotate_journal(),
            }
        }
        tracing::info!("fruit pool stopped");
    }

    fn load_journal(&mut self) {
        let Some(journal) = &self.journal else {
            return;
        };
        match journal.load() {
            Ok(fruits) => {
                for fruit in fruits {
                    let _ = self.add_fruit(Arc::new(fruit));
                }
            }
            Err(err) => tracing::warn!(%err, "failed to load fruit journal"),
        }
        self.rotate_journal();
    }

    fn rotate_journal(&self) {
        if let Some(journal) = &self.journal {
            if let Err(err) = journal.rotate(&self.pool.local()) {
                tracing::warn!(%err, "failed to rotate fruit journal");
            }
        }
    }

    /// Synchronous admission of one fruit, used by the journal load and
    /// direct imports; see the module docs for the rule order.
    pub fn add_fruit(&self, fruit: Arc<SnailBlock>) -> Result<(), Error> {
        // fruits at or behind the last one included on the snail head are
        // stale; drop them silently
        let head = self.pool.chain.current_block();
        if head.number() > 0 {
            if let Some(last) = head.fruits().last() {
                if last.fast_number() >= fruit.fast_number() {
                    return Ok(());
                }
            }
        }

        let current_fast = self.pool.fastchain.current_block().number();
        if fruit.fast_number() > current_fast {
            return self.append_fruit(fruit, false);
        }

        if self
            .pool
            .fastchain
            .get_block(fruit.fast_hash(), fruit.fast_number())
            .is_none()
        {
            tracing::info!(
                fast_number = fruit.fast_number(),
                fast_hash = ?fruit.fast_hash(),
                "fruit references an unknown fast block"
            );
            return Err(Error::NotExist);
        }

        let existing = self
            .pool
            .inner
            .read()
            .unwrap()
            .all_fruits
            .get(&fruit.fast_hash())
            .cloned();

        if let Some(current) = existing {
            self.validator
                .validate_fruit(self.pool.chain.as_ref(), &fruit)
                .map_err(Error::from)?;
            match fruit.difficulty().cmp(&current.difficulty()) {
                Ordering::Less => Ok(()),
                Ordering::Equal => {
                    if hash_value(fruit.hash()) >= hash_value(current.hash()) {
                        Ok(())
                    } else {
                        self.append_fruit(fruit, true)
                    }
                }
                Ordering::Greater => self.append_fruit(fruit, true),
            }
        } else {
            match self.validator.validate_fruit(self.pool.chain.as_ref(), &fruit) {
                Ok(()) => self.append_fruit(fruit, true),
                Err(consensus::Error::SnailHeightNotYet) => self.append_fruit(fruit, false),
                Err(err) => {
                    tracing::debug!(fast_number = fruit.fast_number(), %err, "fruit validation failed");
                    Err(err.into())
                }
            }
        }
    }

    fn append_fruit(&self, fruit: Arc<SnailBlock>, pending: bool) -> Result<(), Error> {
        {
            let mut inner = self.pool.inner.write().unwrap();
            if inner.all_fruits.len() as u64 >= self.pool.config.fruit_count {
                return Err(Error::ExceedNumber);
            }
            inner.all_fruits.insert(fruit.fast_hash(), Arc::clone(&fruit));
            if pending {
                inner.pending.insert(fruit.fast_hash(), Arc::clone(&fruit));
                tracing::debug!(fast_number = fruit.fast_number(), "fruit pending");
            }
        }
        self.pool.fruit_feed.send(NewFruitsEvent {
            fruits: vec![fruit],
        });
        Ok(())
    }

    /// Reconciles the pool against a new snail head, reinjecting fruits
    /// dropped by a shallow reorg.
    pub(crate) fn reset(&self, old_head: Option<&Arc<SnailBlock>>, new_head: &Arc<SnailBlock>) {
        let mut reinject = Vec::new();

        if let Some(old) = old_head {
            if old.hash() != new_head.parent_hash() {
                let depth = old.number().abs_diff(new_head.number());
                if depth > MAX_REORG_DEPTH {
                    tracing::debug!(depth, "skipping deep fruit reorg");
                } else if let Some((discarded, included)) =
                    self.branch_fruits(old, new_head)
                {
                    reinject = fruits_difference(discarded, included);
                }
            }
        }

        tracing::debug!(count = reinject.len(), "reinjecting stale fruits");
        {
            let mut inner = self.pool.inner.write().unwrap();
            for fruit in reinject {
                inner.all_fruits.insert(fruit.fast_hash(), Arc::clone(&fruit));
                inner.pending.insert(fruit.fast_hash(), fruit);
            }
        }

        self.remove_included(new_head.fruits());
        self.remove_unfresh();
    }

    /// Walks both branches back to the common ancestor, collecting the
    /// fruits of each side. `None` when a branch is unrooted.
    fn branch_fruits(
        &self,
        old_head: &Arc<SnailBlock>,
        new_head: &Arc<SnailBlock>,
    ) -> Option<(Vec<Arc<SnailBlock>>, Vec<Arc<SnailBlock>>)> {
        let chain = self.pool.chain.as_ref();
        let mut discarded = Vec::new();
        let mut included = Vec::new();

        let mut rem = Arc::clone(old_head);
        let mut add = Arc::clone(new_head);

        let mut step_back = |block: &Arc<SnailBlock>, side: &str| {
            let parent_number = block.number().checked_sub(1)?;
            match chain.get_block(block.parent_hash(), parent_number) {
                Some(parent) => Some(parent),
                None => {
                    tracing::error!(
                        side,
                        number = block.number(),
                        hash = ?block.hash(),
                        "unrooted chain seen by fruit pool"
                    );
                    None
                }
            }
        };

        while rem.number() > add.number() {
            discarded.extend(rem.fruits().iter().cloned().map(Arc::new));
            rem = step_back(&rem, "old")?;
        }
        while add.number() > rem.number() {
            included.extend(add.fruits().iter().cloned().map(Arc::new));
            add = step_back(&add, "new")?;
        }
        while rem.hash() != add.hash() {
            discarded.extend(rem.fruits().iter().cloned().map(Arc::new));
            rem = step_back(&rem, "old")?;
            included.extend(add.fruits().iter().cloned().map(Arc::new));
            add = step_back(&add, "new")?;
        }
        Some((discarded, included))
    }

    /// Removes every pooled fruit the new head's fruit set supersedes.
    fn remove_included(&self, fruits: &[SnailBlock]) {
        let Some(max_fast) = fruits.iter().map(|f| f.fast_number()).max() else {
            return;
        };
        let mut inner = self.pool.inner.write().unwrap();
        inner.all_fruits.retain(|_, f| f.fast_number() > max_fast);
        inner.pending.retain(|_, f| f.fast_number() > max_fast);
    }

    /// Evicts fruits failing freshness against the new head; the pointer
    /// merely being ahead of the head is tolerated.
    fn remove_unfresh(&self) {
        let chain = self.pool.chain.as_ref();
        let mut inner = self.pool.inner.write().unwrap();
        let stale: Vec<H256> = inner
            .all_fruits
            .values()
            .filter_map(|fruit| {
                match self.engine.verify_freshness(chain, fruit.header()) {
                    Ok(()) | Err(consensus::Error::SnailHeightNotYet) => None,
                    Err(_) => Some(fruit.fast_hash()),
                }
            })
            .collect();
        for hash in stale {
            inner.all_fruits.remove(&hash);
            inner.pending.remove(&hash);
        }
    }
}

/// The old branch's fruits that the new branch did not re-include.
fn fruits_difference(
    discarded: Vec<Arc<SnailBlock>>,
    included: Vec<Arc<SnailBlock>>,
) -> Vec<Arc<SnailBlock>> {
    let keep: std::collections::HashSet<H256> = included.iter().map(|f| f.hash()).collect();
    discarded
        .into_iter()
        .filter(|f| !keep.contains(&f.hash()))
        .collect()
}
