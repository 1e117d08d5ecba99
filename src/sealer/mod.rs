//! Snail-chain proof-of-work sealer.
//!
//! One nonce search serves two products: a template that carries fruits
//! can seal a full block when the digest's high half meets the block
//! target, and any template that shadows a fast block (`fast_number != 0`)
//! can seal fruits when the low half meets the fruit target. [`Sealer::conseal`]
//! streams every find to the caller and keeps searching until a block
//! lands or the search is stopped.

pub mod dataset;
pub mod hashimoto;

use crate::blockcfg::{NewMinedBlockEvent, SnailBlock, SnailHeader};
use crate::chain::SnailChain;
use crate::consensus::{self, Engine, PowMode, FRUIT_FRESHNESS};
use crate::event::{Feed, Subscription};
use crate::settings::SealerConfig;
use crate::utils::async_msg::MessageBox;
use dataset::DatasetManager;
use hashimoto::{pow_digest, split_result, target_for};
use primitive_types::{H256, U256};
use rand::RngCore;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Mark the aggregate hashrate once per this many attempts.
const HASHRATE_MARK_INTERVAL: u64 = 1 << 12;

pub struct Sealer {
    mode: PowMode,
    /// Worker threads; 0 selects the CPU-derived default.
    threads: AtomicUsize,
    update: tokio::sync::Notify,
    shared: Option<Arc<Sealer>>,
    datasets: DatasetManager,
    hashrate: Arc<AtomicU64>,
    mined_feed: Feed<NewMinedBlockEvent>,
}

impl Sealer {
    pub fn new(config: SealerConfig) -> Arc<Self> {
        Arc::new(Sealer {
            mode: config.pow_mode,
            threads: AtomicUsize::new(config.threads),
            update: tokio::sync::Notify::new(),
            shared: None,
            datasets: DatasetManager::new(),
            hashrate: Arc::new(AtomicU64::new(0)),
            mined_feed: Feed::new(),
        })
    }

    /// A sealer that delegates all sealing to `shared`.
    pub fn new_shared(shared: Arc<Sealer>) -> Arc<Self> {
        Arc::new(Sealer {
            mode: PowMode::Shared,
            threads: AtomicUsize::new(0),
            update: tokio::sync::Notify::new(),
            shared: Some(shared),
            datasets: DatasetManager::new(),
            hashrate: Arc::new(AtomicU64::new(0)),
            mined_feed: Feed::new(),
        })
    }

    /// Changes the worker count; a running search restarts with the new
    /// value.
    pub fn set_threads(&self, threads: usize) {
        self.threads.store(threads, Ordering::SeqCst);
        self.update.notify_waiters();
    }

    /// Total attempts marked by workers since start.
    pub fn hashrate(&self) -> u64 {
        self.hashrate.load(Ordering::Relaxed)
    }

    /// Every seal found by [`conseal`](Self::conseal).
    pub fn subscribe_mined(&self) -> Subscription<NewMinedBlockEvent> {
        self.mined_feed.subscribe()
    }

    fn worker_count(&self) -> usize {
        match self.threads.load(Ordering::SeqCst) {
            0 => std::cmp::max(1, num_cpus::get().saturating_sub(1)),
            n => n,
        }
    }

    /// Resolves `Shared` delegation chains to the engine doing the work.
    fn backing(self: &Arc<Self>) -> Arc<Self> {
        let mut engine = Arc::clone(self);
        while let Some(shared) = engine.shared.clone() {
            engine = shared;
        }
        engine
    }

    fn zero_seal(block: &SnailBlock) -> SnailBlock {
        let mut header = block.header().clone();
        header.nonce = 0;
        header.mix_digest = H256::zero();
        block.with_seal(header)
    }

    /// Searches for a single satisfying seal. Returns `None` when the
    /// search is cancelled before anything is found.
    pub async fn seal(
        self: &Arc<Self>,
        chain: &dyn SnailChain,
        block: &SnailBlock,
        stop: &CancellationToken,
    ) -> Option<SnailBlock> {
        if matches!(self.mode, PowMode::Fake | PowMode::FullFake) {
            return Some(Self::zero_seal(block));
        }
        let engine = self.backing();
        engine.datasets.check_dataset_state(block.number(), chain);

        loop {
            let (mut rx, abort, handles) = engine.start_workers(block);
            tokio::select! {
                _ = stop.cancelled() => {
                    abort.store(true, Ordering::SeqCst);
                    join_workers(handles).await;
                    return None;
                }
                found = rx.recv() => {
                    abort.store(true, Ordering::SeqCst);
                    join_workers(handles).await;
                    return found;
                }
                _ = engine.update.notified() => {
                    abort.store(true, Ordering::SeqCst);
                    join_workers(handles).await;
                    // thread count changed, restart the search
                }
            }
        }
    }

    /// Continuous sealing: every find is handed to `send` (and published
    /// on the mined feed). A block find ends the search; fruit finds keep
    /// it running until `stop`.
    pub async fn conseal(
        self: &Arc<Self>,
        chain: &dyn SnailChain,
        block: &SnailBlock,
        stop: &CancellationToken,
        mut send: MessageBox<Arc<SnailBlock>>,
    ) {
        if matches!(self.mode, PowMode::Fake | PowMode::FullFake) {
            let sealed = Arc::new(Self::zero_seal(block));
            self.mined_feed.send(NewMinedBlockEvent {
                block: Arc::clone(&sealed),
            });
            let _ = send.send(sealed).await;
            return;
        }
        let engine = self.backing();
        engine.datasets.check_dataset_state(block.number(), chain);
        let mining_block = !block.fruits().is_empty();

        'search: loop {
            let (mut rx, abort, handles) = engine.start_workers(block);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        abort.store(true, Ordering::SeqCst);
                        join_workers(handles).await;
                        return;
                    }
                    found = rx.recv() => {
                        let sealed = match found {
                            Some(sealed) => Arc::new(sealed),
                            None => continue 'search,
                        };
                        let is_fruit = sealed.is_fruit();
                        engine.mined_feed.send(NewMinedBlockEvent {
                            block: Arc::clone(&sealed),
                        });
                        if send.send(sealed).await.is_err() {
                            abort.store(true, Ordering::SeqCst);
                            join_workers(handles).await;
                            return;
                        }
                        if !mining_block || !is_fruit {
                            abort.store(true, Ordering::SeqCst);
                            join_workers(handles).await;
                            return;
                        }
                    }
                    _ = engine.update.notified() => {
                        abort.store(true, Ordering::SeqCst);
                        join_workers(handles).await;
                        continue 'search;
                    }
                }
            }
        }
    }

    fn start_workers(
        &self,
        block: &SnailBlock,
    ) -> (
        mpsc::UnboundedReceiver<SnailBlock>,
        Arc<AtomicBool>,
        Vec<JoinHandle<()>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let abort = Arc::new(AtomicBool::new(false));
        let dataset = self.datasets.active();
        let template = Arc::new(block.clone());
        let threads = self.worker_count();

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let dataset = Arc::clone(&dataset);
            let template = Arc::clone(&template);
            let abort = Arc::clone(&abort);
            let tx = tx.clone();
            let hashrate = Arc::clone(&self.hashrate);
            let seed = rand::rngs::OsRng.next_u64();
            handles.push(std::thread::spawn(move || {
                mine(template, id, seed, dataset, abort, tx, hashrate)
            }));
        }
        (rx, abort, handles)
    }
}

async fn join_workers(handles: Vec<JoinHandle<()>>) {
    let _ = tokio::task::spawn_blocking(move || {
        for handle in handles {
            let _ = handle.join();
        }
    })
    .await;
}

/// One worker's incremental walk from its random starting nonce.
fn mine(
    block: Arc<SnailBlock>,
    id: usize,
    seed: u64,
    dataset: Arc<Vec<u64>>,
    abort: Arc<AtomicBool>,
    found: mpsc::UnboundedSender<SnailBlock>,
    hashrate: Arc<AtomicU64>,
) {
    let header = block.header();
    let hash = header.hash_no_nonce();
    let block_target = target_for(header.difficulty);
    let fruit_target = target_for(header.fruit_difficulty);
    let mining_block = !block.fruits().is_empty();

    tracing::trace!(
        miner = id,
        number = header.number,
        fast_number = header.fast_number,
        "started nonce search"
    );

    let mut nonce = seed;
    let mut attempts = 0u64;
    loop {
        if abort.load(Ordering::SeqCst) {
            tracing::trace!(miner = id, attempts = nonce.wrapping_sub(seed), "nonce search aborted");
            hashrate.fetch_add(attempts, Ordering::Relaxed);
            return;
        }

        attempts += 1;
        if attempts % HASHRATE_MARK_INTERVAL == 0 {
            hashrate.fetch_add(attempts, Ordering::Relaxed);
            attempts = 0;
        }

        let (digest, result) = pow_digest(&dataset, &hash, nonce);
        let (high, low) = split_result(&result);

        if mining_block && high <= block_target {
            let mut sealed = header.clone();
            sealed.nonce = nonce;
            sealed.mix_digest = digest;
            sealed.is_fruit = false;
            if found.send(block.with_seal(sealed)).is_ok() {
                tracing::trace!(miner = id, nonce, "block nonce found and reported");
            }
            return;
        }
        if header.fast_number != 0 && low <= fruit_target {
            let mut sealed = header.clone();
            sealed.nonce = nonce;
            sealed.mix_digest = digest;
            sealed.is_fruit = true;
            if found.send(block.with_seal(sealed)).is_err() {
                return;
            }
            tracing::trace!(miner = id, nonce, "fruit nonce found and reported");
        }
        nonce = nonce.wrapping_add(1);
    }
}

impl Engine for Sealer {
    fn get_difficulty(&self, header: &SnailHeader, is_fruit: bool) -> (U256, U256) {
        let required = if is_fruit {
            header.fruit_difficulty
        } else {
            header.difficulty
        };
        if self.mode != PowMode::Real {
            return (required, required);
        }
        let dataset = self.datasets.active();
        let (_, result) = pow_digest(&dataset, &header.hash_no_nonce(), header.nonce);
        let (high, low) = split_result(&result);
        let half = if is_fruit { low } else { high };
        let achieved = if half.is_zero() {
            U256::MAX
        } else {
            (U256::one() << 128) / half
        };
        (achieved, required)
    }

    fn verify_freshness(
        &self,
        chain: &dyn SnailChain,
        header: &SnailHeader,
    ) -> Result<(), consensus::Error> {
        let head = chain.current_header().number;
        if header.point_number > head {
            return Err(consensus::Error::SnailHeightNotYet);
        }
        if chain.header_by_number(header.point_number).is_none() {
            return Err(consensus::Error::UnknownPointer);
        }
        if head - header.point_number > FRUIT_FRESHNESS {
            return Err(consensus::Error::NotFresh);
        }
        Ok(())
    }

    fn verify_snail_header(
        &self,
        _chain: &dyn SnailChain,
        header: &SnailHeader,
    ) -> Result<(), consensus::Error> {
        if self.mode != PowMode::Real {
            return Ok(());
        }
        let dataset = self.datasets.active();
        let (digest, result) = pow_digest(&dataset, &header.hash_no_nonce(), header.nonce);
        if digest != header.mix_digest {
            return Err(consensus::Error::InvalidPow);
        }
        let (high, low) = split_result(&result);
        let satisfied = if header.is_fruit {
            low <= target_for(header.fruit_difficulty)
        } else {
            high <= target_for(header.difficulty)
        };
        if satisfied {
            Ok(())
        } else {
            Err(consensus::Error::InvalidPow)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockcfg::SnailHeader;
    use crate::chain::memchain::MemorySnailChain;
    use crate::utils::async_msg;
    use futures::StreamExt;

    fn fruit_template() -> SnailBlock {
        let header = SnailHeader {
            number: 3,
            point_number: 1,
            fast_number: 12,
            fast_hash: H256::repeat_byte(0xab),
            // unit difficulties make every nonce a winner
            difficulty: U256::one(),
            fruit_difficulty: U256::one(),
            ..Default::default()
        };
        SnailBlock::new_fruit(header, Vec::new())
    }

    fn block_template() -> SnailBlock {
        let mut fruit_header = fruit_template().header().clone();
        fruit_header.is_fruit = true;
        let fruit = SnailBlock::new_fruit(fruit_header, Vec::new());
        let header = SnailHeader {
            number: 3,
            fast_number: 0,
            difficulty: U256::one(),
            fruit_difficulty: U256::one(),
            ..Default::default()
        };
        SnailBlock::new_block(header, vec![fruit], Vec::new())
    }

    #[tokio::test]
    async fn fake_mode_seals_with_zeroed_nonce_and_digest() {
        let sealer = Sealer::new(SealerConfig {
            pow_mode: PowMode::Fake,
            threads: 1,
        });
        let chain = MemorySnailChain::new(Vec::new());
        let stop = CancellationToken::new();
        let sealed = sealer.seal(&chain, &fruit_template(), &stop).await.unwrap();
        assert_eq!(sealed.header().nonce, 0);
        assert_eq!(sealed.header().mix_digest, H256::zero());
    }

    #[tokio::test]
    async fn fruit_seal_satisfies_the_low_half_target() {
        let sealer = Sealer::new(SealerConfig {
            pow_mode: PowMode::Real,
            threads: 2,
        });
        let chain = MemorySnailChain::new(Vec::new());
        let stop = CancellationToken::new();
        let template = fruit_template();
        let sealed = sealer.seal(&chain, &template, &stop).await.unwrap();

        assert!(sealed.is_fruit());
        let dataset = sealer.datasets.active();
        let (digest, result) = pow_digest(
            &dataset,
            &sealed.header().hash_no_nonce(),
            sealed.header().nonce,
        );
        assert_eq!(digest, sealed.header().mix_digest);
        let (_, low) = split_result(&result);
        assert!(low <= target_for(template.header().fruit_difficulty));
        assert!(sealer.verify_snail_header(&chain, sealed.header()).is_ok());
    }

    #[tokio::test]
    async fn block_seal_satisfies_the_high_half_target() {
        let sealer = Sealer::new(SealerConfig {
            pow_mode: PowMode::Real,
            threads: 2,
        });
        let chain = MemorySnailChain::new(Vec::new());
        let stop = CancellationToken::new();
        let template = block_template();

        let (send, mut queue) = async_msg::channel(16);
        sealer.conseal(&chain, &template, &stop, send).await;

        // the search ends on a block find; fruits may precede it
        let mut sealed_block = None;
        while let Some(sealed) = queue.next().await {
            if !sealed.is_fruit() {
                sealed_block = Some(sealed);
            }
        }
        let sealed = sealed_block.expect("conseal ends with a sealed block");
        assert!(sealer.verify_snail_header(&chain, sealed.header()).is_ok());
    }

    #[tokio::test]
    async fn cancelled_search_produces_no_output() {
        let sealer = Sealer::new(SealerConfig {
            pow_mode: PowMode::Real,
            threads: 1,
        });
        let chain = MemorySnailChain::new(Vec::new());
        let stop = CancellationToken::new();
        stop.cancel();

        // an impossible target keeps the workers from finding anything
        let mut header = fruit_template().header().clone();
        header.difficulty = U256::MAX;
        header.fruit_difficulty = U256::MAX;
        let template = SnailBlock::new_fruit(header, Vec::new());

        assert!(sealer.seal(&chain, &template, &stop).await.is_none());
    }

    #[tokio::test]
    async fn shared_mode_delegates_to_the_backing_engine() {
        let backing = Sealer::new(SealerConfig {
            pow_mode: PowMode::Real,
            threads: 1,
        });
        let shared = Sealer::new_shared(Arc::clone(&backing));
        let chain = MemorySnailChain::new(Vec::new());
        let stop = CancellationToken::new();
        let sealed = shared.seal(&chain, &fruit_template(), &stop).await.unwrap();
        assert!(backing.verify_snail_header(&chain, sealed.header()).is_ok());
    }

    #[test]
    fn freshness_window_boundaries() {
        let sealer = Sealer::new(SealerConfig::default());
        let chain = MemorySnailChain::new(Vec::new());

        let mut header = SnailHeader {
            point_number: 5,
            ..Default::default()
        };
        // head is 0: pointer in the future
        assert_eq!(
            sealer.verify_freshness(&chain, &header),
            Err(consensus::Error::SnailHeightNotYet)
        );
        header.point_number = 0;
        assert!(sealer.verify_freshness(&chain, &header).is_ok());
    }
}
