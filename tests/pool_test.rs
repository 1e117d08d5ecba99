//! Fruit pool scenarios: capacity, replacement semantics and reorg
//! reconciliation through the event loop.

use primitive_types::{H256, U256};
use ratatosk::blockcfg::{SnailBlock, SnailHeader};
use ratatosk::chain::memchain::{MemoryFastChain, MemorySnailChain};
use ratatosk::chain::{FastChain, SnailChain};
use ratatosk::consensus::{Engine, EngineValidator, PowMode};
use ratatosk::crypto;
use ratatosk::fruit::{Error, PoolProcess, SnailPool};
use ratatosk::sealer::Sealer;
use ratatosk::settings::{SealerConfig, SnailPoolConfig};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    pool: SnailPool,
    process: PoolProcess,
    snail: Arc<MemorySnailChain>,
    fast: Arc<MemoryFastChain>,
}

fn fixture(config: SnailPoolConfig) -> Fixture {
    let snail = Arc::new(MemorySnailChain::new(Vec::new()));
    let fast = Arc::new(MemoryFastChain::new());
    let engine = Sealer::new(SealerConfig {
        pow_mode: PowMode::Fake,
        threads: 1,
    });
    let validator = Arc::new(EngineValidator::new(Arc::clone(&engine), true));
    let (pool, process) = SnailPool::new(
        config,
        Arc::clone(&fast) as Arc<dyn FastChain>,
        Arc::clone(&snail) as Arc<dyn SnailChain>,
        engine as Arc<dyn Engine>,
        validator,
    );
    Fixture {
        pool,
        process,
        snail,
        fast,
    }
}

fn fruit_for(fast: &MemoryFastChain, fast_number: u64) -> Arc<SnailBlock> {
    let target = fast.block_by_number(fast_number).expect("fast block");
    Arc::new(SnailBlock::new_fruit(
        SnailHeader {
            number: 1,
            fast_number,
            fast_hash: target.hash(),
            difficulty: U256::from(1000u64),
            fruit_difficulty: U256::from(1000u64),
            sign_hash: crypto::calc_sign_hash(&[]),
            is_fruit: true,
            ..Default::default()
        },
        Vec::new(),
    ))
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for the pool to settle"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn capacity_cap_holds_at_the_default_8192() {
    let fx = fixture(SnailPoolConfig {
        journal: None,
        ..Default::default()
    });
    fx.fast.advance_to(9000);

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for n in 1..=9000u64 {
        match fx.process.add_fruit(fruit_for(&fx.fast, n)) {
            Ok(()) => accepted += 1,
            Err(Error::ExceedNumber) => rejected += 1,
            Err(err) => panic!("unexpected admission error: {err}"),
        }
    }
    assert_eq!(accepted, 8192);
    assert_eq!(rejected, 808);

    let (pending, unverified) = fx.pool.stats();
    assert_eq!(pending + unverified, 8192);
    // pending is a subset of the known set
    let all = fx.pool.local();
    assert_eq!(all.len(), 8192);
    for fruit in fx.pool.content() {
        assert!(all.iter().any(|f| f.fast_hash() == fruit.fast_hash()));
    }

    // a full pool turns away replacements too: a better fruit for an
    // already-indexed fast hash still answers ExceedNumber
    let held = fruit_for(&fx.fast, 1);
    let mut rival_header = held.header().clone();
    rival_header.difficulty = U256::from(2000u64);
    let rival = Arc::new(SnailBlock::new_fruit(rival_header, Vec::new()));
    assert_eq!(
        fx.process.add_fruit(Arc::clone(&rival)),
        Err(Error::ExceedNumber)
    );
    assert_eq!(fx.pool.local().len(), 8192);
    assert_eq!(
        fx.pool.pending_fruits()[&held.fast_hash()].hash(),
        held.hash()
    );
}

#[tokio::test]
async fn re_adding_the_same_fruit_is_a_no_op() {
    let fx = fixture(SnailPoolConfig {
        journal: None,
        ..Default::default()
    });
    fx.fast.advance_to(2);

    let fruit = fruit_for(&fx.fast, 1);
    fx.process.add_fruit(Arc::clone(&fruit)).unwrap();
    let before: Vec<_> = fx.pool.content().iter().map(|f| f.hash()).collect();

    fx.process.add_fruit(Arc::clone(&fruit)).unwrap();
    let after: Vec<_> = fx.pool.content().iter().map(|f| f.hash()).collect();
    assert_eq!(before, after);
    assert_eq!(fx.pool.stats(), (1, 0));
}

#[tokio::test]
async fn reorg_there_and_back_restores_the_pool() {
    let fx = fixture(SnailPoolConfig {
        journal: None,
        ..Default::default()
    });
    fx.fast.advance_to(4);
    let snail = Arc::clone(&fx.snail);
    let pool = fx.pool.clone();

    let f1 = fruit_for(&fx.fast, 1);
    let f2 = fruit_for(&fx.fast, 2);

    let genesis = snail.current_block();
    let a1 = Arc::new(SnailBlock::new_block(
        SnailHeader {
            parent_hash: genesis.hash(),
            number: 1,
            ..Default::default()
        },
        vec![f1.as_ref().clone(), f2.as_ref().clone()],
        Vec::new(),
    ));
    let b1 = Arc::new(SnailBlock::new_block(
        SnailHeader {
            parent_hash: genesis.hash(),
            number: 1,
            point_number: 1,
            ..Default::default()
        },
        Vec::new(),
        Vec::new(),
    ));

    let loop_handle = tokio::spawn(fx.process.start());

    // pool starts empty; branch A includes both fruits
    snail.extend(Arc::clone(&a1));
    wait_until(|| snail.current_block().hash() == a1.hash()).await;
    assert_eq!(pool.stats(), (0, 0));

    // reorg to branch B drops the block carrying them: reinjected
    snail.insert(Arc::clone(&b1));
    snail.set_head(Arc::clone(&b1));
    wait_until(|| pool.stats() == (2, 0)).await;
    assert!(pool.pending_fruits().contains_key(&f1.fast_hash()));
    assert!(pool.pending_fruits().contains_key(&f2.fast_hash()));

    // reorg back to A: the fruits are included again, pool is restored
    snail.set_head(Arc::clone(&a1));
    wait_until(|| pool.stats() == (0, 0)).await;

    loop_handle.abort();
}

#[tokio::test]
async fn remote_batch_flows_through_the_event_loop() {
    let fx = fixture(SnailPoolConfig {
        journal: None,
        ..Default::default()
    });
    fx.fast.advance_to(3);
    let pool = fx.pool.clone();
    let mut events = pool.subscribe_new_fruit_event();

    let loop_handle = tokio::spawn(fx.process.start());

    let fruits = vec![
        fruit_for(&fx.fast, 1).as_ref().clone(),
        fruit_for(&fx.fast, 2).as_ref().clone(),
    ];
    let errs = pool.add_remote_fruits(fruits).await;
    assert!(errs.iter().all(|e| e.is_none()));

    // both admissions surface on the new-fruit feed
    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a fruit event")
            .expect("fruit feed closed");
    }
    wait_until(|| pool.stats() == (2, 0)).await;

    loop_handle.abort();
}

#[tokio::test]
async fn journal_restores_local_fruits_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let journal_path = dir.path().join("fruits.rlp");
    let config = SnailPoolConfig {
        journal: Some(journal_path.clone()),
        rejournal_secs: 1,
        ..Default::default()
    };

    let fx = fixture(config.clone());
    fx.fast.advance_to(3);
    fx.process.add_fruit(fruit_for(&fx.fast, 1)).unwrap();
    fx.process.add_fruit(fruit_for(&fx.fast, 2)).unwrap();

    // persist by hand the way the loop's journal tick would
    let journal = ratatosk::fruit::SnailJournal::new(&journal_path);
    journal.rotate(&fx.pool.local()).unwrap();

    // a fresh pool over the same chains reloads the journalled fruits
    let restarted = fixture(config);
    restarted.fast.advance_to(3);
    let pool = restarted.pool.clone();
    let loop_handle = tokio::spawn(restarted.process.start());
    wait_until(|| pool.stats() == (2, 0)).await;

    loop_handle.abort();
}

#[tokio::test]
async fn batch_error_slice_aligns_with_input() {
    let fx = fixture(SnailPoolConfig {
        journal: None,
        ..Default::default()
    });
    fx.fast.advance_to(2);
    let good = fruit_for(&fx.fast, 1);
    let mut broken_header = good.header().clone();
    broken_header.sign_hash = H256::repeat_byte(0xaa);
    let broken = SnailBlock::new_fruit(broken_header, Vec::new());

    let errs = fx
        .pool
        .add_remote_fruits(vec![
            broken.clone(),
            good.as_ref().clone(),
            broken,
        ])
        .await;
    assert_eq!(errs.len(), 3);
    assert_eq!(errs[0], Some(Error::InvalidSign));
    assert_eq!(errs[1], None);
    assert_eq!(errs[2], Some(Error::InvalidSign));
}
