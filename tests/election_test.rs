//! End-to-end committee lifecycle scenarios driven through the chain
//! event feeds.

use primitive_types::U256;
use ratatosk::blockcfg::{
    CommitteeMember, ElectionEvent, ElectionOption, MemberFlag, MemberType, SnailBlock,
    SnailHeader, SwitchEnter, SwitchInfo,
};
use ratatosk::chain::memchain::{MemoryFastChain, MemorySnailChain};
use ratatosk::chain::{FastChain, SnailChain};
use ratatosk::consensus::{self, Engine};
use ratatosk::crypto;
use ratatosk::election::Election;
use ratatosk::event::Subscription;
use ratatosk::settings::ElectionConfig;
use ratatosk::storage::rawdb;
use std::sync::Arc;
use std::time::Duration;

/// Difficulty oracle with a fixed surplus equal to the required
/// difficulty; keeps election weights deterministic.
struct SurplusEngine;

impl Engine for SurplusEngine {
    fn get_difficulty(&self, header: &SnailHeader, is_fruit: bool) -> (U256, U256) {
        let required = if is_fruit {
            header.fruit_difficulty
        } else {
            header.difficulty
        };
        (required.saturating_mul(U256::from(2)), required)
    }

    fn verify_freshness(
        &self,
        _chain: &dyn SnailChain,
        _header: &SnailHeader,
    ) -> Result<(), consensus::Error> {
        Ok(())
    }

    fn verify_snail_header(
        &self,
        _chain: &dyn SnailChain,
        _header: &SnailHeader,
    ) -> Result<(), consensus::Error> {
        Ok(())
    }
}

fn test_config() -> ElectionConfig {
    ElectionConfig {
        election_period_number: 100,
        snail_confirm_interval: 10,
        election_switchover_number: 50,
        minimum_committee_number: 4,
        maximum_committee_number: 23,
        election_fruits_threshold: 10,
    }
}

fn fixed_key(tag: u8) -> k256::ecdsa::SigningKey {
    // deterministic key material so the lottery outcome is stable
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    bytes[31] = 0x5a;
    k256::ecdsa::SigningKey::from_bytes(&bytes.into()).unwrap()
}

fn member_for(key: &k256::ecdsa::SigningKey) -> CommitteeMember {
    let publickey = crypto::pubkey_bytes(key);
    CommitteeMember {
        coinbase: crypto::pubkey_to_address(&publickey).unwrap(),
        publickey,
        flag: MemberFlag::Used,
        mtype: MemberType::Fixed,
    }
}

struct Fixture {
    election: Arc<Election>,
    snail: Arc<MemorySnailChain>,
    fast: Arc<MemoryFastChain>,
    genesis: Vec<CommitteeMember>,
}

/// Fast chain up to 139; snail chain up to 95 where blocks 1..=90 carry
/// one election fruit each, cycling through six candidate miners. The
/// window's last fruit shadows fast block 90, so committee 1 begins at
/// fast 141 (90 + switchover 50 + 1).
fn build_fixture(single_node: bool) -> Fixture {
    let genesis_keys: Vec<_> = (1u8..=4).map(fixed_key).collect();
    let genesis: Vec<_> = genesis_keys.iter().map(member_for).collect();
    let candidate_keys: Vec<_> = (10u8..16).map(fixed_key).collect();

    let fast = Arc::new(MemoryFastChain::new());
    fast.advance_to(139);

    let snail = Arc::new(MemorySnailChain::new(genesis.clone()));
    let mut parent = snail.current_block();
    for number in 1..=95u64 {
        let fruits = if number <= 90 {
            let key = &candidate_keys[(number as usize) % candidate_keys.len()];
            let publickey = crypto::pubkey_bytes(key);
            let coinbase = crypto::pubkey_to_address(&publickey).unwrap();
            let header = SnailHeader {
                number,
                fast_number: number,
                fast_hash: fast.block_by_number(number).unwrap().hash(),
                fruit_difficulty: U256::from(1000u64),
                difficulty: U256::from(1000u64),
                sign_hash: crypto::calc_sign_hash(&[]),
                is_fruit: true,
                to_elect: true,
                coinbase,
                publickey,
                ..Default::default()
            };
            vec![SnailBlock::new_fruit(header, Vec::new())]
        } else {
            Vec::new()
        };
        let block = Arc::new(SnailBlock::new_block(
            SnailHeader {
                parent_hash: parent.hash(),
                number,
                ..Default::default()
            },
            fruits,
            Vec::new(),
        ));
        snail.extend(Arc::clone(&block));
        parent = block;
    }

    let election = Election::new(
        Arc::clone(&fast) as Arc<dyn FastChain>,
        Arc::clone(&snail) as Arc<dyn SnailChain>,
        test_config(),
        single_node,
    )
    .unwrap();
    election.set_engine(Arc::new(SurplusEngine));

    Fixture {
        election,
        snail,
        fast,
        genesis,
    }
}

fn extend_snail(snail: &MemorySnailChain, upto: u64) {
    let mut parent = snail.current_block();
    for number in (parent.number() + 1)..=upto {
        let block = Arc::new(SnailBlock::new_block(
            SnailHeader {
                parent_hash: parent.hash(),
                number,
                ..Default::default()
            },
            Vec::new(),
            Vec::new(),
        ));
        snail.extend(Arc::clone(&block));
        parent = block;
    }
}

async fn next_event(sub: &mut Subscription<ElectionEvent>) -> ElectionEvent {
    tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for an election event")
        .expect("election feed closed")
}

#[tokio::test]
async fn period_boundary_elects_and_promotes_the_next_committee() {
    let fx = build_fixture(false);
    let mut sub = fx.election.subscribe();
    fx.election.start().unwrap();

    // startup under the genesis committee
    let ev = next_event(&mut sub).await;
    assert_eq!(ev.option, ElectionOption::Switchover);
    assert_eq!(ev.committee_id, 0);
    let ev = next_event(&mut sub).await;
    assert_eq!(ev.option, ElectionOption::Start);
    assert_eq!(ev.committee_id, 0);
    assert_eq!(ev.begin_fast_number, 1);

    // the switch-check snail block triggers the election
    extend_snail(&fx.snail, 100);

    let over = next_event(&mut sub).await;
    assert_eq!(over.option, ElectionOption::Over);
    assert_eq!(over.committee_id, 0);
    assert_eq!(over.end_fast_number, Some(140));

    let switchover = next_event(&mut sub).await;
    assert_eq!(switchover.option, ElectionOption::Switchover);
    assert_eq!(switchover.committee_id, 1);
    assert_eq!(switchover.begin_fast_number, 141);

    // the members/backups split and the genesis fallback rules
    assert!(!switchover.members.is_empty());
    assert!(switchover.members.len() <= 4);
    if switchover.members.len() == 4 {
        assert!(switchover
            .members
            .iter()
            .all(|m| m.flag == MemberFlag::Used && m.mtype == MemberType::Worked));
        // genesis (default) members are appended to the backups
        let tail = &switchover.backups[switchover.backups.len() - fx.genesis.len()..];
        for (appended, genesis) in tail.iter().zip(&fx.genesis) {
            assert_eq!(appended.publickey, genesis.publickey);
        }
        for elected_backup in &switchover.backups[..switchover.backups.len() - fx.genesis.len()]
        {
            assert_eq!(elected_backup.mtype, MemberType::Back);
        }
    } else {
        // too few drawn: the genesis committee takes over
        let genesis_keys: Vec<_> = fx.genesis.iter().map(|m| &m.publickey).collect();
        assert!(switchover
            .members
            .iter()
            .all(|m| genesis_keys.contains(&&m.publickey)));
    }

    // S2: advancing the fast head to the end fast number stops committee
    // 0 and starts committee 1, in that order, on one subscriber
    assert_eq!(fx.fast.current_block().number(), 139);
    fx.fast.extend(None);

    let stop = next_event(&mut sub).await;
    assert_eq!(stop.option, ElectionOption::Stop);
    assert_eq!(stop.committee_id, 0);
    assert_eq!(stop.end_fast_number, Some(140));

    let start = next_event(&mut sub).await;
    assert_eq!(start.option, ElectionOption::Start);
    assert_eq!(start.committee_id, 1);
    assert_eq!(start.begin_fast_number, 141);

    // period boundary property: the end fast number still belongs to the
    // old committee, the next height to the new one
    let at_end = fx.election.get_committee(140).unwrap();
    let genesis_keys: Vec<_> = fx.genesis.iter().map(|m| m.publickey.clone()).collect();
    assert!(at_end.iter().all(|m| genesis_keys.contains(&m.publickey)));

    let after_end = fx.election.get_committee(141).unwrap();
    assert_eq!(
        after_end.iter().map(|m| &m.publickey).collect::<Vec<_>>(),
        switchover.members.iter().map(|m| &m.publickey).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn switch_info_removal_takes_effect_and_is_persisted() {
    let fx = build_fixture(false);
    let mut sub = fx.election.subscribe();
    fx.election.start().unwrap();

    // drain startup, elect committee 1 and promote it
    for _ in 0..2 {
        next_event(&mut sub).await;
    }
    extend_snail(&fx.snail, 100);
    let switchover = loop {
        let ev = next_event(&mut sub).await;
        if ev.option == ElectionOption::Switchover && ev.committee_id == 1 {
            break ev;
        }
    };
    fx.fast.extend(None); // 140: Stop(0) + Start(1)
    loop {
        let ev = next_event(&mut sub).await;
        if ev.option == ElectionOption::Start && ev.committee_id == 1 {
            break;
        }
    }

    // S3: a switch info removing one active member of committee 1
    let removed = switchover.members[0].clone();
    fx.fast.extend(Some(SwitchInfo {
        cid: 1,
        vals: vec![SwitchEnter {
            pk: removed.publickey.clone(),
            flag: MemberFlag::Removed,
        }],
    }));

    let update = next_event(&mut sub).await;
    assert_eq!(update.option, ElectionOption::Update);
    assert_eq!(update.committee_id, 1);
    assert_eq!(update.begin_fast_number, 141);

    // the update event materialises the switch: the member is still
    // listed, flagged removed
    let flagged = update
        .members
        .iter()
        .find(|m| m.publickey == removed.publickey)
        .unwrap();
    assert_eq!(flagged.flag, MemberFlag::Removed);

    // a fresh committee query past the switch block excludes the member
    let effective = fx.election.get_committee(142).unwrap();
    assert!(effective.iter().all(|m| m.publickey != removed.publickey));
    assert_eq!(effective.len(), update.members.len() - 1);

    // invariant: the event's materialised state matches the replay
    let from_event: Vec<_> = update
        .members
        .iter()
        .filter(|m| m.flag != MemberFlag::Removed)
        .map(|m| m.publickey.clone())
        .chain(
            update
                .backups
                .iter()
                .filter(|m| m.flag == MemberFlag::Used)
                .map(|m| m.publickey.clone()),
        )
        .collect();
    let from_replay: Vec<_> = effective.iter().map(|m| m.publickey.clone()).collect();
    assert_eq!(from_event, from_replay);

    // the switches tail is persisted under the committee id
    let db = fx.snail.database();
    assert_eq!(rawdb::read_committee_states(db.as_ref(), 1), vec![141]);

    // a switch info for an unknown committee is rejected without a trace
    fx.fast.extend(Some(SwitchInfo {
        cid: 9,
        vals: vec![SwitchEnter {
            pk: removed.publickey.clone(),
            flag: MemberFlag::Append,
        }],
    }));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rawdb::read_committee_states(db.as_ref(), 9).is_empty());
}

#[tokio::test]
async fn elections_over_identical_windows_are_bit_identical() {
    let run = |fx: Fixture| async move {
        let mut sub = fx.election.subscribe();
        fx.election.start().unwrap();
        for _ in 0..2 {
            next_event(&mut sub).await;
        }
        extend_snail(&fx.snail, 100);
        loop {
            let ev = next_event(&mut sub).await;
            if ev.option == ElectionOption::Switchover && ev.committee_id == 1 {
                return ev;
            }
        }
    };

    let first = run(build_fixture(false)).await;
    let second = run(build_fixture(false)).await;
    assert_eq!(first.members, second.members);
    assert_eq!(first.backups, second.backups);
}

#[tokio::test]
async fn single_node_mode_keeps_a_one_member_committee() {
    let fx = build_fixture(true);
    let mut sub = fx.election.subscribe();
    fx.election.start().unwrap();

    let startup = next_event(&mut sub).await;
    assert_eq!(startup.members.len(), 1);

    for _ in 0..1 {
        next_event(&mut sub).await;
    }
    extend_snail(&fx.snail, 100);
    let switchover = loop {
        let ev = next_event(&mut sub).await;
        if ev.option == ElectionOption::Switchover && ev.committee_id == 1 {
            break ev;
        }
    };
    // never elects: the one genesis member carries over
    assert_eq!(switchover.members.len(), 1);
    assert_eq!(switchover.members[0].publickey, fx.genesis[0].publickey);
}

#[tokio::test]
async fn committee_is_persisted_and_reloaded_across_engines() {
    let fx = build_fixture(false);
    let mut sub = fx.election.subscribe();
    fx.election.start().unwrap();
    for _ in 0..2 {
        next_event(&mut sub).await;
    }
    extend_snail(&fx.snail, 100);
    let switchover = loop {
        let ev = next_event(&mut sub).await;
        if ev.option == ElectionOption::Switchover && ev.committee_id == 1 {
            break ev;
        }
    };
    fx.fast.extend(None); // reach the end fast number, promoting committee 1
    loop {
        let ev = next_event(&mut sub).await;
        if ev.option == ElectionOption::Start && ev.committee_id == 1 {
            break;
        }
    }

    // the election wrote committee 1 through to storage
    let db = fx.snail.database();
    let stored = rawdb::read_committee(db.as_ref(), 1).unwrap();
    assert_eq!(stored.members, switchover.members);

    // a second engine over the same chains resolves it from storage
    let other = Election::new(
        Arc::clone(&fx.fast) as Arc<dyn FastChain>,
        Arc::clone(&fx.snail) as Arc<dyn SnailChain>,
        test_config(),
        false,
    )
    .unwrap();
    other.set_engine(Arc::new(SurplusEngine));
    other.start().unwrap();
    let described = other.committee_by_id(1).unwrap();
    assert_eq!(described.members, switchover.members);
    assert_eq!(described.begin_number, 141);
}
