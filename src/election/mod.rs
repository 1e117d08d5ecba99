/*!

Committee election state machine.

The BFT proposer set of the fast chain is derived from snail-chain state.
Every election period the engine reads a window of snail blocks, collects
the fruits whose miners opted in, and runs a deterministic lottery weighted
by difficulty surplus. Between periods the fast chain can embed switch
infos that incrementally mutate the effective membership.

```text
  ┌────────────┐  snail head == switch_check_number   ┌──────────────┐
  │ running k  │ ───────────────────────────────────▶ │ switchover   │
  │ next=None  │   (elect k+1, emit Over(k) then      │ next=k+1     │
  └────────────┘    Switchover(k+1))                  └──────┬───────┘
         ▲                                                   │
         │ fast head == end_fast_number(k):                  │
         │ emit Stop(k), promote next → current,             │
         │ emit Start(k+1)                                   │
         └───────────────────────────────────────────────────┘
```

Two cooperating event loops drive the machine: one follows snail head
events (period boundary → election), the other follows fast head events
(end-of-committee promotion and switch-info application). `Over` is always
emitted strictly before `Switchover` for the same transition, and `Stop(k)`
strictly before `Start(k+1)`.

*/

mod committee;

pub use committee::{
    first_election_number, last_election_number, switch_check_number, CandidateMember, Committee,
};

use crate::blockcfg::{
    ChainFastEvent, ChainSnailHeadEvent, CommitteeMember, ElectionCommittee, ElectionEvent,
    ElectionOption, MemberFlag, MemberType, PbftSign, SwitchInfo,
};
use crate::chain::{FastChain, SnailChain};
use crate::consensus::Engine;
use crate::crypto;
use crate::event::{Feed, Subscription};
use crate::settings::ElectionConfig;
use crate::storage::rawdb;
use lru::LruCache;
use primitive_types::{H256, U256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

const COMMITTEE_CACHE_LIMIT: usize = 256;

/// PBFT needs 3f+1 members; anything smaller falls back to genesis.
const BFT_QUORUM_FLOOR: usize = 4;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("get committee failed")]
    Committee,
    #[error("invalid committee member")]
    InvalidMember,
    #[error("genesis committee is empty")]
    NoGenesis,
    #[error("failed to resolve the current committee at startup")]
    Startup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectMode {
    Normal,
    /// Fixed committee with generated keys, for tests.
    Fake,
}

/// Typed rendition of a committee lookup by id.
#[derive(Clone, Debug)]
pub struct CommitteeDescription {
    pub id: u64,
    pub begin_snail_number: u64,
    pub end_snail_number: u64,
    pub member_count: usize,
    pub members: Vec<CommitteeMember>,
    pub backups: Vec<CommitteeMember>,
    pub begin_number: u64,
    pub end_number: Option<u64>,
}

#[derive(Default)]
struct State {
    committee: Option<Committee>,
    next_committee: Option<Committee>,
    /// Set while a switchover is pending promotion.
    start_switchover: bool,
}

pub struct Election {
    params: ElectionConfig,
    genesis_committee: Vec<CommitteeMember>,
    default_members: Vec<CommitteeMember>,
    single_node: bool,
    mode: ElectMode,
    cache: Mutex<LruCache<u64, Arc<ElectionCommittee>>>,
    state: Mutex<State>,
    election_feed: Feed<ElectionEvent>,
    fastchain: Arc<dyn FastChain>,
    snailchain: Arc<dyn SnailChain>,
    engine: RwLock<Option<Arc<dyn Engine>>>,
    test_keys: Vec<k256::ecdsa::SigningKey>,
}

impl Election {
    /// Creates the election engine and loads the genesis committee.
    pub fn new(
        fastchain: Arc<dyn FastChain>,
        snailchain: Arc<dyn SnailChain>,
        params: ElectionConfig,
        single_node: bool,
    ) -> Result<Arc<Self>, Error> {
        let params = params.sanitize();
        let mut genesis_committee = snailchain.genesis_committee();
        if genesis_committee.is_empty() {
            tracing::error!("election creation got no genesis committee members");
            return Err(Error::NoGenesis);
        }
        if single_node {
            genesis_committee.truncate(1);
        } else if genesis_committee.len() < BFT_QUORUM_FLOOR {
            tracing::error!(
                count = genesis_committee.len(),
                "election creation got insufficient genesis committee members"
            );
        }

        let default_members = genesis_committee
            .iter()
            .map(|member| CommitteeMember {
                flag: MemberFlag::Unused,
                ..member.clone()
            })
            .collect();

        Ok(Arc::new(Election {
            params,
            genesis_committee,
            default_members,
            single_node,
            mode: ElectMode::Normal,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(COMMITTEE_CACHE_LIMIT).unwrap(),
            )),
            state: Mutex::new(State::default()),
            election_feed: Feed::new(),
            fastchain,
            snailchain,
            engine: RwLock::new(None),
            test_keys: Vec::new(),
        }))
    }

    /// Fake-mode election with a fixed generated committee; the chains
    /// are empty stand-ins and the loops are never started.
    pub fn new_fake(member_count: usize) -> Arc<Self> {
        use crate::chain::memchain::{MemoryFastChain, MemorySnailChain};

        let params = ElectionConfig::default();
        let mut keys = Vec::new();
        let mut members = Vec::new();
        for _ in 0..member_count {
            let key = crypto::generate_key();
            let publickey = crypto::pubkey_bytes(&key);
            let coinbase = crypto::pubkey_to_address(&publickey).unwrap();
            members.push(CommitteeMember {
                coinbase,
                publickey,
                flag: MemberFlag::Used,
                mtype: MemberType::Fixed,
            });
            keys.push(key);
        }

        let committee = Committee {
            id: 0,
            begin_fast_number: 1,
            end_fast_number: None,
            first_election_number: 0,
            last_election_number: 0,
            switch_check_number: params.election_period_number,
            members: members.clone(),
            backup_members: Vec::new(),
            switches: Vec::new(),
        };

        Arc::new(Election {
            params,
            genesis_committee: members.clone(),
            default_members: members,
            single_node: false,
            mode: ElectMode::Fake,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(COMMITTEE_CACHE_LIMIT).unwrap(),
            )),
            state: Mutex::new(State {
                committee: Some(committee),
                next_committee: None,
                start_switchover: false,
            }),
            election_feed: Feed::new(),
            fastchain: Arc::new(MemoryFastChain::new()),
            snailchain: Arc::new(MemorySnailChain::new(Vec::new())),
            engine: RwLock::new(None),
            test_keys: keys,
        })
    }

    /// Injects the consensus engine used for difficulty queries. The
    /// engine is constructed after the election, so it cannot be a
    /// constructor argument.
    pub fn set_engine(&self, engine: Arc<dyn Engine>) {
        *self.engine.write().unwrap() = Some(engine);
    }

    pub fn subscribe(&self) -> Subscription<ElectionEvent> {
        self.election_feed.subscribe()
    }

    pub fn genesis_committee(&self) -> &[CommitteeMember] {
        &self.genesis_committee
    }

    /// Snapshot of the committee currently believed active.
    pub fn current_committee(&self) -> Option<Committee> {
        self.state.lock().unwrap().committee.clone()
    }

    /// Signs `member_count` fake votes for a fast block; fake mode only.
    pub fn generate_fake_signs(
        &self,
        fast_height: u64,
        fast_hash: H256,
    ) -> Result<Vec<PbftSign>, crypto::Error> {
        let mut signs = Vec::with_capacity(self.test_keys.len());
        for key in &self.test_keys {
            let mut sign = PbftSign {
                fast_height,
                fast_hash,
                result: crate::blockcfg::VOTE_AGREE,
                sign: Vec::new(),
            };
            sign.sign = crypto::sign_hash(key, sign.hash_with_no_sign())?;
            signs.push(sign);
        }
        Ok(signs)
    }

    // ---- member lookups -------------------------------------------------

    pub fn member_by_pubkey<'a>(
        members: &'a [CommitteeMember],
        publickey: &[u8],
    ) -> Option<&'a CommitteeMember> {
        members.iter().find(|m| m.publickey == publickey)
    }

    pub fn member_flag(members: &[CommitteeMember], publickey: &[u8]) -> Option<MemberFlag> {
        Self::member_by_pubkey(members, publickey).map(|m| m.flag)
    }

    pub fn is_committee_member(members: &[CommitteeMember], publickey: &[u8]) -> bool {
        Self::member_flag(members, publickey) == Some(MemberFlag::Used)
    }

    /// Resolves the member owning `publickey` in the committee at
    /// `fast_height`.
    pub fn verify_public_key(
        &self,
        fast_height: u64,
        publickey: &[u8],
    ) -> Result<Option<CommitteeMember>, Error> {
        let members = self.get_committee(fast_height).ok_or_else(|| {
            tracing::info!(fast_height, "no committee for public key verification");
            Error::Committee
        })?;
        Ok(Self::member_by_pubkey(&members, publickey).cloned())
    }

    /// Recovers a sign's author and checks committee membership.
    pub fn verify_sign(&self, sign: &PbftSign) -> Result<CommitteeMember, Error> {
        let pubkey = crypto::recover_pubkey(sign.hash_with_no_sign(), &sign.sign)
            .map_err(|_| Error::InvalidMember)?;
        self.verify_public_key(sign.fast_height, &pubkey)?
            .ok_or(Error::InvalidMember)
    }

    /// Batch sign verification; both output slices align with the input.
    /// All signs are expected to carry the same fast height.
    pub fn verify_signs(
        &self,
        signs: &[PbftSign],
    ) -> (Vec<Option<CommitteeMember>>, Vec<Option<Error>>) {
        if signs.is_empty() {
            tracing::warn!("verify signs got an empty batch");
            return (Vec::new(), Vec::new());
        }

        let mut members = vec![None; signs.len()];
        let mut errs = vec![None; signs.len()];

        let committee = match self.get_committee(signs[0].fast_height) {
            Some(committee) if !committee.is_empty() => committee,
            _ => {
                tracing::error!("no committee to verify pbft signs against");
                for err in errs.iter_mut() {
                    *err = Some(Error::Committee);
                }
                return (members, errs);
            }
        };

        for (i, sign) in signs.iter().enumerate() {
            let recovered = crypto::recover_pubkey(sign.hash_with_no_sign(), &sign.sign);
            let member = recovered
                .ok()
                .and_then(|pk| Self::member_by_pubkey(&committee, &pk).cloned());
            match member {
                Some(member) => members[i] = Some(member),
                None => errs[i] = Some(Error::InvalidMember),
            }
        }
        (members, errs)
    }

    // ---- election algorithm ---------------------------------------------

    /// Collects candidates and the lottery seed from the snail window.
    fn get_candidates(&self, begin: u64, end: u64) -> Option<(H256, Vec<CandidateMember>)> {
        let engine = self.engine.read().unwrap().clone();
        let Some(engine) = engine else {
            tracing::warn!("election has no consensus engine installed");
            return None;
        };

        let mut seed = Vec::new();
        let mut fruit_counts: HashMap<primitive_types::H160, u64> = HashMap::new();
        let mut all = Vec::new();

        for number in begin..=end {
            let block = self.snailchain.block_by_number(number)?;
            seed.extend_from_slice(block.hash().as_bytes());

            for fruit in block.fruits() {
                if !fruit.to_elect() {
                    continue;
                }
                let Ok(publickey) = fruit.pubkey() else {
                    continue;
                };
                let Ok(address) = crypto::pubkey_to_address(&publickey) else {
                    continue;
                };
                let (achieved, required) = engine.get_difficulty(fruit.header(), true);
                all.push(CandidateMember {
                    coinbase: fruit.header().coinbase,
                    address,
                    publickey,
                    difficulty: achieved.saturating_sub(required),
                    lower: U256::zero(),
                    upper: U256::zero(),
                });
                *fruit_counts.entry(address).or_insert(0) += 1;
            }
        }

        tracing::debug!(
            fruits = all.len(),
            miners = fruit_counts.len(),
            "collected committee candidates"
        );

        let mut candidates: Vec<CandidateMember> = Vec::new();
        let mut total = U256::zero();
        for member in all {
            let count = fruit_counts.get(&member.address).copied().unwrap_or(0);
            if count >= self.params.election_fruits_threshold {
                total = total.saturating_add(member.difficulty);
                candidates.push(member);
            }
        }
        if candidates.is_empty() {
            tracing::warn!(begin, end, "no election candidates in the window");
            return None;
        }

        // zero surplus across the board still needs a valid range split
        if total.is_zero() {
            total = U256::from(candidates.len());
            for candidate in candidates.iter_mut() {
                candidate.difficulty = U256::one();
            }
        }

        let rate = U256::MAX / total;
        let mut cumulative = U256::zero();
        let last = candidates.len() - 1;
        for (i, candidate) in candidates.iter_mut().enumerate() {
            candidate.lower = rate.saturating_mul(cumulative);
            cumulative = cumulative.saturating_add(candidate.difficulty);
            candidate.upper = if i == last {
                U256::MAX
            } else {
                rate.saturating_mul(cumulative)
            };
        }

        Some((crypto::keccak256(&seed), candidates))
    }

    /// The deterministic lottery: keccak-derived points walk the
    /// candidate ranges; default members and repeats are skipped.
    fn elect(&self, candidates: &[CandidateMember], seed: H256) -> Vec<CommitteeMember> {
        let defaults: std::collections::HashSet<_> = self
            .default_members
            .iter()
            .filter_map(|m| m.address())
            .collect();
        let mut drawn = std::collections::HashSet::new();
        let mut members = Vec::new();

        tracing::debug!(count = candidates.len(), ?seed, "electing committee members");
        let seed_int = U256::from_big_endian(seed.as_bytes());
        for round in 1..=self.params.maximum_committee_number {
            let (point_seed, _) = seed_int.overflowing_add(U256::from(round));
            let hash = crypto::keccak256(&minimal_big_endian(point_seed));
            let point = U256::from_big_endian(hash.as_bytes());

            for candidate in candidates {
                if !candidate.contains(point) {
                    continue;
                }
                if defaults.contains(&candidate.address) || drawn.contains(&candidate.address) {
                    break;
                }
                drawn.insert(candidate.address);
                members.push(CommitteeMember {
                    coinbase: candidate.coinbase,
                    publickey: candidate.publickey.clone(),
                    flag: MemberFlag::Unused,
                    mtype: MemberType::Worked,
                });
                break;
            }
        }

        tracing::debug!(count = members.len(), "lottery drew committee members");
        members
    }

    /// Runs one full election over the snail window, with the genesis
    /// fallback rules applied.
    fn elect_committee(&self, begin: u64, end: u64) -> ElectionCommittee {
        if self.single_node {
            return ElectionCommittee {
                members: self.genesis_committee.clone(),
                backups: Vec::new(),
            };
        }

        tracing::info!(
            begin,
            end,
            threshold = self.params.election_fruits_threshold,
            max = self.params.maximum_committee_number,
            "electing new committee"
        );

        let mut committee = ElectionCommittee::default();
        match self.get_candidates(begin, end) {
            None => {
                tracing::warn!(begin, end, "no candidates, retaining default committee");
            }
            Some((seed, candidates)) => {
                let members = self.elect(&candidates, seed);
                if members.len() > self.params.minimum_committee_number {
                    let split = self.params.minimum_committee_number;
                    committee.backups = members[split..].to_vec();
                    committee.members = members[..split].to_vec();
                } else {
                    committee.members = members;
                }
            }
        }

        for member in committee.members.iter_mut() {
            member.flag = MemberFlag::Used;
            member.mtype = MemberType::Worked;
        }
        for backup in committee.backups.iter_mut() {
            backup.mtype = MemberType::Back;
        }

        if committee.members.len() >= BFT_QUORUM_FLOOR {
            committee.backups.extend(self.default_members.clone());
        } else {
            tracing::warn!(
                count = committee.members.len(),
                begin,
                end,
                "election came up short, using the genesis committee"
            );
            committee.members = self.genesis_committee.clone();
        }
        committee
    }

    /// Election result for the window, via the cache and persistent
    /// storage.
    fn get_election_members(&self, begin: u64, end: u64) -> Arc<ElectionCommittee> {
        let period = self.params.election_period_number;
        let confirmed_end = end + self.params.snail_confirm_interval;
        let committee_id = if confirmed_end < period {
            0
        } else {
            confirmed_end / period
        };

        if let Some(cached) = self.cache.lock().unwrap().get(&committee_id) {
            return Arc::clone(cached);
        }

        let db = self.snailchain.database();
        if let Some(stored) = rawdb::read_committee(db.as_ref(), committee_id) {
            let stored = Arc::new(stored);
            self.cache
                .lock()
                .unwrap()
                .put(committee_id, Arc::clone(&stored));
            return stored;
        }

        let elected = Arc::new(self.elect_committee(begin, end));
        self.cache
            .lock()
            .unwrap()
            .put(committee_id, Arc::clone(&elected));
        rawdb::write_committee(db.as_ref(), committee_id, &elected);
        elected
    }

    /// End fast number implied by an election window: the largest fruit
    /// fast number of the window's last block, plus the switchover tail.
    fn get_last_number(&self, begin: u64, end: u64) -> Option<u64> {
        self.snailchain.block_by_number(begin)?;
        let end_block = self.snailchain.block_by_number(end)?;
        let last_fruit = end_block.max_fruit_fast_number()?;
        Some(last_fruit + self.params.election_switchover_number)
    }

    fn genesis_snapshot(&self, end_fast_number: Option<u64>) -> Committee {
        let db = self.snailchain.database();
        Committee {
            id: 0,
            begin_fast_number: 1,
            end_fast_number,
            first_election_number: 0,
            last_election_number: 0,
            switch_check_number: self.params.election_period_number,
            members: self.genesis_committee.clone(),
            backup_members: Vec::new(),
            switches: rawdb::read_committee_states(db.as_ref(), 0),
        }
    }

    /// Reconstructs the committee owning `fast_number` from period
    /// arithmetic against `snail_number`.
    fn committee_by_period(&self, fast_number: u64, snail_number: u64) -> Option<Committee> {
        let period = self.params.election_period_number;
        let confirm = self.params.snail_confirm_interval;
        let committee_id = snail_number / period;
        let last_snail = committee_id * period;

        tracing::debug!(
            fast_number,
            snail_number,
            committee_id,
            "resolving committee by period"
        );

        if committee_id == 0 {
            return Some(self.genesis_snapshot(None));
        }

        let end_election = last_snail - confirm;
        let begin_election = (end_election + 1).saturating_sub(period).max(1);
        let last_fast = self.get_last_number(begin_election, end_election)?;

        let db = self.snailchain.database();
        if last_fast >= fast_number {
            if committee_id == 1 {
                // still under the long genesis committee
                return Some(self.genesis_snapshot(Some(last_fast)));
            }
            let pre_end = end_election - period;
            let pre_begin = (pre_end + 1).saturating_sub(period).max(1);
            let pre_end_fast = self.get_last_number(pre_begin, pre_end)?;
            let members = self.get_election_members(pre_begin, pre_end);
            return Some(Committee {
                id: committee_id - 1,
                begin_fast_number: pre_end_fast + 1,
                end_fast_number: Some(last_fast),
                first_election_number: pre_begin,
                last_election_number: pre_end,
                switch_check_number: last_snail,
                members: members.members.clone(),
                backup_members: members.backups.clone(),
                switches: rawdb::read_committee_states(db.as_ref(), committee_id - 1),
            });
        }

        let members = self.get_election_members(begin_election, end_election);
        Some(Committee {
            id: committee_id,
            begin_fast_number: last_fast + 1,
            end_fast_number: None,
            first_election_number: begin_election,
            last_election_number: end_election,
            switch_check_number: last_snail + period,
            members: members.members.clone(),
            backup_members: members.backups.clone(),
            switches: rawdb::read_committee_states(db.as_ref(), committee_id),
        })
    }

    /// The committee snapshot that proposes fast block `fast_number`.
    fn elected_committee(&self, fast_number: u64) -> Option<Committee> {
        if self.mode == ElectMode::Fake {
            return self.state.lock().unwrap().committee.clone();
        }

        let (current, next) = {
            let state = self.state.lock().unwrap();
            (state.committee.clone(), state.next_committee.clone())
        };

        if let Some(next) = next {
            if fast_number >= next.begin_fast_number {
                return Some(next);
            }
        }
        if let Some(current) = current {
            if fast_number >= current.begin_fast_number {
                return Some(current);
            }
        }

        let fast_block = match self.fastchain.block_by_number(fast_number) {
            Some(block) => block,
            None => {
                tracing::info!(fast_number, "no fast block to resolve a committee for");
                return None;
            }
        };
        let snail_number = match self.snailchain.fruit_by_fast_hash(fast_block.hash()) {
            Some((block, _)) => block.number(),
            // the fast block is not embedded in the snail chain yet
            None => self.snailchain.current_header().number,
        };
        self.committee_by_period(fast_number, snail_number)
    }

    /// The effective member set for `fast_number`, with every switch info
    /// recorded before that height replayed. Empty result means "unable
    /// to vote" for the BFT layer.
    pub fn get_committee(&self, fast_number: u64) -> Option<Vec<CommitteeMember>> {
        let committee = match self.elected_committee(fast_number) {
            Some(committee) => committee,
            None => {
                tracing::error!(fast_number, "failed to fetch elected committee");
                return None;
            }
        };
        if committee.switches.is_empty() {
            return Some(committee.members());
        }

        let apply_all = fast_number > *committee.switches.last().unwrap();
        let mut states: HashMap<Vec<u8>, MemberFlag> = HashMap::new();
        for &number in &committee.switches {
            if !apply_all && number >= fast_number {
                break;
            }
            let Some(block) = self.fastchain.block_by_number(number) else {
                tracing::warn!(number, "switch block missing from the fast chain");
                continue;
            };
            if let Some(info) = block.switch_info() {
                for val in &info.vals {
                    match val.flag {
                        MemberFlag::Append | MemberFlag::Removed => {
                            states.insert(val.pk.clone(), val.flag);
                        }
                        _ => {}
                    }
                }
            }
        }

        let mut members = Vec::new();
        for member in committee.members() {
            match states.get(&member.publickey) {
                Some(MemberFlag::Removed) => {}
                _ => members.push(member),
            }
        }
        for backup in committee.backup_members() {
            if states.get(&backup.publickey) == Some(&MemberFlag::Append) {
                members.push(backup);
            }
        }
        Some(members)
    }

    /// Members and backups with every recorded switch applied to their
    /// flags; removed members stay listed, flagged `Removed`.
    fn filter_with_switch_info(
        &self,
        committee: &Committee,
    ) -> (Vec<CommitteeMember>, Vec<CommitteeMember>) {
        let mut members = committee.members();
        let mut backups = committee.backup_members();
        if committee.switches.is_empty() {
            return (members, backups);
        }

        let mut states: HashMap<Vec<u8>, MemberFlag> = HashMap::new();
        for &number in &committee.switches {
            let Some(block) = self.fastchain.block_by_number(number) else {
                continue;
            };
            if let Some(info) = block.switch_info() {
                for val in &info.vals {
                    match val.flag {
                        MemberFlag::Append | MemberFlag::Removed => {
                            states.insert(val.pk.clone(), val.flag);
                        }
                        _ => {}
                    }
                }
            }
        }
        for (pk, flag) in &states {
            tracing::info!(
                committee = committee.id,
                bftkey = %hex::encode(pk),
                state = ?flag,
                "committee switch info transition"
            );
        }

        for member in members.iter_mut() {
            if states.get(&member.publickey) == Some(&MemberFlag::Removed) {
                member.flag = MemberFlag::Removed;
            }
        }
        for backup in backups.iter_mut() {
            match states.get(&backup.publickey) {
                Some(MemberFlag::Append) => backup.flag = MemberFlag::Used,
                Some(MemberFlag::Removed) => backup.flag = MemberFlag::Removed,
                _ => {}
            }
        }
        (members, backups)
    }

    /// Applies a switch info carried by fast block `fast_number` to its
    /// committee and publishes `CommitteeUpdate`.
    fn update_members(&self, fast_number: u64, infos: &SwitchInfo) {
        if infos.vals.is_empty() {
            return;
        }
        tracing::info!(
            committee = infos.cid,
            block = fast_number,
            "updating committee member state"
        );

        let (snapshot, end_fast) = {
            let mut state = self.state.lock().unwrap();
            let target = if state.committee.as_ref().map(|c| c.id) == Some(infos.cid) {
                state.committee.as_mut()
            } else if state.next_committee.as_ref().map(|c| c.id) == Some(infos.cid) {
                state.next_committee.as_mut()
            } else {
                None
            };
            let Some(target) = target else {
                tracing::warn!(
                    committee = infos.cid,
                    "switch info is neither for the current nor the next committee"
                );
                return;
            };
            target.switches.push(fast_number);
            let db = self.snailchain.database();
            rawdb::write_committee_states(db.as_ref(), infos.cid, &target.switches);
            (target.clone(), target.end_fast_number)
        };

        let (members, backups) = self.filter_with_switch_info(&snapshot);
        self.election_feed.send(ElectionEvent {
            option: ElectionOption::Update,
            committee_id: snapshot.id,
            begin_fast_number: fast_number,
            end_fast_number: end_fast,
            members,
            backups,
        });
    }

    /// Typed description of the committee with the given id; `None` for
    /// ids beyond the current committee.
    pub fn committee_by_id(&self, id: u64) -> Option<CommitteeDescription> {
        let current = self.current_committee()?;
        if current.id < id {
            return None;
        }

        let period = self.params.election_period_number;
        let confirm = self.params.snail_confirm_interval;

        if id == 0 {
            let end_number = if current.id == 0 {
                current.end_fast_number
            } else {
                self.get_last_number(1, period - confirm)
            };
            return Some(CommitteeDescription {
                id: 0,
                begin_snail_number: 0,
                end_snail_number: 0,
                member_count: self.genesis_committee.len(),
                members: self.genesis_committee.clone(),
                backups: Vec::new(),
                begin_number: 1,
                end_number,
            });
        }

        let end_election = id * period - confirm;
        let begin_election = (end_election + 1).saturating_sub(period).max(1);
        let elected = self.get_election_members(begin_election, end_election);
        let begin_number = self.get_last_number(begin_election, end_election)? + 1;
        let end_number = if current.id == id {
            current.end_fast_number
        } else {
            self.get_last_number(begin_election + period, end_election + period)
        };

        Some(CommitteeDescription {
            id,
            begin_snail_number: begin_election,
            end_snail_number: end_election,
            member_count: elected.members.len() + elected.backups.len(),
            members: elected.members.clone(),
            backups: elected.backups.clone(),
            begin_number,
            end_number,
        })
    }

    // ---- state machine --------------------------------------------------

    /// Resolves the current committee from the chain heads, publishes the
    /// startup events and spawns the two event loops.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        let fast_head = self.fastchain.current_block().number();
        let snail_head = self.snailchain.current_header().number;

        let mut current = self
            .committee_by_period(fast_head, snail_head)
            .ok_or(Error::Startup)?;

        // fast-chain rollback safety: drop switches past the current head
        if let Some(pos) = current.switches.iter().position(|&n| n > fast_head) {
            tracing::info!(
                committee = current.id,
                fast_head,
                "rewinding committee switch infos"
            );
            current.switches.truncate(pos);
            let db = self.snailchain.database();
            rawdb::write_committee_states(db.as_ref(), current.id, &current.switches);
        }

        let mut next_committee = None;
        let mut start_switchover = false;

        if let Some(end_fast) = current.end_fast_number.filter(|&e| e > 0) {
            // past the switch check, the next committee is already due
            let elect_end =
                current.last_election_number + self.params.election_period_number;
            let elect_begin = (elect_end + 1)
                .saturating_sub(self.params.election_period_number)
                .max(1);
            let members = self.get_election_members(elect_begin, elect_end);

            let db = self.snailchain.database();
            let mut next = Committee {
                id: current.id + 1,
                begin_fast_number: end_fast + 1,
                end_fast_number: None,
                first_election_number: elect_begin,
                last_election_number: elect_end,
                switch_check_number: current.switch_check_number
                    + self.params.election_period_number,
                members: members.members.clone(),
                backup_members: members.backups.clone(),
                switches: rawdb::read_committee_states(db.as_ref(), current.id + 1),
            };
            if !next.switches.is_empty() {
                tracing::info!(
                    committee = next.id,
                    "resetting next committee switch infos after rollback"
                );
                rawdb::write_committee_states(db.as_ref(), next.id, &[]);
                next.switches.clear();
            }
            start_switchover = true;

            if end_fast == fast_head {
                // the retiring committee already finished its span
                current = next;
                start_switchover = false;
            } else {
                next_committee = Some(next);
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            state.committee = Some(current.clone());
            state.next_committee = next_committee.clone();
            state.start_switchover = start_switchover;
        }

        log_committee(&current);
        let (members, backups) = self.filter_with_switch_info(&current);
        self.election_feed.send(ElectionEvent {
            option: ElectionOption::Switchover,
            committee_id: current.id,
            begin_fast_number: current.begin_fast_number,
            end_fast_number: None,
            members: members.clone(),
            backups: backups.clone(),
        });
        self.election_feed.send(ElectionEvent {
            option: ElectionOption::Start,
            committee_id: current.id,
            begin_fast_number: current.begin_fast_number,
            end_fast_number: None,
            members,
            backups,
        });

        if let Some(next) = &next_committee {
            log_committee(next);
            self.election_feed.send(ElectionEvent {
                option: ElectionOption::Over,
                committee_id: current.id,
                begin_fast_number: current.begin_fast_number,
                end_fast_number: current.end_fast_number,
                members: current.members(),
                backups: current.backup_members(),
            });
            self.election_feed.send(ElectionEvent {
                option: ElectionOption::Switchover,
                committee_id: next.id,
                begin_fast_number: next.begin_fast_number,
                end_fast_number: None,
                members: next.members(),
                backups: next.backup_members(),
            });
        }

        let snail_sub = self.snailchain.subscribe_chain_head_event();
        let fast_sub = self.fastchain.subscribe_chain_event();
        tokio::spawn(Arc::clone(self).snail_loop(snail_sub));
        tokio::spawn(Arc::clone(self).fast_loop(fast_sub));
        Ok(())
    }

    /// Period-boundary loop: elects the next committee when the snail
    /// head reaches the current committee's switch check height.
    async fn snail_loop(self: Arc<Self>, mut sub: Subscription<ChainSnailHeadEvent>) {
        while let Some(event) = sub.recv().await {
            let number = event.block.number();
            let at_switch_check = {
                let state = self.state.lock().unwrap();
                state
                    .committee
                    .as_ref()
                    .map(|c| c.switch_check_number == number)
                    .unwrap_or(false)
            };
            if at_switch_check {
                self.on_switch_check(number);
            }
        }
    }

    fn on_switch_check(&self, snail_number: u64) {
        let period = self.params.election_period_number;
        let snail_end = snail_number - self.params.snail_confirm_interval;
        let snail_start = if snail_end < period {
            1
        } else {
            snail_end - period + 1
        };

        let Some(last_fast) = self.get_last_number(snail_start, snail_end) else {
            tracing::warn!(snail_number, "cannot fix the committee end fast number yet");
            return;
        };

        let current = {
            let mut state = self.state.lock().unwrap();
            let Some(committee) = state.committee.as_mut() else {
                return;
            };
            committee.end_fast_number = Some(last_fast);
            committee.clone()
        };

        self.election_feed.send(ElectionEvent {
            option: ElectionOption::Over,
            committee_id: current.id,
            begin_fast_number: current.begin_fast_number,
            end_fast_number: Some(last_fast),
            members: current.members(),
            backups: Vec::new(),
        });

        let members = self.get_election_members(snail_start, snail_end);
        tracing::info!(
            snail = snail_number,
            end_fast = last_fast,
            members = members.members.len(),
            "committee election at period boundary"
        );

        let next = Committee {
            id: current.switch_check_number / period,
            begin_fast_number: last_fast + 1,
            end_fast_number: None,
            first_election_number: snail_start,
            last_election_number: snail_end,
            switch_check_number: current.switch_check_number + period,
            members: members.members.clone(),
            backup_members: members.backups.clone(),
            switches: Vec::new(),
        };

        {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = &state.next_committee {
                if existing.id == next.id {
                    // elected this committee already
                    return;
                }
            }
            state.next_committee = Some(next.clone());
            state.start_switchover = true;
        }

        tracing::info!(
            id = next.id,
            begin = next.begin_fast_number,
            "switchover to the newly elected committee"
        );
        log_committee(&next);
        self.election_feed.send(ElectionEvent {
            option: ElectionOption::Switchover,
            committee_id: next.id,
            begin_fast_number: next.begin_fast_number,
            end_fast_number: None,
            members: next.members(),
            backups: next.backup_members(),
        });
    }

    /// Fast-head loop: applies switch infos and promotes the next
    /// committee when the current one reaches its end fast number.
    async fn fast_loop(self: Arc<Self>, mut sub: Subscription<ChainFastEvent>) {
        while let Some(event) = sub.recv().await {
            let block = event.block;
            if let Some(info) = block.switch_info() {
                if !info.vals.is_empty() {
                    tracing::info!(committee = info.cid, "received committee switch info");
                    self.update_members(block.number(), info);
                }
            }

            let promoted = {
                let mut state = self.state.lock().unwrap();
                let due = state.start_switchover
                    && state
                        .committee
                        .as_ref()
                        .and_then(|c| c.end_fast_number)
                        .map(|end| end == block.number())
                        .unwrap_or(false);
                if due {
                    let old = state.committee.take();
                    let new = state.next_committee.take();
                    state.committee = new.clone();
                    state.start_switchover = false;
                    old.zip(new)
                } else {
                    None
                }
            };

            if let Some((old, new)) = promoted {
                tracing::info!(id = old.id, "committee retired");
                self.election_feed.send(ElectionEvent {
                    option: ElectionOption::Stop,
                    committee_id: old.id,
                    begin_fast_number: old.begin_fast_number,
                    end_fast_number: old.end_fast_number,
                    members: old.members(),
                    backups: old.backup_members(),
                });
                tracing::info!(id = new.id, "committee started");
                self.election_feed.send(ElectionEvent {
                    option: ElectionOption::Start,
                    committee_id: new.id,
                    begin_fast_number: new.begin_fast_number,
                    end_fast_number: None,
                    members: new.members(),
                    backups: new.backup_members(),
                });
            }
        }
    }
}

/// Big-endian bytes with leading zeros stripped; the hashing input format
/// for lottery points.
fn minimal_big_endian(value: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    let start = buf.iter().position(|&b| b != 0).unwrap_or(32);
    buf[start..].to_vec()
}

fn log_committee(committee: &Committee) {
    tracing::info!(
        id = committee.id,
        count = committee.members.len(),
        begin = committee.begin_fast_number,
        "committee info"
    );
    for member in &committee.members {
        tracing::info!(
            pkey = %hex::encode(&member.publickey),
            coinbase = ?member.coinbase,
            "committee member"
        );
    }
    for member in &committee.backup_members {
        tracing::info!(
            pkey = %hex::encode(&member.publickey),
            coinbase = ?member.coinbase,
            "committee backup member"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_big_endian_strips_leading_zeros() {
        assert!(minimal_big_endian(U256::zero()).is_empty());
        assert_eq!(minimal_big_endian(U256::from(0x01u64)), vec![0x01]);
        assert_eq!(
            minimal_big_endian(U256::from(0x0102u64)),
            vec![0x01, 0x02]
        );
    }

    #[test]
    fn fake_election_has_a_fixed_committee() {
        let election = Election::new_fake(4);
        let committee = election.current_committee().unwrap();
        assert_eq!(committee.members.len(), 4);
        assert_eq!(committee.id, 0);
        // fake mode resolves every height to the fixed committee
        assert_eq!(election.get_committee(1_000_000).unwrap().len(), 4);
    }

    #[test]
    fn fake_signs_verify_against_the_fake_committee() {
        let election = Election::new_fake(4);
        let signs = election
            .generate_fake_signs(7, H256::repeat_byte(1))
            .unwrap();
        let (members, errs) = election.verify_signs(&signs);
        assert_eq!(members.len(), 4);
        assert!(members.iter().all(|m| m.is_some()));
        assert!(errs.iter().all(|e| e.is_none()));
    }

    #[test]
    fn tampered_sign_is_flagged_invalid() {
        let election = Election::new_fake(4);
        let mut signs = election
            .generate_fake_signs(7, H256::repeat_byte(1))
            .unwrap();
        signs[2].sign[10] ^= 0xff;
        let (members, errs) = election.verify_signs(&signs);
        assert!(members[0].is_some());
        assert!(members[2].is_none());
        assert_eq!(errs[2], Some(Error::InvalidMember));
    }
}
