//! Pure committee model: lifecycle snapshots, candidate ranges and the
//! election-window arithmetic.

use crate::blockcfg::{CommitteeMember, MemberFlag};
use crate::settings::ElectionConfig;
use primitive_types::{H160, U256};

/// Snapshot of one committee's lifecycle state.
///
/// Created at startup from a chain scan or when the snail chain reaches
/// `switch_check_number`; mutated only by appending to `switches`;
/// `end_fast_number` is assigned once, when the next committee's begin
/// becomes known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Committee {
    pub id: u64,
    /// First fast block proposed by this committee.
    pub begin_fast_number: u64,
    /// Last fast block proposed by this committee, once known.
    pub end_fast_number: Option<u64>,
    /// First snail block of the election window.
    pub first_election_number: u64,
    /// Last snail block of the election window.
    pub last_election_number: u64,
    /// Snail height at which the next committee must be elected.
    pub switch_check_number: u64,
    pub members: Vec<CommitteeMember>,
    pub backup_members: Vec<CommitteeMember>,
    /// Fast-block numbers whose switch infos belong to this committee,
    /// in application order.
    pub switches: Vec<u64>,
}

impl Committee {
    /// Copy of the member list.
    pub fn members(&self) -> Vec<CommitteeMember> {
        self.members.clone()
    }

    /// Copy of the backup list.
    pub fn backup_members(&self) -> Vec<CommitteeMember> {
        self.backup_members.clone()
    }

    pub fn set_member_state(&mut self, pubkey: &[u8], flag: MemberFlag) {
        if let Some(member) = self.members.iter_mut().find(|m| m.publickey == pubkey) {
            member.flag = flag;
        }
        if let Some(member) = self
            .backup_members
            .iter_mut()
            .find(|m| m.publickey == pubkey)
        {
            member.flag = flag;
        }
    }
}

/// A miner competing for a committee seat, with its lottery range over
/// the 256-bit space.
#[derive(Clone, Debug)]
pub struct CandidateMember {
    pub coinbase: H160,
    pub address: H160,
    pub publickey: Vec<u8>,
    /// Difficulty surplus: achieved minus required.
    pub difficulty: U256,
    pub lower: U256,
    pub upper: U256,
}

impl CandidateMember {
    /// Whether the lottery point falls inside `[lower, upper)`. The last
    /// candidate's upper bound is `U256::MAX` and absorbs the whole tail.
    pub fn contains(&self, point: U256) -> bool {
        point >= self.lower && (self.upper == U256::MAX || point < self.upper)
    }
}

/// Last snail block of committee `id`'s election window.
pub fn last_election_number(id: u64, params: &ElectionConfig) -> u64 {
    id * params.election_period_number - params.snail_confirm_interval
}

/// First snail block of committee `id`'s election window.
pub fn first_election_number(id: u64, params: &ElectionConfig) -> u64 {
    (last_election_number(id, params) + 1)
        .saturating_sub(params.election_period_number)
        .max(1)
}

/// Snail height at which committee `id + 1` must be elected.
pub fn switch_check_number(id: u64, params: &ElectionConfig) -> u64 {
    id * params.election_period_number
}
