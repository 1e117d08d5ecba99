//! Stable key schema for persisted committee state.
//!
//! Keys survive restarts and releases:
//!
//! * `committee/<id>`: RLP of the elected `{members, backups}`.
//! * `committee-states/<id>`: RLP of the ordered fast-block numbers whose
//!   switch infos belong to the committee.

use crate::blockcfg::ElectionCommittee;
use crate::storage::Database;

fn committee_key(id: u64) -> Vec<u8> {
    format!("committee/{}", id).into_bytes()
}

fn committee_states_key(id: u64) -> Vec<u8> {
    format!("committee-states/{}", id).into_bytes()
}

/// Loads the elected committee for `id`, if previously persisted.
pub fn read_committee(db: &dyn Database, id: u64) -> Option<ElectionCommittee> {
    let raw = db.get(&committee_key(id)).ok()??;
    match rlp::decode(&raw) {
        Ok(committee) => Some(committee),
        Err(err) => {
            tracing::warn!(committee = id, %err, "discarding undecodable committee record");
            None
        }
    }
}

/// Persists the elected committee for `id`.
pub fn write_committee(db: &dyn Database, id: u64, committee: &ElectionCommittee) {
    if let Err(err) = db.put(&committee_key(id), &rlp::encode(committee)) {
        tracing::error!(committee = id, %err, "failed to persist committee");
    }
}

/// Loads the switches tail for `id`; empty when never written.
pub fn read_committee_states(db: &dyn Database, id: u64) -> Vec<u64> {
    let raw = match db.get(&committee_states_key(id)) {
        Ok(Some(raw)) => raw,
        _ => return Vec::new(),
    };
    match rlp::Rlp::new(&raw).as_list() {
        Ok(states) => states,
        Err(err) => {
            tracing::warn!(committee = id, %err, "discarding undecodable switches record");
            Vec::new()
        }
    }
}

/// Persists the switches tail for `id`.
pub fn write_committee_states(db: &dyn Database, id: u64, switches: &[u64]) {
    let mut s = rlp::RlpStream::new();
    s.append_list(switches);
    if let Err(err) = db.put(&committee_states_key(id), &s.out()) {
        tracing::error!(committee = id, %err, "failed to persist committee switches");
    }
}
