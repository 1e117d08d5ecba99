//! Core chain data types shared by every other module.
//!
//! The node tracks two coupled chains: the proof-of-work "snail" chain,
//! whose blocks carry an ordered list of lighter "fruit" units, and the
//! BFT-finalised "fast" chain proposed by the elected committee. A fruit
//! and a full snail block share one header layout; `is_fruit` tells them
//! apart and a fruit shadows exactly one fast block through
//! `(fast_hash, fast_number)`.

use crate::crypto;
use primitive_types::{H160, H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Membership state of a committee member. The raw values are part of the
/// persisted committee encoding and must stay stable across releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemberFlag {
    /// Elected but not yet active.
    Unused = 0xa0,
    /// Actively proposing and voting.
    Used = 0xa1,
    /// Backup promoted into the active set by a switch info.
    Append = 0xa2,
    /// Removed from the effective set by a switch info.
    Removed = 0xa3,
}

/// How a member entered the committee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MemberType {
    /// Genesis (default) member.
    Fixed = 0xa4,
    /// Won a lottery seat.
    Worked = 0xa5,
    /// Elected as backup.
    Back = 0xa6,
}

impl MemberFlag {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0xa0 => Some(MemberFlag::Unused),
            0xa1 => Some(MemberFlag::Used),
            0xa2 => Some(MemberFlag::Append),
            0xa3 => Some(MemberFlag::Removed),
            _ => None,
        }
    }
}

impl MemberType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0xa4 => Some(MemberType::Fixed),
            0xa5 => Some(MemberType::Worked),
            0xa6 => Some(MemberType::Back),
            _ => None,
        }
    }
}

/// One member of a BFT committee.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitteeMember {
    pub coinbase: H160,
    /// Uncompressed SEC1 public key.
    pub publickey: Vec<u8>,
    pub flag: MemberFlag,
    pub mtype: MemberType,
}

impl CommitteeMember {
    pub fn address(&self) -> Option<H160> {
        crypto::pubkey_to_address(&self.publickey).ok()
    }
}

impl Encodable for CommitteeMember {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.coinbase);
        s.append(&self.publickey);
        s.append(&(self.flag as u8));
        s.append(&(self.mtype as u8));
    }
}

impl Decodable for CommitteeMember {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(CommitteeMember {
            coinbase: rlp.val_at(0)?,
            publickey: rlp.val_at(1)?,
            flag: MemberFlag::from_u8(rlp.val_at::<u8>(2)?)
                .ok_or(DecoderError::Custom("unknown member flag"))?,
            mtype: MemberType::from_u8(rlp.val_at::<u8>(3)?)
                .ok_or(DecoderError::Custom("unknown member type"))?,
        })
    }
}

/// Result of one committee election: the active members and the backups
/// waiting behind them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElectionCommittee {
    pub members: Vec<CommitteeMember>,
    pub backups: Vec<CommitteeMember>,
}

impl Encodable for ElectionCommittee {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append_list(&self.members);
        s.append_list(&self.backups);
    }
}

impl Decodable for ElectionCommittee {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(ElectionCommittee {
            members: rlp.list_at(0)?,
            backups: rlp.list_at(1)?,
        })
    }
}

/// Vote result carried by a PBFT sign.
pub const VOTE_AGREE: u32 = 1;
pub const VOTE_AGAINST: u32 = 0;

/// A committee member's signature over one fast block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PbftSign {
    pub fast_height: u64,
    pub fast_hash: H256,
    pub result: u32,
    /// 65-byte recoverable signature over [`PbftSign::hash_with_no_sign`].
    pub sign: Vec<u8>,
}

impl PbftSign {
    /// The message hash the signature commits to.
    pub fn hash_with_no_sign(&self) -> H256 {
        let mut s = RlpStream::new_list(3);
        s.append(&self.fast_height);
        s.append(&self.fast_hash);
        s.append(&self.result);
        crypto::keccak256(&s.out())
    }
}

impl Encodable for PbftSign {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.fast_height);
        s.append(&self.fast_hash);
        s.append(&self.result);
        s.append(&self.sign);
    }
}

impl Decodable for PbftSign {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(PbftSign {
            fast_height: rlp.val_at(0)?,
            fast_hash: rlp.val_at(1)?,
            result: rlp.val_at(2)?,
            sign: rlp.val_at(3)?,
        })
    }
}

/// A single membership mutation inside a switch info.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchEnter {
    /// Uncompressed public key of the affected member.
    pub pk: Vec<u8>,
    /// `Append` elevates a backup, `Removed` evicts a member.
    pub flag: MemberFlag,
}

/// Committee mutation payload embedded in a fast block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwitchInfo {
    /// Id of the committee the mutation belongs to.
    pub cid: u64,
    pub vals: Vec<SwitchEnter>,
}

impl Encodable for SwitchEnter {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.pk);
        s.append(&(self.flag as u8));
    }
}

impl Decodable for SwitchEnter {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(SwitchEnter {
            pk: rlp.val_at(0)?,
            flag: MemberFlag::from_u8(rlp.val_at::<u8>(1)?)
                .ok_or(DecoderError::Custom("unknown switch flag"))?,
        })
    }
}

impl Encodable for SwitchInfo {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.cid);
        s.append_list(&self.vals);
    }
}

impl Decodable for SwitchInfo {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(SwitchInfo {
            cid: rlp.val_at(0)?,
            vals: rlp.list_at(1)?,
        })
    }
}

/// Header shared by snail blocks and fruits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnailHeader {
    pub parent_hash: H256,
    pub number: u64,
    /// Full-block difficulty target.
    pub difficulty: U256,
    /// Fruit difficulty target.
    pub fruit_difficulty: U256,
    /// Back-reference into snail history anchoring the fruit's freshness.
    pub point_number: u64,
    /// Fast block this fruit shadows; 0 for a pure block header.
    pub fast_number: u64,
    pub fast_hash: H256,
    /// Commitment to the fruit's PBFT signs ([`crypto::calc_sign_hash`]).
    pub sign_hash: H256,
    pub nonce: u64,
    pub mix_digest: H256,
    pub is_fruit: bool,
    pub coinbase: H160,
    /// Miner opts its key into the next election.
    pub to_elect: bool,
    /// Uncompressed public key of the miner, candidate identity for the
    /// election.
    pub publickey: Vec<u8>,
}

impl SnailHeader {
    /// Canonical header hash.
    pub fn hash(&self) -> H256 {
        crypto::keccak256(&rlp::encode(self))
    }

    /// Hash of everything the proof of work commits to: the header
    /// without the seal fields (`nonce`, `mix_digest`) and without
    /// `is_fruit`, which the sealer decides only after a digest half
    /// meets its target.
    pub fn hash_no_nonce(&self) -> H256 {
        let mut s = RlpStream::new_list(11);
        s.append(&self.parent_hash);
        s.append(&self.number);
        s.append(&self.difficulty);
        s.append(&self.fruit_difficulty);
        s.append(&self.point_number);
        s.append(&self.fast_number);
        s.append(&self.fast_hash);
        s.append(&self.sign_hash);
        s.append(&self.coinbase);
        s.append(&(self.to_elect as u8));
        s.append(&self.publickey);
        crypto::keccak256(&s.out())
    }
}

impl Encodable for SnailHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(14);
        s.append(&self.parent_hash);
        s.append(&self.number);
        s.append(&self.difficulty);
        s.append(&self.fruit_difficulty);
        s.append(&self.point_number);
        s.append(&self.fast_number);
        s.append(&self.fast_hash);
        s.append(&self.sign_hash);
        s.append(&self.nonce);
        s.append(&self.mix_digest);
        s.append(&(self.is_fruit as u8));
        s.append(&self.coinbase);
        s.append(&(self.to_elect as u8));
        s.append(&self.publickey);
    }
}

impl Decodable for SnailHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(SnailHeader {
            parent_hash: rlp.val_at(0)?,
            number: rlp.val_at(1)?,
            difficulty: rlp.val_at(2)?,
            fruit_difficulty: rlp.val_at(3)?,
            point_number: rlp.val_at(4)?,
            fast_number: rlp.val_at(5)?,
            fast_hash: rlp.val_at(6)?,
            sign_hash: rlp.val_at(7)?,
            nonce: rlp.val_at(8)?,
            mix_digest: rlp.val_at(9)?,
            is_fruit: rlp.val_at::<u8>(10)? != 0,
            coinbase: rlp.val_at(11)?,
            to_elect: rlp.val_at::<u8>(12)? != 0,
            publickey: rlp.val_at(13)?,
        })
    }
}

/// A snail-chain block. A fruit is the degenerate case with an empty fruit
/// list and `header.is_fruit` set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnailBlock {
    header: SnailHeader,
    fruits: Vec<SnailBlock>,
    signs: Vec<PbftSign>,
}

impl SnailBlock {
    pub fn new_block(header: SnailHeader, fruits: Vec<SnailBlock>, signs: Vec<PbftSign>) -> Self {
        SnailBlock {
            header,
            fruits,
            signs,
        }
    }

    pub fn new_fruit(header: SnailHeader, signs: Vec<PbftSign>) -> Self {
        SnailBlock {
            header,
            fruits: Vec::new(),
            signs,
        }
    }

    /// The same body under a freshly sealed header.
    pub fn with_seal(&self, header: SnailHeader) -> Self {
        SnailBlock {
            header,
            fruits: self.fruits.clone(),
            signs: self.signs.clone(),
        }
    }

    pub fn header(&self) -> &SnailHeader {
        &self.header
    }

    pub fn fruits(&self) -> &[SnailBlock] {
        &self.fruits
    }

    pub fn signs(&self) -> &[PbftSign] {
        &self.signs
    }

    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> H256 {
        self.header.parent_hash
    }

    pub fn is_fruit(&self) -> bool {
        self.header.is_fruit
    }

    pub fn fast_number(&self) -> u64 {
        self.header.fast_number
    }

    pub fn fast_hash(&self) -> H256 {
        self.header.fast_hash
    }

    pub fn point_number(&self) -> u64 {
        self.header.point_number
    }

    pub fn difficulty(&self) -> U256 {
        self.header.difficulty
    }

    pub fn fruit_difficulty(&self) -> U256 {
        self.header.fruit_difficulty
    }

    pub fn to_elect(&self) -> bool {
        self.header.to_elect
    }

    /// The miner's public key, validated as a curve point.
    pub fn pubkey(&self) -> Result<Vec<u8>, crypto::Error> {
        crypto::validate_pubkey(&self.header.publickey)?;
        Ok(self.header.publickey.clone())
    }

    /// Largest fast number among this block's fruits.
    pub fn max_fruit_fast_number(&self) -> Option<u64> {
        self.fruits.iter().map(|f| f.fast_number()).max()
    }
}

impl Encodable for SnailBlock {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.header);
        s.append_list(&self.fruits);
        s.append_list(&self.signs);
    }
}

impl Decodable for SnailBlock {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(SnailBlock {
            header: rlp.val_at(0)?,
            fruits: rlp.list_at(1)?,
            signs: rlp.list_at(2)?,
        })
    }
}

/// The view of a fast-chain block this core needs: its position and the
/// optional committee mutation it carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FastBlock {
    number: u64,
    hash: H256,
    parent_hash: H256,
    switch_info: Option<SwitchInfo>,
}

impl FastBlock {
    pub fn new(number: u64, parent_hash: H256, switch_info: Option<SwitchInfo>) -> Self {
        let mut s = RlpStream::new_list(3);
        s.append(&number);
        s.append(&parent_hash);
        match &switch_info {
            Some(info) => s.append(info),
            None => s.append_empty_data(),
        };
        let hash = crypto::keccak256(&s.out());
        FastBlock {
            number,
            hash,
            parent_hash,
            switch_info,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn parent_hash(&self) -> H256 {
        self.parent_hash
    }

    pub fn switch_info(&self) -> Option<&SwitchInfo> {
        self.switch_info.as_ref()
    }
}

/// Accepted fruits leaving the fruit pool.
#[derive(Clone, Debug)]
pub struct NewFruitsEvent {
    pub fruits: Vec<Arc<SnailBlock>>,
}

/// A freshly sealed snail block leaving the sealer.
#[derive(Clone, Debug)]
pub struct NewMinedBlockEvent {
    pub block: Arc<SnailBlock>,
}

/// Snail chain head change.
#[derive(Clone, Debug)]
pub struct ChainSnailHeadEvent {
    pub block: Arc<SnailBlock>,
}

/// Fast chain head change.
#[derive(Clone, Debug)]
pub struct ChainFastEvent {
    pub block: Arc<FastBlock>,
}

/// Committee lifecycle transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElectionOption {
    /// Next committee elected, not yet active.
    Switchover,
    /// Committee became active.
    Start,
    /// Committee retired.
    Stop,
    /// Current committee's end fast number became known.
    Over,
    /// A switch info mutated the effective member set.
    Update,
}

/// Committee lifecycle event published by the election engine.
#[derive(Clone, Debug)]
pub struct ElectionEvent {
    pub option: ElectionOption,
    pub committee_id: u64,
    pub begin_fast_number: u64,
    pub end_fast_number: Option<u64>,
    pub members: Vec<CommitteeMember>,
    pub backups: Vec<CommitteeMember>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> SnailHeader {
        SnailHeader {
            parent_hash: H256::repeat_byte(1),
            number: 42,
            difficulty: U256::from(2_000_000u64),
            fruit_difficulty: U256::from(2_000u64),
            point_number: 40,
            fast_number: 977,
            fast_hash: H256::repeat_byte(9),
            sign_hash: H256::repeat_byte(3),
            nonce: 0xdeadbeef,
            mix_digest: H256::repeat_byte(5),
            is_fruit: true,
            coinbase: H160::repeat_byte(7),
            to_elect: true,
            publickey: vec![4u8; 65],
        }
    }

    #[test]
    fn header_rlp_roundtrip() {
        let header = sample_header();
        let encoded = rlp::encode(&header);
        let decoded: SnailHeader = rlp::decode(&encoded).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn hash_no_nonce_ignores_seal_fields() {
        let header = sample_header();
        let mut sealed = header.clone();
        sealed.nonce = 1;
        sealed.mix_digest = H256::repeat_byte(0xff);
        sealed.is_fruit = !header.is_fruit;
        assert_eq!(header.hash_no_nonce(), sealed.hash_no_nonce());
        assert_ne!(header.hash(), sealed.hash());
    }

    #[test]
    fn block_rlp_roundtrip_with_fruits_and_signs() {
        let fruit = SnailBlock::new_fruit(
            sample_header(),
            vec![PbftSign {
                fast_height: 977,
                fast_hash: H256::repeat_byte(9),
                result: VOTE_AGREE,
                sign: vec![1u8; 65],
            }],
        );
        let mut header = sample_header();
        header.is_fruit = false;
        header.fast_number = 0;
        let block = SnailBlock::new_block(header, vec![fruit], Vec::new());

        let encoded = rlp::encode(&block);
        let decoded: SnailBlock = rlp::decode(&encoded).unwrap();
        assert_eq!(block, decoded);
        assert_eq!(decoded.max_fruit_fast_number(), Some(977));
    }

    #[test]
    fn fast_block_hash_covers_switch_info() {
        let plain = FastBlock::new(5, H256::zero(), None);
        let with_info = FastBlock::new(
            5,
            H256::zero(),
            Some(SwitchInfo {
                cid: 1,
                vals: vec![SwitchEnter {
                    pk: vec![4u8; 65],
                    flag: MemberFlag::Removed,
                }],
            }),
        );
        assert_ne!(plain.hash(), with_info.hash());
    }

    #[test]
    fn member_flags_roundtrip_raw_values() {
        for flag in [
            MemberFlag::Unused,
            MemberFlag::Used,
            MemberFlag::Append,
            MemberFlag::Removed,
        ] {
            assert_eq!(MemberFlag::from_u8(flag as u8), Some(flag));
        }
        assert_eq!(MemberFlag::from_u8(0x01), None);
    }
}
