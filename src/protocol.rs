//! Wire payloads for the snail-chain message codes.
//!
//! Transport framing and dispatch live elsewhere; this module only fixes
//! the two codes this core consumes and the RLP shape of their payloads,
//! feeding decoded fruits into the pool's remote entry point.

use crate::blockcfg::SnailBlock;
use primitive_types::U256;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

/// RLP list of fruit records.
pub const FRUIT_MSG: u8 = 0x0a;
/// One snail block plus its total difficulty.
pub const SNAIL_BLOCK_MSG: u8 = 0x0b;

/// Payload of [`SNAIL_BLOCK_MSG`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnailBlockPacket {
    pub block: SnailBlock,
    pub total_difficulty: U256,
}

impl Encodable for SnailBlockPacket {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.block);
        s.append(&self.total_difficulty);
    }
}

impl Decodable for SnailBlockPacket {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(SnailBlockPacket {
            block: rlp.val_at(0)?,
            total_difficulty: rlp.val_at(1)?,
        })
    }
}

/// Encodes a [`FRUIT_MSG`] payload.
pub fn encode_fruits(fruits: &[SnailBlock]) -> Vec<u8> {
    let mut s = RlpStream::new_list(fruits.len());
    for fruit in fruits {
        s.append(fruit);
    }
    s.out().to_vec()
}

/// Decodes a [`FRUIT_MSG`] payload.
pub fn decode_fruits(payload: &[u8]) -> Result<Vec<SnailBlock>, DecoderError> {
    Rlp::new(payload).as_list()
}
