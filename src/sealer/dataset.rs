//! Rolling lookup-table lifecycle.
//!
//! Two tables (`even`, `odd`) alternate: one is active while the other is
//! rebuilt from the hashes of 8192 + 2048 snail headers of the previous
//! window. Workers snapshot the active table pointer under the lock and
//! mine against the snapshot, so a swap never invalidates an in-flight
//! attempt.

use crate::chain::SnailChain;
use crate::crypto::keccak256_concat;
use std::sync::{Arc, Mutex};

pub const TBL_SIZE: usize = 16;
pub const DATA_LENGTH: usize = 2048;
pub const PMT_SIZE: usize = 4;
/// Snail blocks per table window.
pub const UPDATE_BLOCK_LENGTH: u64 = 12000;
/// Offset into the window at which the inactive table starts rebuilding.
pub const START_UPDATE_NUM: u64 = 10240;

const OFFSET_HEADERS: u64 = 8192;
const SKIP_HEADERS: u64 = 2048;
const OFFSET_MASK: u8 = 0x1f;
const SKIP_MASK: u8 = 0x03;

/// Entries in the offset/skip position arrays: one per table cell.
const POSITIONS: usize = TBL_SIZE * DATA_LENGTH;
/// 64-bit words per table: a `DATA_LENGTH`-bit row per cell.
const LOOKUP_WORDS: usize = TBL_SIZE * DATA_LENGTH * (DATA_LENGTH / 64);

struct Tables {
    even: Arc<Vec<u64>>,
    odd: Arc<Vec<u64>>,
    active_even: bool,
    even_built: bool,
    odd_built: bool,
    initialized: bool,
}

/// Owner of the double-buffered lookup tables.
pub struct DatasetManager {
    tables: Mutex<Tables>,
}

impl DatasetManager {
    /// Starts with the deterministic genesis table active on the even
    /// slot; [`check_dataset_state`](Self::check_dataset_state) replaces
    /// it when the chain is already past the first window.
    pub fn new() -> Self {
        DatasetManager {
            tables: Mutex::new(Tables {
                even: Arc::new(genesis_table()),
                odd: Arc::new(vec![0u64; LOOKUP_WORDS]),
                active_even: true,
                even_built: false,
                odd_built: false,
                initialized: false,
            }),
        }
    }

    /// Snapshot of the currently active table.
    pub fn active(&self) -> Arc<Vec<u64>> {
        let tables = self.tables.lock().unwrap();
        if tables.active_even {
            Arc::clone(&tables.even)
        } else {
            Arc::clone(&tables.odd)
        }
    }

    /// Drives the table lifecycle for the given snail height. Returns
    /// `false` when a rebuild could not complete (missing headers); the
    /// active table keeps serving in that case.
    pub fn check_dataset_state(&self, block_num: u64, chain: &dyn SnailChain) -> bool {
        let mut tables = self.tables.lock().unwrap();

        if !tables.initialized {
            if block_num <= UPDATE_BLOCK_LENGTH {
                tables.active_even = true;
            } else {
                let window = block_num / UPDATE_BLOCK_LENGTH;
                let rebuild_at = (window - 1) * UPDATE_BLOCK_LENGTH + START_UPDATE_NUM + 1;
                tables.active_even = window % 2 == 0;
                if let Some(table) = build_from_chain(rebuild_at, chain) {
                    if tables.active_even {
                        tables.even = Arc::new(table);
                    } else {
                        tables.odd = Arc::new(table);
                    }
                }
                tables.even_built = false;
                tables.odd_built = false;
            }
            tables.initialized = true;
        }

        if block_num % UPDATE_BLOCK_LENGTH >= START_UPDATE_NUM {
            let even_window = (block_num / UPDATE_BLOCK_LENGTH) % 2 == 0;
            if even_window {
                if !tables.odd_built {
                    match build_from_chain(block_num, chain) {
                        Some(table) => {
                            tables.odd = Arc::new(table);
                            tables.odd_built = true;
                        }
                        None => return false,
                    }
                }
            } else if !tables.even_built {
                match build_from_chain(block_num, chain) {
                    Some(table) => {
                        tables.even = Arc::new(table);
                        tables.even_built = true;
                    }
                    None => return false,
                }
            }
        }

        if block_num % UPDATE_BLOCK_LENGTH == 1 {
            if (block_num / UPDATE_BLOCK_LENGTH) % 2 == 0 {
                tables.active_even = true;
                tables.even_built = false;
            } else {
                tables.active_even = false;
                tables.odd_built = false;
            }
        }
        true
    }
}

impl Default for DatasetManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuilds a table from the header hashes of the window that `block_num`
/// belongs to. `None` when the height is still inside the protected
/// prefix or any required header is missing.
fn build_from_chain(block_num: u64, chain: &dyn SnailChain) -> Option<Vec<u64>> {
    let res = block_num % UPDATE_BLOCK_LENGTH;
    if res <= START_UPDATE_NUM {
        return None;
    }
    let start = block_num - res;

    let mut offsets = vec![0i32; POSITIONS];
    let mut skips = vec![0i32; POSITIONS];

    for i in 0..OFFSET_HEADERS {
        let header = chain.header_by_number(start + i)?;
        let hash = header.hash();
        let bytes = hash.as_bytes();
        for j in 0..4 {
            offsets[(i as usize) * 4 + j] = ((bytes[j] & OFFSET_MASK) as i32) - 16;
        }
    }
    for i in 0..SKIP_HEADERS {
        let header = chain.header_by_number(start + OFFSET_HEADERS + i)?;
        let hash = header.hash();
        let bytes = hash.as_bytes();
        for k in 0..16 {
            skips[(i as usize) * 16 + k] = ((bytes[k] & SKIP_MASK) as i32) + 1;
        }
    }

    let mut table = vec![0u64; LOOKUP_WORDS];
    populate(&mut table, &offsets, &skips);
    Some(table)
}

/// The static genesis table: the same offset/skip population as the
/// windowed rebuild, with positions expanded from a fixed seed tag
/// instead of header hashes. Identical on every node.
fn genesis_table() -> Vec<u64> {
    const TAG: &[u8] = b"ratatosk/lookup-table/genesis/v1";

    let mut stream = Vec::with_capacity(POSITIONS * 2);
    let mut counter = 0u64;
    while stream.len() < POSITIONS * 2 {
        let chunk = keccak256_concat([TAG, &counter.to_be_bytes()]);
        stream.extend_from_slice(chunk.as_bytes());
        counter += 1;
    }

    let mut offsets = vec![0i32; POSITIONS];
    let mut skips = vec![0i32; POSITIONS];
    for i in 0..POSITIONS {
        offsets[i] = ((stream[i] & OFFSET_MASK) as i32) - 16;
        skips[i] = ((stream[POSITIONS + i] & SKIP_MASK) as i32) + 1;
    }

    let mut table = vec![0u64; LOOKUP_WORDS];
    populate(&mut table, &offsets, &skips);
    table
}

/// Scatters one `DATA_LENGTH`-bit row per table cell: around each
/// position, `2 * PMT_SIZE` bits are set at the cell's skip stride.
fn populate(table: &mut [u64], offsets: &[i32], skips: &[i32]) {
    let row_words = DATA_LENGTH / 64;
    let table_words = DATA_LENGTH * row_words;

    for k in 0..TBL_SIZE {
        let mut row = k * table_words;
        for x in 0..DATA_LENGTH {
            let idx = k * DATA_LENGTH + x;
            let pos = offsets[idx] + x as i32;
            let skip = skips[idx];
            let mut y = pos - skip * PMT_SIZE as i32;
            let end = pos + skip * PMT_SIZE as i32;
            while y < end {
                if y >= 0 && (y as usize) < DATA_LENGTH {
                    let word = (y as usize) / 64;
                    let bit = (y as usize) % 64;
                    table[row + word] |= 1u64 << bit;
                }
                y += skip;
            }
            row += row_words;
        }
    }
}
