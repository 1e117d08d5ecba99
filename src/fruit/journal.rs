//! Journal of local fruits surviving node restarts.

use crate::blockcfg::SnailBlock;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// RLP file of the pool's local fruits, rewritten on every rotation.
pub struct SnailJournal {
    path: PathBuf,
}

impl SnailJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SnailJournal { path: path.into() }
    }

    /// Loads the journalled fruits; a missing file is an empty journal.
    pub fn load(&self) -> io::Result<Vec<SnailBlock>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        rlp::Rlp::new(&raw)
            .as_list()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Atomically replaces the journal with the given fruit set.
    pub fn rotate(&self, fruits: &[Arc<SnailBlock>]) -> io::Result<()> {
        let mut stream = rlp::RlpStream::new_list(fruits.len());
        for fruit in fruits {
            stream.append(fruit.as_ref());
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, stream.out())?;
        fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockcfg::SnailHeader;
    use primitive_types::H256;

    #[test]
    fn rotate_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = SnailJournal::new(dir.path().join("fruits.rlp"));

        assert!(journal.load().unwrap().is_empty());

        let fruits: Vec<_> = (1u64..4)
            .map(|n| {
                Arc::new(SnailBlock::new_fruit(
                    SnailHeader {
                        fast_number: n,
                        fast_hash: H256::repeat_byte(n as u8),
                        is_fruit: true,
                        ..Default::default()
                    },
                    Vec::new(),
                ))
            })
            .collect();
        journal.rotate(&fruits).unwrap();

        let loaded = journal.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].fast_number(), 2);
    }
}
