use core::fmt;

use serde::{Deserialize, Serialize};

/// BlockId identifies one fixed-size block by file name and position.
///
/// It is the key of the buffer pool's block index and is embedded in update
/// log records, so it must hash and serialize cheaply.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockId {
    file_id: String,
    num: u64,
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}]", self.file_id, self.num)
    }
}

impl BlockId {
    pub fn new(file_id: &str, num: u64) -> Self {
        BlockId {
            file_id: file_id.to_string(),
            num,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn num(&self) -> u64 {
        self.num
    }

    /// The block immediately before this one in the same file, if any.
    /// The log snapshot walks blocks backward with this.
    pub fn previous(&self) -> Option<BlockId> {
        match self.num {
            0 => None,
            _ => Some(BlockId {
                file_id: self.file_id.clone(),
                num: self.num - 1,
            }),
        }
    }

    pub fn next(&self) -> BlockId {
        BlockId {
            file_id: self.file_id.clone(),
            num: self.num + 1,
        }
    }
}
