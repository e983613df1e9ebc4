use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;

use crate::block_id::BlockId;
use crate::error::StorageResult;
use crate::file_manager::FileManager;
use crate::page::{Page, PAGE_SIZE};

const LOG_NAME: &str = "log";

/// Log sequence number. Assigned by `LogManager::append` in a single total
/// order, increasing and gapless within a session. Negative values are dummy
/// LSNs for writes that were deliberately not logged.
pub type Lsn = i64;

type LogPage = Page;
type Frontier = u32;
const FRONTIER_POS: usize = 0;
const FRONTIER_START: usize = size_of::<Frontier>();

trait ImplLogPage {
    fn get_frontier(&self) -> u32;
    fn set_frontier(&mut self, f: u32);
}

impl ImplLogPage for LogPage {
    fn get_frontier(&self) -> u32 {
        self.read::<u32>(FRONTIER_POS)
    }

    fn set_frontier(&mut self, f: u32) {
        self.write(f, FRONTIER_POS);
    }
}

/// Append-only durable record store backing the write-ahead log.
///
/// Records accumulate forward in an in-memory log page whose first word (the
/// frontier) tracks the used prefix; each record is written as its bytes
/// followed by a u32 length so that the page can be walked backward. When a
/// record does not fit the current page is forced and a fresh block appended.
///
/// Durability contract: `flush(lsn)` returns only once every record with a
/// sequence number <= `lsn` has reached disk.
pub struct LogManager {
    file_manager: Arc<FileManager>,
    page: LogPage,
    block_num: u64,
    latest_lsn: Lsn,
    last_flushed_lsn: Lsn,
}

impl LogManager {
    pub fn new(root_directory: &Path) -> StorageResult<Self> {
        let file_manager = Arc::new(FileManager::new(root_directory)?);

        let num_blocks = file_manager.length(LOG_NAME)?;
        let mut page = Page::new();

        let block_num = if num_blocks == 0 {
            page.set_frontier(FRONTIER_START as u32);
            file_manager.append_block(LOG_NAME, &page)?.num()
        } else {
            // Pick up appending where the previous session left off.
            let block_num = num_blocks - 1;
            file_manager.get_block(&BlockId::new(LOG_NAME, block_num), &mut page)?;
            block_num
        };

        Ok(LogManager {
            file_manager,
            page,
            block_num,
            latest_lsn: 0,
            last_flushed_lsn: 0,
        })
    }

    fn append_block(&mut self) -> StorageResult<()> {
        self.page = Page::new();
        self.page.set_frontier(FRONTIER_START as u32);
        self.block_num = self.file_manager.append_block(LOG_NAME, &self.page)?.num();
        Ok(())
    }

    /// Append a record and return its sequence number. The record is only
    /// guaranteed durable after a `flush` covering the returned LSN.
    pub fn append(&mut self, record: &[u8]) -> StorageResult<Lsn> {
        let len = record.len();
        assert!(
            FRONTIER_START + len + size_of::<u32>() <= PAGE_SIZE,
            "log record exceeds page size"
        );

        let mut frontier = self.page.get_frontier() as usize;
        if frontier + len + size_of::<u32>() > PAGE_SIZE {
            // The record won't fit; force the current page out and move on.
            self.force()?;
            self.append_block()?;
            frontier = self.page.get_frontier() as usize;
        }

        frontier += self.page.write_bytes(record, frontier);
        frontier += self.page.write(len as u32, frontier);
        self.page.set_frontier(frontier as u32);

        self.latest_lsn += 1;
        log::trace!("appended log record with lsn {}", self.latest_lsn);
        Ok(self.latest_lsn)
    }

    /// Durability barrier: ensure every record up to `lsn` is on disk.
    /// A no-op when those records have already been forced.
    pub fn flush(&mut self, lsn: Lsn) -> StorageResult<()> {
        if lsn > self.last_flushed_lsn {
            self.force()?;
        }
        Ok(())
    }

    fn force(&mut self) -> StorageResult<()> {
        self.file_manager
            .write_block(&BlockId::new(LOG_NAME, self.block_num), &self.page)?;
        self.last_flushed_lsn = self.latest_lsn;
        Ok(())
    }

    /// Force the log and return a newest-first traversal of every record in
    /// it. The snapshot reads from disk and is unaffected by later appends.
    pub fn snapshot(&mut self) -> StorageResult<LogSnapshot> {
        self.force()?;

        let block = BlockId::new(LOG_NAME, self.block_num);
        let mut page = Page::new();
        self.file_manager.get_block(&block, &mut page)?;
        let current_pos = page.get_frontier();

        Ok(LogSnapshot {
            file_manager: self.file_manager.clone(),
            block,
            page,
            current_pos,
        })
    }
}

/// Lazy backward (newest record first) walk over the durable log. Ordering
/// is load-bearing: rollback and recovery both depend on seeing a
/// transaction's most recent action before its earlier ones.
pub struct LogSnapshot {
    file_manager: Arc<FileManager>,
    block: BlockId,
    page: LogPage,
    current_pos: u32,
}

impl Iterator for LogSnapshot {
    type Item = StorageResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        debug_assert!(self.current_pos >= FRONTIER_START as u32);

        if self.current_pos == FRONTIER_START as u32 {
            // Exhausted this block; step back to the previous one.
            self.block = self.block.previous()?;
            self.page = LogPage::new();
            if let Err(e) = self.file_manager.get_block(&self.block, &mut self.page) {
                return Some(Err(e));
            }
            self.current_pos = self.page.get_frontier();
        }

        self.current_pos -= size_of::<u32>() as u32;
        let len = self.page.read::<u32>(self.current_pos as usize) as usize;
        self.current_pos -= len as u32;

        let record = self.page.read_bytes(self.current_pos as usize, len);
        Some(Ok(record.to_vec()))
    }
}
