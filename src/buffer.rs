use std::sync::{Arc, Mutex};

use crate::block_id::BlockId;
use crate::error::StorageResult;
use crate::file_manager::FileManager;
use crate::log_manager::{LogManager, Lsn};
use crate::log_record::TxId;
use crate::page::{Page, PageFormatter};

/// One slot of the buffer pool: a page image plus the pin, dirty, and
/// eviction bookkeeping for it.
///
/// Slots are created once at pool construction and rebound to different
/// blocks for the life of the process. A slot with a pin count above zero is
/// never rebound.
pub struct Buffer {
    file_manager: Arc<FileManager>,
    log_manager: Arc<Mutex<LogManager>>,
    pub page: Page,
    slot: usize,
    blk: Option<BlockId>,
    pin_count: u32,
    /// Transaction with unflushed changes in this slot, if any. Set means
    /// dirty; flushing clears it.
    tx_num: Option<TxId>,
    /// LSN of the most recent logged change not yet flushed. Unlogged
    /// (temp-file) changes leave this untouched.
    lsn: Option<Lsn>,
    /// Second-chance bit for the clock sweep.
    referenced: bool,
}

impl Buffer {
    pub fn new(
        slot: usize,
        file_manager: Arc<FileManager>,
        log_manager: Arc<Mutex<LogManager>>,
    ) -> Self {
        Self {
            file_manager,
            log_manager,
            page: Page::new(),
            slot,
            blk: None,
            pin_count: 0,
            tx_num: None,
            lsn: None,
            referenced: false,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn block(&self) -> Option<&BlockId> {
        self.blk.as_ref()
    }

    /// Mark the buffer dirty on behalf of a transaction. `lsn` is `None` for
    /// changes that were not logged.
    pub fn set_modified(&mut self, tx_num: TxId, lsn: Option<Lsn>) {
        self.tx_num = Some(tx_num);
        if lsn.is_some() {
            self.lsn = lsn;
        }
    }

    pub fn is_modified_by(&self, tx_num: TxId) -> bool {
        self.tx_num == Some(tx_num)
    }

    pub fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub fn unpin(&mut self) {
        assert!(self.pin_count > 0, "unpin of a buffer that is not pinned");
        self.pin_count -= 1;
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }

    pub fn referenced(&self) -> bool {
        self.referenced
    }

    pub fn set_referenced(&mut self) {
        self.referenced = true;
    }

    pub fn clear_referenced(&mut self) {
        self.referenced = false;
    }

    /// Rebind this slot to an existing block, flushing whatever it held.
    pub fn assign_to_block(&mut self, blk: BlockId) -> StorageResult<()> {
        self.flush()?;
        self.file_manager.get_block(&blk, &mut self.page)?;
        log::trace!("slot {} bound to block {}", self.slot, blk);
        self.blk = Some(blk);
        self.pin_count = 0;
        Ok(())
    }

    /// Rebind this slot to a freshly appended block in `file_id`, formatted
    /// by `fmtr`. Returns the identity of the new block.
    pub fn assign_to_new(
        &mut self,
        file_id: &str,
        fmtr: &dyn PageFormatter,
    ) -> StorageResult<BlockId> {
        self.flush()?;
        self.page = Page::new();
        fmtr.format(&mut self.page);
        let blk = self.file_manager.append_block(file_id, &self.page)?;
        log::trace!("slot {} bound to new block {}", self.slot, blk);
        self.blk = Some(blk.clone());
        self.pin_count = 0;
        Ok(blk)
    }

    /// Force the page to disk if it holds unflushed changes, honoring the
    /// write-ahead rule: the log is flushed through this page's LSN first.
    pub fn flush(&mut self) -> StorageResult<()> {
        let blk = match &self.blk {
            Some(blk) => blk,
            None => return Ok(()),
        };

        if self.tx_num.is_some() {
            if let Some(lsn) = self.lsn {
                self.log_manager.lock().unwrap().flush(lsn)?;
            }
            log::trace!("flushing slot {} holding block {}", self.slot, blk);
            self.file_manager.write_block(blk, &self.page)?;
            self.tx_num = None;
        }

        Ok(())
    }
}
