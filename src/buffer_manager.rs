use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::block_id::BlockId;
use crate::buffer::Buffer;
use crate::error::{StorageError, StorageResult};
use crate::file_manager::FileManager;
use crate::log_manager::LogManager;
use crate::log_record::TxId;
use crate::page::PageFormatter;

/// Fixed-size pool of buffers with clock (second-chance) replacement.
///
/// Callers share one manager behind a single `Arc<Mutex<_>>`; every pin,
/// unpin, and flush decision runs under that one lock so the clock hand, the
/// block index, and the availability count are always observed together.
/// Page contents are not protected by the pool lock; a caller holding a pin
/// coordinates its own access, the pool only guarantees the slot will not be
/// rebound while pinned.
pub struct BufferManager {
    buffers: Vec<Arc<RwLock<Buffer>>>,
    blk_to_buf: HashMap<BlockId, usize>,
    num_available: usize,
    clock_hand: usize,
}

impl BufferManager {
    /// Creates a manager with `size` slots. The pool is never resized.
    pub fn new(
        size: usize,
        file_manager: Arc<FileManager>,
        log_manager: Arc<Mutex<LogManager>>,
    ) -> Self {
        Self {
            buffers: (0..size)
                .map(|slot| {
                    Arc::new(RwLock::new(Buffer::new(
                        slot,
                        file_manager.clone(),
                        log_manager.clone(),
                    )))
                })
                .collect(),
            blk_to_buf: HashMap::new(),
            num_available: size,
            clock_hand: 0,
        }
    }

    /// The number of currently unpinned buffers.
    pub fn available(&self) -> usize {
        self.num_available
    }

    /// Pin a buffer to the given block, reading it in if it is not already
    /// resident. Fails immediately with `PoolExhausted` when every slot is
    /// pinned; the caller retries or aborts, the pool never blocks.
    pub fn pin(&mut self, blk: &BlockId) -> StorageResult<Arc<RwLock<Buffer>>> {
        if let Some(&buf_index) = self.blk_to_buf.get(blk) {
            let arc = Arc::clone(&self.buffers[buf_index]);
            {
                let mut buf = arc.write().unwrap();
                if !buf.is_pinned() {
                    self.num_available -= 1;
                }
                buf.pin();
                buf.set_referenced();
                log::trace!(
                    "block {} already resident in slot {}, pin count now {}",
                    blk,
                    buf_index,
                    buf.pin_count()
                );
            }
            return Ok(arc);
        }

        let buf_index = self.choose_unpinned_buffer()?;
        let arc = Arc::clone(&self.buffers[buf_index]);
        {
            let mut victim = arc.write().unwrap();
            let old_blk = victim.block().cloned();
            victim.assign_to_block(blk.clone())?;

            // The slot's own back-pointer gives O(1) index maintenance.
            if let Some(old) = old_blk {
                self.blk_to_buf.remove(&old);
            }
            self.blk_to_buf.insert(blk.clone(), buf_index);

            self.num_available -= 1;
            victim.pin();
            victim.set_referenced();
            log::trace!("block {} loaded into slot {}", blk, buf_index);
        }

        Ok(arc)
    }

    /// Allocate a new block at the end of `file_id`, format it with `fmtr`,
    /// and pin a buffer to it. When no buffer is available the new block is
    /// never allocated.
    pub fn pin_new(
        &mut self,
        file_id: &str,
        fmtr: &dyn PageFormatter,
    ) -> StorageResult<Arc<RwLock<Buffer>>> {
        let buf_index = self.choose_unpinned_buffer()?;
        let arc = Arc::clone(&self.buffers[buf_index]);
        {
            let mut victim = arc.write().unwrap();
            let old_blk = victim.block().cloned();
            let blk = victim.assign_to_new(file_id, fmtr)?;

            if let Some(old) = old_blk {
                self.blk_to_buf.remove(&old);
            }
            self.blk_to_buf.insert(blk, buf_index);

            self.num_available -= 1;
            victim.pin();
            victim.set_referenced();
            log::trace!("new block appended to '{}' in slot {}", file_id, buf_index);
        }

        Ok(arc)
    }

    /// Unpin a buffer. Eviction never happens here; an unpinned slot simply
    /// becomes a candidate for the next clock sweep.
    pub fn unpin(&mut self, buffer: &Arc<RwLock<Buffer>>) {
        let mut buffer = buffer.write().unwrap();
        self.unpin_locked(&mut buffer);
    }

    /// Unpin a buffer whose write lock is already held. Unpinning a buffer
    /// that is not pinned is a caller bug and asserts.
    pub fn unpin_locked(&mut self, buffer: &mut Buffer) {
        buffer.unpin();
        if !buffer.is_pinned() {
            self.num_available += 1;
            log::trace!(
                "slot {} fully unpinned, {} buffers available",
                buffer.slot(),
                self.num_available
            );
        }
    }

    /// Force every buffer dirtied by the given transaction to disk.
    pub fn flush_all(&mut self, tx_num: TxId) -> StorageResult<()> {
        for buf in self.buffers.iter() {
            let mut b = buf.write().unwrap();
            if b.is_modified_by(tx_num) {
                b.flush()?;
            }
        }
        Ok(())
    }

    /// Clock sweep: starting at the hand, skip pinned slots, give a
    /// referenced slot a second chance by clearing its bit, and take the
    /// first unpinned unreferenced slot. The hand moves past every examined
    /// slot, the winner included, so successive evictions sweep the whole
    /// pool round-robin. With at least one unpinned slot the sweep finishes
    /// within two passes.
    fn choose_unpinned_buffer(&mut self) -> StorageResult<usize> {
        if self.num_available == 0 {
            return Err(StorageError::PoolExhausted);
        }

        loop {
            let buf_index = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % self.buffers.len();

            let mut buf = self.buffers[buf_index].write().unwrap();
            if !buf.is_pinned() {
                if buf.referenced() {
                    buf.clear_referenced();
                } else {
                    log::trace!("clock selected slot {} for eviction", buf_index);
                    return Ok(buf_index);
                }
            }
        }
    }
}
