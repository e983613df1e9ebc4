use std::sync::{Arc, Mutex, RwLock};

use crate::block_id::BlockId;
use crate::buffer::Buffer;
use crate::buffer_manager::BufferManager;
use crate::error::{StorageError, StorageResult};
use crate::log_manager::{LogManager, Lsn};
use crate::log_record::{LogRecord, LogRecordIterator, TxId};

/// Shared registry of transactions currently in flight. Checkpoint records
/// capture a snapshot of it; commit and rollback retire entries.
#[derive(Default)]
pub struct TxRegistry {
    active: Mutex<Vec<TxId>>,
}

impl TxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tx_num: TxId) {
        self.active.lock().unwrap().push(tx_num);
    }

    pub fn deregister(&self, tx_num: TxId) {
        self.active.lock().unwrap().retain(|t| *t != tx_num);
    }

    pub fn snapshot(&self) -> Vec<TxId> {
        self.active.lock().unwrap().clone()
    }
}

/// Per-transaction recovery manager.
///
/// Construction writes the transaction's Start record; the manager is then
/// driven down exactly one of two terminal paths, `commit` or `rollback`.
/// `recover` and `checkpoint` are administrative operations that happen to
/// need a transaction to run under but are not part of that lifecycle.
///
/// Update log records carry pre-images only. Commit forces every page the
/// transaction dirtied to disk before its commit record becomes durable
/// (force-at-commit), which is what makes redo unnecessary.
pub struct RecoveryManager {
    tx_num: TxId,
    log_mgr: Arc<Mutex<LogManager>>,
    buf_mgr: Arc<Mutex<BufferManager>>,
    registry: Arc<TxRegistry>,
}

impl RecoveryManager {
    /// Registers the transaction as active and writes its Start record.
    pub fn new(
        tx_num: TxId,
        log_mgr: Arc<Mutex<LogManager>>,
        buf_mgr: Arc<Mutex<BufferManager>>,
        registry: Arc<TxRegistry>,
    ) -> StorageResult<Self> {
        registry.register(tx_num);
        let rm = Self {
            tx_num,
            log_mgr,
            buf_mgr,
            registry,
        };
        LogRecord::Start { tx_num }.write_to_log(&rm.log_mgr)?;
        Ok(rm)
    }

    pub fn tx_num(&self) -> TxId {
        self.tx_num
    }

    /// Force every page this transaction dirtied, then make the commit
    /// record durable. Once this returns, the transaction's effects are on
    /// disk and will never be undone.
    pub fn commit(&self) -> StorageResult<()> {
        self.buf_mgr.lock().unwrap().flush_all(self.tx_num)?;
        let lsn = LogRecord::Commit {
            tx_num: self.tx_num,
        }
        .write_to_log(&self.log_mgr)?;
        self.log_mgr.lock().unwrap().flush(lsn)?;
        self.registry.deregister(self.tx_num);
        log::debug!("transaction {} committed", self.tx_num);
        Ok(())
    }

    /// Undo every change this transaction logged, newest first, then write
    /// and force a Rollback record.
    pub fn rollback(&self) -> StorageResult<()> {
        self.do_rollback()?;
        self.buf_mgr.lock().unwrap().flush_all(self.tx_num)?;
        let lsn = LogRecord::Rollback {
            tx_num: self.tx_num,
        }
        .write_to_log(&self.log_mgr)?;
        self.log_mgr.lock().unwrap().flush(lsn)?;
        self.registry.deregister(self.tx_num);
        log::debug!("transaction {} rolled back", self.tx_num);
        Ok(())
    }

    /// Crash recovery; run once at startup before any new transaction makes
    /// changes. Scans the log backward undoing every update of every
    /// unfinished transaction, then writes a fresh nonquiescent checkpoint
    /// so the next recovery need not scan this far again.
    pub fn recover(&self) -> StorageResult<()> {
        self.do_recover()?;
        self.buf_mgr.lock().unwrap().flush_all(self.tx_num)?;
        let lsn = LogRecord::Checkpoint {
            active_txs: self.registry.snapshot(),
        }
        .write_to_log(&self.log_mgr)?;
        self.log_mgr.lock().unwrap().flush(lsn)?;
        Ok(())
    }

    /// Periodic administrative checkpoint: force the dirty pages of every
    /// active transaction, then log which transactions were active at this
    /// instant. Nonquiescent: nothing is paused, the active list is all a
    /// future recovery needs.
    pub fn checkpoint(&self) -> StorageResult<()> {
        let active = self.registry.snapshot();
        {
            let mut buf_mgr = self.buf_mgr.lock().unwrap();
            for tx in &active {
                buf_mgr.flush_all(*tx)?;
            }
        }
        let lsn = LogRecord::Checkpoint { active_txs: active }.write_to_log(&self.log_mgr)?;
        self.log_mgr.lock().unwrap().flush(lsn)?;
        Ok(())
    }

    /// Log the pre-image of an int at `offset`, apply the new value, and
    /// mark the buffer dirty. Returns the record's LSN, or the dummy LSN -1
    /// for blocks of temporary files, which are never logged.
    pub fn set_int(
        &self,
        buf: &Arc<RwLock<Buffer>>,
        offset: usize,
        new_val: i32,
    ) -> StorageResult<Lsn> {
        let mut b = buf.write().unwrap();
        let old_val: i32 = b.page.read(offset);
        let blk = b.block().ok_or(StorageError::UnboundBuffer)?.clone();

        let lsn = if is_temp_block(&blk) {
            -1
        } else {
            LogRecord::SetInt {
                tx_num: self.tx_num,
                block: blk,
                offset: offset as u16,
                old_val,
            }
            .write_to_log(&self.log_mgr)?
        };

        b.page.write(new_val, offset);
        b.set_modified(self.tx_num, (lsn >= 0).then_some(lsn));
        Ok(lsn)
    }

    /// String flavor of `set_int`; identical protocol.
    pub fn set_string(
        &self,
        buf: &Arc<RwLock<Buffer>>,
        offset: usize,
        new_val: &str,
    ) -> StorageResult<Lsn> {
        let mut b = buf.write().unwrap();
        let old_val: String = b.page.read(offset);
        let blk = b.block().ok_or(StorageError::UnboundBuffer)?.clone();

        let lsn = if is_temp_block(&blk) {
            -1
        } else {
            LogRecord::SetString {
                tx_num: self.tx_num,
                block: blk,
                offset: offset as u16,
                old_val,
            }
            .write_to_log(&self.log_mgr)?
        };

        b.page.write(new_val, offset);
        b.set_modified(self.tx_num, (lsn >= 0).then_some(lsn));
        Ok(lsn)
    }

    /// Walk the log newest-first undoing this transaction's updates, and
    /// stop at its own Start record. Other transactions' records are
    /// skipped, not undone.
    fn do_rollback(&self) -> StorageResult<()> {
        for rec in LogRecordIterator::new(&self.log_mgr)? {
            let rec = rec?;
            if rec.tx_num() == Some(self.tx_num) {
                if let LogRecord::Start { .. } = rec {
                    return Ok(());
                }
                rec.undo(self.tx_num, &self.buf_mgr)?;
            }
        }
        Ok(())
    }

    /// The backward recovery scan. Updates of transactions not known to
    /// have finished are undone. The scan ends at a checkpoint whose active
    /// list was empty, or once the Start record of every transaction that
    /// was active at checkpoint time has been seen, or at the head of the
    /// log on a cold start.
    fn do_recover(&self) -> StorageResult<()> {
        let mut finished: Vec<TxId> = Vec::new();
        let mut checkpoint_active: Option<Vec<TxId>> = None;

        for rec in LogRecordIterator::new(&self.log_mgr)? {
            let rec = rec?;
            match &rec {
                LogRecord::Checkpoint { active_txs } => {
                    if active_txs.is_empty() {
                        // Everything before this point was already resolved.
                        return Ok(());
                    }
                    checkpoint_active = Some(active_txs.clone());
                }
                LogRecord::Commit { tx_num } | LogRecord::Rollback { tx_num } => {
                    finished.push(*tx_num);
                }
                LogRecord::Start { tx_num } => {
                    if let Some(active) = checkpoint_active.as_mut() {
                        active.retain(|t| t != tx_num);
                        if active.is_empty() {
                            // Every checkpoint-time transaction has been
                            // rolled back to its start.
                            return Ok(());
                        }
                    }
                }
                LogRecord::SetInt { tx_num, .. } | LogRecord::SetString { tx_num, .. } => {
                    if !finished.contains(tx_num) {
                        rec.undo(self.tx_num, &self.buf_mgr)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn is_temp_block(blk: &BlockId) -> bool {
    blk.file_id().starts_with("temp")
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::db::TinyStore;
    use crate::page::Page;
    use crate::tests::test_utils::test_store;

    fn read_int_from_disk(store: &TinyStore, blk: &BlockId, offset: usize) -> i32 {
        let mut page = Page::new();
        store.file_manager().get_block(blk, &mut page).unwrap();
        page.read(offset)
    }

    fn read_string_from_disk(store: &TinyStore, blk: &BlockId, offset: usize) -> String {
        let mut page = Page::new();
        store.file_manager().get_block(blk, &mut page).unwrap();
        page.read(offset)
    }

    fn manager(store: &TinyStore, tx_num: TxId) -> RecoveryManager {
        RecoveryManager::new(
            tx_num,
            store.log_manager(),
            store.buffer_manager(),
            store.tx_registry(),
        )
        .unwrap()
    }

    #[test]
    fn test_commit_forces_pages_to_disk() {
        let td = tempdir().unwrap();
        let store = test_store(&td);
        let blk = store
            .file_manager()
            .append_block("data", &Page::new())
            .unwrap();

        let rm = manager(&store, 1);
        let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
        rm.set_int(&buf, 0, 10).unwrap();
        rm.set_string(&buf, 100, "hello").unwrap();
        rm.commit().unwrap();
        store.buffer_manager().lock().unwrap().unpin(&buf);

        // Force-at-commit: the values are on disk without any further flush,
        // even if the process dies right here.
        assert_eq!(read_int_from_disk(&store, &blk, 0), 10);
        assert_eq!(read_string_from_disk(&store, &blk, 100), "hello");
    }

    #[test]
    fn test_rollback_restores_pre_images() {
        let td = tempdir().unwrap();
        let store = test_store(&td);
        let blk = store
            .file_manager()
            .append_block("data", &Page::new())
            .unwrap();

        let rm1 = manager(&store, 1);
        let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
        rm1.set_int(&buf, 0, 10).unwrap();
        rm1.set_string(&buf, 100, "keep me").unwrap();
        rm1.commit().unwrap();

        let rm2 = manager(&store, 2);
        rm2.set_int(&buf, 0, 99).unwrap();
        rm2.set_string(&buf, 100, "discard me").unwrap();
        assert_eq!(buf.read().unwrap().page.read::<i32>(0), 99);
        rm2.rollback().unwrap();
        store.buffer_manager().lock().unwrap().unpin(&buf);

        assert_eq!(read_int_from_disk(&store, &blk, 0), 10);
        assert_eq!(read_string_from_disk(&store, &blk, 100), "keep me");
    }

    #[test]
    fn test_undo_restores_value_before_the_set() {
        let td = tempdir().unwrap();
        let store = test_store(&td);
        let blk = store
            .file_manager()
            .append_block("data", &Page::new())
            .unwrap();

        let rm = manager(&store, 1);
        let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
        rm.set_int(&buf, 4, 10).unwrap();
        rm.set_int(&buf, 4, 77).unwrap();
        store.buffer_manager().lock().unwrap().unpin(&buf);

        // Newest record first: undoing the second set restores 10, the value
        // present before it ran, not 77.
        let mut iter = LogRecordIterator::new(&store.log_manager()).unwrap();
        let newest = iter.next().unwrap().unwrap();
        newest.undo(rm.tx_num(), &store.buffer_manager()).unwrap();

        let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
        assert_eq!(buf.read().unwrap().page.read::<i32>(4), 10);
        store.buffer_manager().lock().unwrap().unpin(&buf);
    }

    #[test]
    fn test_temp_file_writes_are_not_logged() {
        let td = tempdir().unwrap();
        let store = test_store(&td);
        let blk = store
            .file_manager()
            .append_block("temp_sort_run", &Page::new())
            .unwrap();

        let rm = manager(&store, 1);
        let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
        let lsn = rm.set_int(&buf, 0, 42).unwrap();
        assert_eq!(lsn, -1);
        store.buffer_manager().lock().unwrap().unpin(&buf);

        let records: Vec<_> = LogRecordIterator::new(&store.log_manager())
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert!(records
            .iter()
            .all(|r| !matches!(r, LogRecord::SetInt { .. } | LogRecord::SetString { .. })));
    }

    #[test]
    fn test_recovery_undoes_uncommitted_transaction() {
        let td = tempdir().unwrap();
        let data_dir = td.path().join("data");
        let log_dir = td.path().join("log");

        let blk;
        {
            let store = TinyStore::new(&data_dir, &log_dir, 8).unwrap();
            blk = store
                .file_manager()
                .append_block("data", &Page::new())
                .unwrap();

            let rm1 = manager(&store, 1);
            let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
            rm1.set_int(&buf, 4, 10).unwrap();
            rm1.commit().unwrap();

            // Transaction 2 overwrites the committed value and its dirty
            // page reaches disk, but it never commits.
            let rm2 = manager(&store, 2);
            let lsn = rm2.set_int(&buf, 4, 99).unwrap();
            store.log_manager().lock().unwrap().flush(lsn).unwrap();
            store.buffer_manager().lock().unwrap().unpin(&buf);
            store.buffer_manager().lock().unwrap().flush_all(2).unwrap();
            assert_eq!(read_int_from_disk(&store, &blk, 4), 99);
        } // crash

        let store = TinyStore::new(&data_dir, &log_dir, 8).unwrap();
        let rm = manager(&store, 50);
        rm.recover().unwrap();

        assert_eq!(read_int_from_disk(&store, &blk, 4), 10);

        // The recovery pass ends with a fresh nonquiescent checkpoint
        // listing the recovering session itself.
        let newest = LogRecordIterator::new(&store.log_manager())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(
            newest,
            LogRecord::Checkpoint {
                active_txs: vec![50]
            }
        );
    }

    #[test]
    fn test_recovery_stops_at_empty_checkpoint() {
        let td = tempdir().unwrap();
        let store = test_store(&td);
        let blk = store
            .file_manager()
            .append_block("data", &Page::new())
            .unwrap();

        // An unfinished transaction's update sits below the checkpoint. The
        // scan must stop at the empty-active-list checkpoint and leave it
        // alone, per the textbook protocol.
        let rm1 = manager(&store, 1);
        let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
        let lsn = rm1.set_int(&buf, 0, 99).unwrap();
        store.log_manager().lock().unwrap().flush(lsn).unwrap();
        store.buffer_manager().lock().unwrap().unpin(&buf);
        store.buffer_manager().lock().unwrap().flush_all(1).unwrap();

        let lsn = LogRecord::Checkpoint { active_txs: vec![] }
            .write_to_log(&store.log_manager())
            .unwrap();
        store.log_manager().lock().unwrap().flush(lsn).unwrap();

        let rm = manager(&store, 50);
        rm.recover().unwrap();

        assert_eq!(read_int_from_disk(&store, &blk, 0), 99);
    }

    #[test]
    fn test_recovery_bounded_by_checkpoint_active_list() {
        let td = tempdir().unwrap();
        let store = test_store(&td);
        let log_mgr = store.log_manager();

        let b0 = BlockId::new("data", 0);
        let b1 = BlockId::new("data", 1);
        let b2 = BlockId::new("data", 2);

        // Disk state at crash time.
        let mut page = Page::new();
        page.write(50i32, 0);
        store.file_manager().write_block(&b0, &page).unwrap();
        let mut page = Page::new();
        page.write(70i32, 0);
        page.write(110i32, 4);
        store.file_manager().write_block(&b1, &page).unwrap();
        let mut page = Page::new();
        page.write(90i32, 0);
        store.file_manager().write_block(&b2, &page).unwrap();

        // Log at crash time, oldest first: T0 never finished but started
        // before every checkpoint-active transaction; T2 committed; the
        // checkpoint saw only T1 active; T1 kept writing afterward.
        for rec in [
            LogRecord::Start { tx_num: 0 },
            LogRecord::SetInt {
                tx_num: 0,
                block: b0.clone(),
                offset: 0,
                old_val: 5,
            },
            LogRecord::Start { tx_num: 1 },
            LogRecord::SetInt {
                tx_num: 1,
                block: b1.clone(),
                offset: 0,
                old_val: 7,
            },
            LogRecord::Start { tx_num: 2 },
            LogRecord::SetInt {
                tx_num: 2,
                block: b2.clone(),
                offset: 0,
                old_val: 9,
            },
            LogRecord::Commit { tx_num: 2 },
            LogRecord::Checkpoint {
                active_txs: vec![1],
            },
            LogRecord::SetInt {
                tx_num: 1,
                block: b1.clone(),
                offset: 4,
                old_val: 11,
            },
        ] {
            let lsn = rec.write_to_log(&log_mgr).unwrap();
            log_mgr.lock().unwrap().flush(lsn).unwrap();
        }

        let rm = manager(&store, 50);
        rm.recover().unwrap();

        // T1 (active at the checkpoint, never finished) is fully undone.
        assert_eq!(read_int_from_disk(&store, &b1, 0), 7);
        assert_eq!(read_int_from_disk(&store, &b1, 4), 11);
        // T2 committed; its update must not be undone.
        assert_eq!(read_int_from_disk(&store, &b2, 0), 90);
        // The scan stopped at T1's Start record, so T0's earlier update is
        // never reached. Known simplification of the protocol.
        assert_eq!(read_int_from_disk(&store, &b0, 0), 50);
    }

    #[test]
    fn test_checkpoint_logs_current_active_set() {
        let td = tempdir().unwrap();
        let store = test_store(&td);

        let rm1 = manager(&store, 1);
        let rm2 = manager(&store, 2);
        rm2.commit().unwrap();

        rm1.checkpoint().unwrap();

        let newest = LogRecordIterator::new(&store.log_manager())
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(newest, LogRecord::Checkpoint { active_txs: vec![1] });
    }

    #[test]
    fn test_rollback_stops_at_own_start() {
        let td = tempdir().unwrap();
        let store = test_store(&td);
        let blk = store
            .file_manager()
            .append_block("data", &Page::new())
            .unwrap();

        // Transaction 1 commits 10; transaction 2 must not disturb it when
        // rolling back, and must not scan past its own Start record.
        let rm1 = manager(&store, 1);
        let buf = store.buffer_manager().lock().unwrap().pin(&blk).unwrap();
        rm1.set_int(&buf, 0, 10).unwrap();
        rm1.commit().unwrap();

        let rm2 = manager(&store, 2);
        rm2.set_int(&buf, 0, 20).unwrap();
        rm2.set_int(&buf, 0, 30).unwrap();
        rm2.rollback().unwrap();
        store.buffer_manager().lock().unwrap().unpin(&buf);

        assert_eq!(read_int_from_disk(&store, &blk, 0), 10);
    }

    #[test]
    fn test_registry_tracks_lifecycle() {
        let registry = TxRegistry::new();
        registry.register(1);
        registry.register(2);
        assert_eq!(registry.snapshot(), vec![1, 2]);

        registry.deregister(1);
        assert_eq!(registry.snapshot(), vec![2]);

        // Deregistering an unknown transaction is harmless.
        registry.deregister(42);
        assert_eq!(registry.snapshot(), vec![2]);
    }
}
