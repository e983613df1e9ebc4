use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::block_id::BlockId;
use crate::buffer_manager::BufferManager;
use crate::error::{StorageError, StorageResult};
use crate::log_manager::{LogManager, LogSnapshot, Lsn};

/// Transaction identifier. Issued by the transaction layer; this crate only
/// keys on it.
pub type TxId = i64;

/// One write-ahead log record. The design is undo-only: update records carry
/// the pre-image (the value that was there before the change), never the new
/// value, and recovery never redoes anything because every committed change
/// is already on disk by the time the commit record is durable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Start {
        tx_num: TxId,
    },
    Commit {
        tx_num: TxId,
    },
    Rollback {
        tx_num: TxId,
    },
    SetInt {
        tx_num: TxId,
        block: BlockId,
        offset: u16,
        old_val: i32,
    },
    SetString {
        tx_num: TxId,
        block: BlockId,
        offset: u16,
        old_val: String,
    },
    /// Nonquiescent checkpoint: the set of transactions active at the
    /// instant the record was written. No transaction of its own.
    Checkpoint {
        active_txs: Vec<TxId>,
    },
}

impl LogRecord {
    /// The transaction this record belongs to; `None` for checkpoints.
    pub fn tx_num(&self) -> Option<TxId> {
        match self {
            LogRecord::Start { tx_num }
            | LogRecord::Commit { tx_num }
            | LogRecord::Rollback { tx_num }
            | LogRecord::SetInt { tx_num, .. }
            | LogRecord::SetString { tx_num, .. } => Some(*tx_num),
            LogRecord::Checkpoint { .. } => None,
        }
    }

    /// Serialize and append this record, returning its assigned LSN. The
    /// record is durable only after the log is flushed up to that LSN.
    pub fn write_to_log(&self, log_mgr: &Mutex<LogManager>) -> StorageResult<Lsn> {
        let encoded = bincode::serialize(self)?;
        log_mgr.lock().unwrap().append(&encoded)
    }

    /// Reverse this record's change on behalf of transaction `tx_num`,
    /// restoring the logged pre-image through the buffer pool. A no-op for
    /// everything except updates.
    pub fn undo(&self, tx_num: TxId, buf_mgr: &Mutex<BufferManager>) -> StorageResult<()> {
        match self {
            LogRecord::SetInt {
                block,
                offset,
                old_val,
                ..
            } => {
                log::debug!("undo: restoring int {} at {}+{}", old_val, block, offset);
                let buf = buf_mgr.lock().unwrap().pin(block)?;
                {
                    let mut b = buf.write().unwrap();
                    b.page.write(*old_val, *offset as usize);
                    b.set_modified(tx_num, None);
                }
                buf_mgr.lock().unwrap().unpin(&buf);
                Ok(())
            }
            LogRecord::SetString {
                block,
                offset,
                old_val,
                ..
            } => {
                log::debug!(
                    "undo: restoring string {:?} at {}+{}",
                    old_val,
                    block,
                    offset
                );
                let buf = buf_mgr.lock().unwrap().pin(block)?;
                {
                    let mut b = buf.write().unwrap();
                    b.page.write(old_val.as_str(), *offset as usize);
                    b.set_modified(tx_num, None);
                }
                buf_mgr.lock().unwrap().unpin(&buf);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Newest-first traversal of the durable log as typed records.
///
/// The ordering contract comes from `LogSnapshot`; this just decodes. A
/// record that fails to decode surfaces as `MalformedLogRecord` and aborts
/// the scan, since the log is written only by this crate.
pub struct LogRecordIterator {
    snapshot: LogSnapshot,
}

impl LogRecordIterator {
    pub fn new(log_mgr: &Mutex<LogManager>) -> StorageResult<Self> {
        let snapshot = log_mgr.lock().unwrap().snapshot()?;
        Ok(Self { snapshot })
    }
}

impl Iterator for LogRecordIterator {
    type Item = StorageResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.snapshot.next()? {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };

        Some(
            bincode::deserialize(&raw).map_err(|e| StorageError::MalformedLogRecord {
                reason: e.to_string(),
            }),
        )
    }
}
