use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer_manager::BufferManager;
use crate::error::StorageResult;
use crate::file_manager::FileManager;
use crate::log_manager::LogManager;
use crate::log_record::TxId;
use crate::recovery_manager::{RecoveryManager, TxRegistry};

/// Wires one file manager, one log manager, one buffer pool, and one
/// transaction registry together. Every collaborator is an explicit handle;
/// there are no process-wide singletons, so each test gets an isolated
/// instance.
pub struct TinyStore {
    file_manager: Arc<FileManager>,
    log_manager: Arc<Mutex<LogManager>>,
    buffer_manager: Arc<Mutex<BufferManager>>,
    tx_registry: Arc<TxRegistry>,
    next_tx: AtomicI64,
}

impl TinyStore {
    pub fn new(data_dir: &Path, log_dir: &Path, num_bufs: usize) -> StorageResult<Self> {
        let file_manager = Arc::new(FileManager::new(data_dir)?);
        let log_manager = Arc::new(Mutex::new(LogManager::new(log_dir)?));
        let buffer_manager = Arc::new(Mutex::new(BufferManager::new(
            num_bufs,
            file_manager.clone(),
            log_manager.clone(),
        )));

        Ok(Self {
            file_manager,
            log_manager,
            buffer_manager,
            tx_registry: Arc::new(TxRegistry::new()),
            next_tx: AtomicI64::new(0),
        })
    }

    /// Begin a transaction: allocates the next id and writes its Start
    /// record.
    pub fn begin(&self) -> StorageResult<RecoveryManager> {
        RecoveryManager::new(
            self.next_tx_num(),
            self.log_manager(),
            self.buffer_manager(),
            self.tx_registry(),
        )
    }

    pub fn next_tx_num(&self) -> TxId {
        self.next_tx.fetch_add(1, Ordering::SeqCst)
    }

    pub fn file_manager(&self) -> Arc<FileManager> {
        self.file_manager.clone()
    }

    pub fn log_manager(&self) -> Arc<Mutex<LogManager>> {
        self.log_manager.clone()
    }

    pub fn buffer_manager(&self) -> Arc<Mutex<BufferManager>> {
        self.buffer_manager.clone()
    }

    pub fn tx_registry(&self) -> Arc<TxRegistry> {
        self.tx_registry.clone()
    }
}
