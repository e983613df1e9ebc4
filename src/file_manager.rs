use core::fmt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::block_id::BlockId;
use crate::error::StorageResult;
use crate::page::{Page, PAGE_SIZE};

/// Block-addressed random access storage: one OS file per logical file, all
/// under a single root directory. Writes are durable when the call returns.
pub struct FileManager {
    files: RwLock<HashMap<String, Arc<Mutex<File>>>>,
    root_directory: PathBuf,
}

impl fmt::Debug for FileManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileManager")
            .field("root_directory", &self.root_directory)
            .finish()
    }
}

impl FileManager {
    pub fn new(root_directory: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root_directory)?;

        Ok(Self {
            files: RwLock::new(HashMap::new()),
            root_directory: root_directory.to_path_buf(),
        })
    }

    fn file_position(blk: &BlockId) -> u64 {
        blk.num() * PAGE_SIZE as u64
    }

    /// Read the given block into `page`. A block past the end of the file
    /// reads as all zeroes.
    pub fn get_block(&self, blk: &BlockId, page: &mut Page) -> StorageResult<()> {
        let seek_position = Self::file_position(blk);
        let file = self.get_or_create_file(blk.file_id())?;
        let mut file = file.lock().unwrap();

        if seek_position + PAGE_SIZE as u64 <= file.metadata()?.len() {
            file.seek(SeekFrom::Start(seek_position))?;
            file.read_exact(page.raw_mut())?;
        } else {
            // Never been written; don't leak whatever the page last held.
            *page = Page::new();
        }

        Ok(())
    }

    /// Write `page` over an existing block and force it to disk.
    pub fn write_block(&self, blk: &BlockId, page: &Page) -> StorageResult<()> {
        let seek_position = Self::file_position(blk);
        let file = self.get_or_create_file(blk.file_id())?;
        let mut file = file.lock().unwrap();

        file.seek(SeekFrom::Start(seek_position))?;
        file.write_all(page.raw())?;
        file.sync_data()?;

        Ok(())
    }

    /// Append `page` as a new block at the end of the file, returning the
    /// identity of the block it landed in.
    pub fn append_block(&self, file_id: &str, page: &Page) -> StorageResult<BlockId> {
        let file = self.get_or_create_file(file_id)?;
        let mut file = file.lock().unwrap();

        let block_start = file.seek(SeekFrom::End(0))?;
        let block_number = block_start / PAGE_SIZE as u64;
        file.write_all(page.raw())?;
        file.sync_all()?;

        Ok(BlockId::new(file_id, block_number))
    }

    /// The number of blocks currently in a file.
    pub fn length(&self, file_id: &str) -> StorageResult<u64> {
        let file = self.get_or_create_file(file_id)?;
        let file = file.lock().unwrap();

        Ok(file.metadata()?.len() / PAGE_SIZE as u64)
    }

    fn get_or_create_file(&self, file_id: &str) -> StorageResult<Arc<Mutex<File>>> {
        {
            let files = self.files.read().unwrap();
            if let Some(f) = files.get(file_id) {
                return Ok(f.clone());
            }
        }

        let mut files = self.files.write().unwrap();
        if let Some(f) = files.get(file_id) {
            // Raced with another opener between the two locks.
            return Ok(f.clone());
        }

        let file_path = self.root_directory.join(file_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&file_path)?;

        let entry = Arc::new(Mutex::new(file));
        files.insert(file_id.to_string(), entry.clone());
        Ok(entry)
    }
}
