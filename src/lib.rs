pub mod block_id;
pub mod buffer;
pub mod buffer_manager;
pub mod db;
pub mod error;
pub mod file_manager;
pub mod log_manager;
pub mod log_record;
pub mod page;
pub mod recovery_manager;
