//! Context-window compaction: usage monitoring ([`CompactionMonitor`]) and
//! durable summary boundaries ([`CompactionHandler`]) — spec §4.3/§4.4.

pub mod config;
pub mod handler;
pub mod monitor;

pub use config::CompactionConfig;
pub use handler::{CompactionHandler, FileDiff, RejectReason, MAX_EDITED_FILES, MAX_FILE_CONTENT_SIZE};
pub use monitor::{CheckInputs, CompactionMonitor, ContextUsage, PreSendCheck, FORCE_BUFFER_PCT};
