//! # Synchronization & Data Movement
//!
//! Orchestrates everything that moves dataset files around:
//!
//! - **Operation State** (`operation`): per-operation JSON state file mapping
//!   file hash → pending/done/failed, with a single batching writer task
//! - **Synchronizer** (`sync`): given a remote index and filters, builds an
//!   ordered work set and downloads it with a fixed-size worker pool, retry,
//!   resume, and cooperative cancellation
//! - **Mover** (`mover`): physical relocation of files between locations,
//!   reusing operation state for resume
//! - **Streaming Pipeline** (`pipeline`): bounded producer/consumer that
//!   downloads filtered items, yields them to user code, uploads results,
//!   and deletes local copies
//!
//! Per-file errors never crash an operation; they are recorded in the state
//! file. Pre-flight errors abort before any download begins.

pub mod error;
pub mod mover;
pub mod operation;
pub mod pipeline;
pub mod sync;

pub use error::{Result, SyncError};
pub use mover::{move_data, resume_move, MoveSelection, MoveStats};
pub use operation::{
    find_latest_state_file, FileStatus, OperationState, OperationType, StateWriter,
    StateWriterHandle,
};
pub use pipeline::{
    ItemMetadata, PipelineConfig, PipelineItem, PipelineStats, StreamingPipeline,
};
pub use sync::{
    clone_dataset, resume_operation, sync_dataset, sync_with_cancel, SyncFilters, SyncOptions,
    SyncReport,
};
