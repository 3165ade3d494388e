//! # Blackbird
//!
//! Manager for large, component-structured music datasets distributed across
//! multiple storage locations and synchronized from WebDAV origins.
//!
//! Each logical *track* is a bag of *component* files (instrumental audio,
//! vocals, MIR analysis, lyrics, captions, stems). The dataset may span
//! several disks but presents a single logical view addressed by symbolic
//! paths of the form `LocationName/Artist/Album[/CD]/file`.
//!
//! This crate is a facade over the workspace:
//!
//! - `core-dataset` — location registry, component schema, persistent
//!   index, indexer, and the [`Dataset`] owner type
//! - `provider-webdav` — the WebDAV transport ([`RemoteStorage`] trait and
//!   reqwest-backed client)
//! - `core-sync` — selective parallel synchronization with resume, the
//!   between-location mover, and the bounded streaming pipeline
//!
//! ## Example
//!
//! ```ignore
//! use blackbird::{Dataset, SyncFilters, SyncOptions, TransportConfig, WebDavClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(WebDavClient::connect(
//!     "https://storage.example.com/dataset",
//!     TransportConfig::default().with_parallel_connections(8),
//! )?);
//!
//! let mut dataset = Dataset::open("/data/music")?;
//! let filters = SyncFilters::default()
//!     .with_components(["instrumental", "mir"])
//!     .with_artists(["Artist_A*"]);
//!
//! let report = blackbird::clone_dataset(
//!     transport,
//!     &mut dataset,
//!     &filters,
//!     &SyncOptions::default().with_parallel(8),
//! )
//! .await?;
//! println!("downloaded {} files", report.downloaded);
//! # Ok(())
//! # }
//! ```

pub mod logging;

pub use core_dataset::{
    ComponentDef, Dataset, DatasetError, DatasetIndex, DatasetSchema, DatasetStats, FindFilter,
    LocationRegistry, LocationStats, TrackInfo, path_hash,
};
pub use core_sync::{
    clone_dataset, move_data, resume_move, resume_operation, sync_dataset, FileStatus,
    MoveSelection, MoveStats, OperationState, OperationType, PipelineConfig, PipelineItem,
    StreamingPipeline, SyncError, SyncFilters, SyncOptions, SyncReport,
};
pub use provider_webdav::{
    RemoteEntry, RemoteStorage, TransportConfig, TransportError, WebDavClient,
};

pub use logging::{init_logging, LogFormat, LoggingConfig, LoggingError};
