//! # WebDAV Transport
//!
//! The network seam of the engine: an object-safe [`RemoteStorage`] trait and
//! a reqwest-backed WebDAV client implementing it.
//!
//! The transport is stateless with respect to dataset semantics: it moves
//! bytes at server-relative paths and knows nothing of symbolic paths,
//! schemas, or indexes. Every operation is single-attempt; retry policy
//! belongs to the synchronizer and pipeline layers.

pub mod client;
pub mod error;
pub mod profiler;
pub mod types;

pub use client::WebDavClient;
pub use error::{Result, TransportError};
pub use profiler::TransferProfiler;
pub use types::{RemoteEntry, RemoteStorage, TransportConfig};
