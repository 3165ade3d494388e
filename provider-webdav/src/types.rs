//! Remote storage trait and transport configuration.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One entry from a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Path relative to the dataset root on the server.
    pub path: String,
    /// File or directory name (last path segment).
    pub name: String,
    pub is_dir: bool,
    /// Size in bytes; absent for collections.
    pub size: Option<u64>,
}

/// A remote dataset origin.
///
/// Implementations are shared across worker tasks and must provide their own
/// connection pooling for concurrent downloads. All paths are relative to the
/// dataset root on the server; a remote is a single logical location, so no
/// location prefix ever appears on the wire.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Stable identifier of this origin (the dataset root URL for WebDAV),
    /// recorded in operation state files so resume knows where to pull from.
    fn source(&self) -> String {
        "remote".to_string()
    }

    /// Bytes of the remote `.blackbird/schema.json`.
    async fn fetch_schema(&self) -> Result<Bytes>;

    /// Bytes of the canonical remote index file. Always fetched in full at
    /// the start of a sync.
    async fn fetch_index(&self) -> Result<Bytes>;

    /// Directory entries of a remote directory (PROPFIND depth 1). Rarely
    /// needed; the remote index is normally authoritative.
    async fn list(&self, remote_dir: &str) -> Result<Vec<RemoteEntry>>;

    /// Download one file to a local absolute path, returning the bytes
    /// written. Single attempt.
    async fn download(&self, remote_rel: &str, local_abs: &Path) -> Result<u64>;

    /// Upload a local file, creating missing remote parent collections.
    async fn upload(&self, local_abs: &Path, remote_rel: &str) -> Result<()>;

    /// Reachability probe. A 404 on the probe target still counts as
    /// reachable; any other error status does not.
    async fn check(&self) -> Result<()>;
}

/// Transport configuration recognized by [`WebDavClient::connect`].
///
/// [`WebDavClient::connect`]: crate::client::WebDavClient::connect
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Sizes the connection pool; caps simultaneous TCP/TLS connections.
    pub parallel_connections: usize,
    /// Negotiate HTTP/2 with prior knowledge.
    pub use_http2: bool,
    /// Basic-auth credentials, passed through to every request.
    pub basic_auth: Option<(String, String)>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attach a timing recorder to every operation.
    pub profile: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            parallel_connections: 4,
            use_http2: false,
            basic_auth: None,
            timeout: Duration::from_secs(60),
            profile: false,
        }
    }
}

impl TransportConfig {
    pub fn with_parallel_connections(mut self, n: usize) -> Self {
        self.parallel_connections = n;
        self
    }

    pub fn with_http2(mut self, enabled: bool) -> Self {
        self.use_http2 = enabled;
        self
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), pass.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_profile(mut self, enabled: bool) -> Self {
        self.profile = enabled;
        self
    }
}
