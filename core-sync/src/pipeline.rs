//! # Streaming Pipeline
//!
//! Bounded producer/consumer for processing a remote dataset without a full
//! download. Prefetch workers pull filtered items from the remote index and
//! download into a work directory; user code takes items off a bounded
//! queue (its capacity is the backpressure and the local-disk cap), submits
//! results; upload workers push results back to the server and delete both
//! local files.
//!
//! `.pipeline_state.json` in the work directory records which remote items
//! have been processed and which uploads are still pending, so a restart
//! resumes from the same point.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use core_dataset::index::album_name;
use core_dataset::locations::split_symbolic;
use core_dataset::{DatasetIndex, DatasetSchema};
use provider_webdav::RemoteStorage;

use crate::error::{Result, SyncError};

/// Attempts per network operation.
const MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; quadruples per attempt.
const BACKOFF_BASE_MS: u64 = 100;

/// Per-worker drain timeout at shutdown.
const UPLOAD_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// State file name inside the work directory.
const STATE_FILE: &str = ".pipeline_state.json";

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Component names to process; `None` means all remote components.
    pub components: Option<Vec<String>>,
    /// Glob expressions over artist names.
    pub artists: Vec<String>,
    /// Glob expressions over album names.
    pub albums: Vec<String>,
    /// Download queue capacity; caps local disk usage to roughly
    /// `queue_size × average file size`.
    pub queue_size: usize,
    pub prefetch_workers: usize,
    pub upload_workers: usize,
    pub work_dir: PathBuf,
}

impl PipelineConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            components: None,
            artists: Vec::new(),
            albums: Vec::new(),
            queue_size: 10,
            prefetch_workers: 4,
            upload_workers: 2,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_components(
        mut self,
        components: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.components = Some(components.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_artists(mut self, artists: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.artists = artists.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_albums(mut self, albums: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.albums = albums.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    pub fn with_prefetch_workers(mut self, workers: usize) -> Self {
        self.prefetch_workers = workers;
        self
    }

    pub fn with_upload_workers(mut self, workers: usize) -> Self {
        self.upload_workers = workers;
        self
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("queue_size", self.queue_size),
            ("prefetch_workers", self.prefetch_workers),
            ("upload_workers", self.upload_workers),
        ] {
            if value == 0 {
                return Err(SyncError::InvalidFilter(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// What the user gets out of [`StreamingPipeline::take`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineItem {
    /// Downloaded file inside the work directory.
    pub local_path: PathBuf,
    /// Path on the server, relative to the dataset root.
    pub remote_path: String,
    pub metadata: ItemMetadata,
}

/// Descriptive metadata attached to every pipeline item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemMetadata {
    pub artist: String,
    pub album: String,
    pub track: String,
    pub component: String,
}

/// Counters reported at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub failed_downloads: u64,
    pub failed_uploads: u64,
}

#[derive(Default)]
struct Counters {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    skipped: AtomicU64,
    failed_downloads: AtomicU64,
    failed_uploads: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed_downloads: self.failed_downloads.load(Ordering::Relaxed),
            failed_uploads: self.failed_uploads.load(Ordering::Relaxed),
        }
    }
}

/// One queued upload; also the persisted pending-upload record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct UploadTask {
    result_local: PathBuf,
    /// Remote path the result is PUT to.
    remote: String,
    /// Remote path of the source item this result belongs to.
    source_remote: String,
    source_local: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PipelineState {
    processed: Vec<String>,
    pending_uploads: Vec<UploadTask>,
}

/// State shared between the user-facing handle and the upload workers.
struct SharedState {
    inner: Mutex<PipelineState>,
    path: PathBuf,
}

impl SharedState {
    fn load_or_create(path: PathBuf) -> Self {
        let state = if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|data| serde_json::from_str(&data).map_err(|e| e.to_string()))
            {
                Ok(state) => {
                    let state: PipelineState = state;
                    info!(
                        processed = state.processed.len(),
                        pending_uploads = state.pending_uploads.len(),
                        "Resumed pipeline state"
                    );
                    state
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load pipeline state; starting fresh");
                    PipelineState::default()
                }
            }
        } else {
            PipelineState::default()
        };
        Self {
            inner: Mutex::new(state),
            path,
        }
    }

    fn save_locked(state: &PipelineState, path: &Path) {
        let result = serde_json::to_string_pretty(state)
            .map_err(std::io::Error::other)
            .and_then(|data| {
                let tmp = path.with_extension("json.tmp");
                std::fs::write(&tmp, data)?;
                std::fs::rename(&tmp, path)
            });
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist pipeline state");
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut PipelineState) -> R) -> R {
        let mut guard = self.inner.lock().expect("pipeline state lock poisoned");
        let out = f(&mut guard);
        Self::save_locked(&guard, &self.path);
        out
    }

    fn mark_processed(&self, remote: &str) {
        self.with(|state| {
            if !state.processed.iter().any(|p| p == remote) {
                state.processed.push(remote.to_string());
            }
        });
    }

    fn add_pending(&self, task: UploadTask) {
        self.with(|state| state.pending_uploads.push(task));
    }

    fn remove_pending(&self, remote: &str) {
        self.with(|state| state.pending_uploads.retain(|p| p.remote != remote));
    }

    fn processed(&self) -> HashSet<String> {
        self.inner
            .lock()
            .expect("pipeline state lock poisoned")
            .processed
            .iter()
            .cloned()
            .collect()
    }

    fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .expect("pipeline state lock poisoned")
            .pending_uploads
            .len()
    }

    /// Source items whose results are still awaiting upload; they must not
    /// be handed to the user again on restart.
    fn pending_sources(&self) -> HashSet<String> {
        self.inner
            .lock()
            .expect("pipeline state lock poisoned")
            .pending_uploads
            .iter()
            .map(|task| task.source_remote.clone())
            .collect()
    }

    /// Pending uploads whose result file still exists; the rest are dropped
    /// from the state.
    fn take_resumable_uploads(&self) -> Vec<UploadTask> {
        self.with(|state| {
            let (resumable, missing): (Vec<_>, Vec<_>) = state
                .pending_uploads
                .drain(..)
                .partition(|task| task.result_local.exists());
            for task in &missing {
                warn!(path = %task.result_local.display(), "Pending upload result missing; dropping");
            }
            state.pending_uploads = resumable.clone();
            resumable
        })
    }

    fn delete_file(&self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(error = %e, "Failed to remove pipeline state file");
            } else {
                info!("Pipeline state file removed after clean run");
            }
        }
    }
}

struct WorkEntry {
    remote_rel: String,
    expected_size: u64,
    metadata: ItemMetadata,
}

/// The running pipeline. Obtain with [`StreamingPipeline::start`], consume
/// with [`take`](Self::take) / [`submit_result`](Self::submit_result) /
/// [`skip`](Self::skip), and always end with
/// [`shutdown`](Self::shutdown).
pub struct StreamingPipeline {
    download_rx: mpsc::Receiver<PipelineItem>,
    upload_tx: Option<mpsc::UnboundedSender<UploadTask>>,
    cancel: CancellationToken,
    shared: Arc<SharedState>,
    counters: Arc<Counters>,
    prefetch_handles: Vec<JoinHandle<()>>,
    upload_handles: Vec<JoinHandle<()>>,
    next: Arc<AtomicUsize>,
    total_entries: usize,
}

impl StreamingPipeline {
    /// Fetch the remote schema and index, build the filtered work list, and
    /// start the worker pools.
    pub async fn start(
        transport: Arc<dyn RemoteStorage>,
        config: PipelineConfig,
    ) -> Result<StreamingPipeline> {
        config.validate()?;
        std::fs::create_dir_all(&config.work_dir)?;

        info!(work_dir = %config.work_dir.display(), "Starting pipeline");
        let remote_schema = DatasetSchema::from_bytes(&transport.fetch_schema().await?)?;
        let remote_index = DatasetIndex::from_bytes(&transport.fetch_index().await?)?;

        let shared = Arc::new(SharedState::load_or_create(config.work_dir.join(STATE_FILE)));
        let counters = Arc::new(Counters::default());

        let cancel = CancellationToken::new();
        let (download_tx, download_rx) = mpsc::channel::<PipelineItem>(config.queue_size);
        let (upload_tx, upload_rx) = mpsc::unbounded_channel::<UploadTask>();

        // Re-queue uploads a previous run never finished. Dropped ones (the
        // result file is gone) leave the pending set before the work list is
        // built, so their sources get re-downloaded below.
        let resumable = shared.take_resumable_uploads();
        if !resumable.is_empty() {
            info!(count = resumable.len(), "Re-queuing pending uploads");
            for task in resumable {
                let _ = upload_tx.send(task);
            }
        }

        let entries = build_entries(&remote_index, &remote_schema, &config, &shared, &counters)?;
        info!(files = entries.len(), "Files to process");

        let entries = Arc::new(entries);
        let next = Arc::new(AtomicUsize::new(0));
        let downloads_dir = config.work_dir.join("downloads");

        let mut prefetch_handles = Vec::with_capacity(config.prefetch_workers);
        for worker in 0..config.prefetch_workers {
            prefetch_handles.push(tokio::spawn(prefetch_worker(
                worker,
                Arc::clone(&transport),
                Arc::clone(&entries),
                Arc::clone(&next),
                downloads_dir.clone(),
                download_tx.clone(),
                cancel.clone(),
                Arc::clone(&counters),
            )));
        }
        drop(download_tx);

        let upload_rx = Arc::new(tokio::sync::Mutex::new(upload_rx));
        let mut upload_handles = Vec::with_capacity(config.upload_workers);
        for worker in 0..config.upload_workers {
            upload_handles.push(tokio::spawn(upload_worker(
                worker,
                Arc::clone(&transport),
                Arc::clone(&upload_rx),
                Arc::clone(&shared),
                Arc::clone(&counters),
            )));
        }

        info!(
            prefetch_workers = config.prefetch_workers,
            upload_workers = config.upload_workers,
            queue_size = config.queue_size,
            "Pipeline started"
        );

        let total_entries = entries.len();
        Ok(StreamingPipeline {
            download_rx,
            upload_tx: Some(upload_tx),
            cancel,
            shared,
            counters,
            prefetch_handles,
            upload_handles,
            next,
            total_entries,
        })
    }

    /// Take up to `count` downloaded items. Blocks until `count` items are
    /// ready or the stream is exhausted; an empty vec signals the end.
    pub async fn take(&mut self, count: usize) -> Vec<PipelineItem> {
        let mut items = Vec::new();
        while items.len() < count {
            match self.download_rx.recv().await {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items
    }

    /// Queue a processing result for background upload, without blocking.
    /// After a successful upload both the item's local file and the result
    /// file are deleted.
    pub fn submit_result(
        &self,
        item: &PipelineItem,
        result_path: impl Into<PathBuf>,
        remote_name: &str,
    ) -> Result<()> {
        let result_local = result_path.into();
        if !result_local.exists() {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("result file not found: {}", result_local.display()),
            )));
        }

        let remote = match item.remote_path.rsplit_once('/') {
            Some((dir, _)) => format!("{}/{}", dir, remote_name),
            None => remote_name.to_string(),
        };

        let task = UploadTask {
            result_local,
            remote,
            source_remote: item.remote_path.clone(),
            source_local: item.local_path.clone(),
        };
        self.shared.add_pending(task.clone());

        if let Some(tx) = &self.upload_tx {
            if tx.send(task).is_err() {
                warn!("Upload workers already stopped; result left as pending");
            }
        }
        Ok(())
    }

    /// Skip an item: delete the local copy, mark it processed, upload
    /// nothing.
    pub fn skip(&self, item: &PipelineItem) {
        safe_delete(&item.local_path);
        self.shared.mark_processed(&item.remote_path);
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters.
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Stop taking new downloads, drain in-flight uploads (30 s per
    /// worker), persist state, and return the final counters. The state
    /// file is removed when every item was processed and uploaded cleanly.
    pub async fn shutdown(mut self) -> Result<PipelineStats> {
        info!("Shutting down pipeline");
        self.cancel.cancel();
        for handle in self.prefetch_handles.drain(..) {
            let _ = handle.await;
        }

        // Downloaded items the user never took: delete the local copies;
        // they are not in `processed`, so a restart re-fetches them.
        let mut unconsumed = 0usize;
        while let Ok(item) = self.download_rx.try_recv() {
            safe_delete(&item.local_path);
            unconsumed += 1;
        }

        // Closing the channel lets upload workers exit once drained.
        drop(self.upload_tx.take());
        for handle in self.upload_handles.drain(..) {
            let mut handle = handle;
            if tokio::time::timeout(UPLOAD_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Upload worker did not drain in time; aborting it");
                handle.abort();
            }
        }

        let stats = self.counters.snapshot();
        let exhausted =
            self.next.load(Ordering::SeqCst) >= self.total_entries && unconsumed == 0;
        if stats.failed_downloads == 0
            && stats.failed_uploads == 0
            && self.shared.pending_count() == 0
            && exhausted
        {
            self.shared.delete_file();
        } else {
            info!("Pipeline state kept for resume");
        }

        info!(
            downloaded = stats.downloaded,
            uploaded = stats.uploaded,
            skipped = stats.skipped,
            failed_downloads = stats.failed_downloads,
            failed_uploads = stats.failed_uploads,
            "Pipeline stopped"
        );
        Ok(stats)
    }
}

fn build_globs(patterns: &[String], what: &str) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| {
            SyncError::InvalidFilter(format!("bad {} glob '{}': {}", what, pattern, e))
        })?);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| SyncError::InvalidFilter(e.to_string()))
}

fn build_entries(
    remote_index: &DatasetIndex,
    remote_schema: &DatasetSchema,
    config: &PipelineConfig,
    shared: &SharedState,
    counters: &Counters,
) -> Result<Vec<WorkEntry>> {
    let artist_globs = build_globs(&config.artists, "artist")?;
    let album_globs = build_globs(&config.albums, "album")?;

    let available: HashSet<&str> = remote_schema
        .components
        .keys()
        .map(String::as_str)
        .collect();
    let target_components: HashSet<&str> = match &config.components {
        Some(requested) => {
            let (known, unknown): (Vec<&str>, Vec<&str>) = requested
                .iter()
                .map(String::as_str)
                .partition(|c| available.contains(c));
            if !unknown.is_empty() {
                warn!(components = ?unknown, "Unknown components ignored");
            }
            known.into_iter().collect()
        }
        None => available,
    };

    let mut excluded = shared.processed();
    excluded.extend(shared.pending_sources());
    let mut entries = Vec::new();

    for track in remote_index.tracks.values() {
        if let Some(globs) = &artist_globs {
            if !globs.is_match(&track.artist) {
                continue;
            }
        }
        if let Some(globs) = &album_globs {
            if !globs.is_match(album_name(&track.album_path)) {
                continue;
            }
        }

        for (component, paths) in &track.files {
            if !target_components.contains(component.as_str()) {
                continue;
            }
            for symbolic in paths {
                let (_, remote_rel) = split_symbolic(symbolic).map_err(SyncError::from)?;
                if excluded.contains(remote_rel) {
                    counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let Some(&expected_size) = track.file_sizes.get(symbolic) else {
                    warn!(path = %symbolic, "Remote index lists a file without a size; skipping");
                    continue;
                };
                entries.push(WorkEntry {
                    remote_rel: remote_rel.to_string(),
                    expected_size,
                    metadata: ItemMetadata {
                        artist: track.artist.clone(),
                        album: album_name(&track.album_path).to_string(),
                        track: track.base_name.clone(),
                        component: component.clone(),
                    },
                });
            }
        }
    }

    entries.sort_by(|a, b| a.remote_rel.cmp(&b.remote_rel));
    Ok(entries)
}

#[allow(clippy::too_many_arguments)]
async fn prefetch_worker(
    worker: usize,
    transport: Arc<dyn RemoteStorage>,
    entries: Arc<Vec<WorkEntry>>,
    next: Arc<AtomicUsize>,
    downloads_dir: PathBuf,
    tx: mpsc::Sender<PipelineItem>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        if cancel.is_cancelled() {
            debug!(worker, "Prefetch worker cancelled");
            return;
        }
        let idx = next.fetch_add(1, Ordering::SeqCst);
        let Some(entry) = entries.get(idx) else {
            debug!(worker, "No more files for this worker");
            return;
        };

        let local_path = downloads_dir.join(&entry.remote_rel);
        match download_with_retry(transport.as_ref(), entry, &local_path, &cancel).await {
            Ok(()) => {
                let item = PipelineItem {
                    local_path,
                    remote_path: entry.remote_rel.clone(),
                    metadata: entry.metadata.clone(),
                };
                // Blocks when the queue is full: that is the backpressure.
                tokio::select! {
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                        counters.downloaded.fetch_add(1, Ordering::Relaxed);
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            Err(SyncError::Cancelled) => return,
            Err(e) => {
                error!(file = %entry.remote_rel, error = %e, "Download failed after retries");
                counters.failed_downloads.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn upload_worker(
    worker: usize,
    transport: Arc<dyn RemoteStorage>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<UploadTask>>>,
    shared: Arc<SharedState>,
    counters: Arc<Counters>,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            debug!(worker, "Upload queue closed; worker exiting");
            return;
        };

        match upload_with_retry(transport.as_ref(), &task).await {
            Ok(()) => {
                safe_delete(&task.result_local);
                safe_delete(&task.source_local);
                shared.mark_processed(&task.source_remote);
                shared.remove_pending(&task.remote);
                counters.uploaded.fetch_add(1, Ordering::Relaxed);
                debug!(remote = %task.remote, "Result uploaded");
            }
            Err(e) => {
                error!(remote = %task.remote, error = %e, "Upload failed after retries");
                counters.failed_uploads.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

async fn download_with_retry(
    transport: &dyn RemoteStorage,
    entry: &WorkEntry,
    local_path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_millis(BACKOFF_BASE_MS * 4u64.pow(attempt - 1));
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            }
        }
        match transport.download(&entry.remote_rel, local_path).await {
            Ok(bytes) if bytes == entry.expected_size => return Ok(()),
            Ok(bytes) => {
                let _ = tokio::fs::remove_file(local_path).await;
                last_err = Some(SyncError::SizeMismatch {
                    path: entry.remote_rel.clone(),
                    expected: entry.expected_size,
                    actual: bytes,
                });
            }
            Err(e) => last_err = Some(e.into()),
        }
    }
    Err(last_err.unwrap_or(SyncError::RetriesExhausted(MAX_ATTEMPTS)))
}

async fn upload_with_retry(transport: &dyn RemoteStorage, task: &UploadTask) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_millis(BACKOFF_BASE_MS * 4u64.pow(attempt - 1));
            tokio::time::sleep(backoff).await;
        }
        match transport.upload(&task.result_local, &task.remote).await {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e.into()),
        }
    }
    Err(last_err.unwrap_or(SyncError::RetriesExhausted(MAX_ATTEMPTS)))
}

fn safe_delete(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to delete file");
        }
    }
}
