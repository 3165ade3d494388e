//! # Synchronizer
//!
//! Given a remote index and schema, a local dataset handle, a filter set,
//! and a target location, produce and execute a work plan:
//!
//! 1. Merge the requested remote schema components into the local schema.
//! 2. Walk the remote index applying filters; collect files with expected
//!    sizes.
//! 3. Map each remote symbolic path onto the target location and pre-skip
//!    files that already exist with the right size.
//! 4. Record the remaining work in an operation state file.
//! 5. Download with a fixed-size worker pool, three attempts per file with
//!    exponential backoff and a size check after each download.
//!
//! A fully successful run deletes its state file and re-indexes locally;
//! a failed or cancelled run leaves the state file for `resume`.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use core_dataset::index::{album_name, TrackInfo};
use core_dataset::locations::split_symbolic;
use core_dataset::{path_hash, Dataset, DatasetIndex, DatasetSchema};
use provider_webdav::RemoteStorage;

use crate::error::{Result, SyncError};
use crate::operation::{
    delete_state_file, FileStatus, OperationState, OperationType, StateWriter,
};

/// Attempts per file before it is marked failed.
const MAX_ATTEMPTS: u32 = 3;

/// First backoff delay; quadruples per attempt (100 ms, 400 ms, 1.6 s).
const BACKOFF_BASE_MS: u64 = 100;

/// Filter set applied to the remote index during plan construction.
#[derive(Debug, Clone, Default)]
pub struct SyncFilters {
    /// Component names to pull; `None` means all remote components.
    pub components: Option<Vec<String>>,
    /// Glob expressions over artist names.
    pub artists: Vec<String>,
    /// Glob expressions over album names.
    pub albums: Vec<String>,
    /// Restrict to tracks whose local view lacks this component.
    pub missing_component: Option<String>,
    /// Deterministic slice of the sorted artist list, `(0, 1]`.
    pub proportion: Option<f64>,
    /// Slice start as a fraction of the artist list, `[0, 1)`.
    pub offset: f64,
}

impl SyncFilters {
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

    pub fn with_missing_component(mut self, component: impl Into<String>) -> Self {
        self.missing_component = Some(component.into());
        self
    }

    pub fn with_proportion(mut self, proportion: f64, offset: f64) -> Self {
        self.proportion = Some(proportion);
        self.offset = offset;
        self
    }

    fn validate(&self) -> Result<()> {
        if let Some(proportion) = self.proportion {
            if !(proportion > 0.0 && proportion <= 1.0) {
                return Err(SyncError::InvalidFilter(format!(
                    "proportion must be in (0, 1], got {}",
                    proportion
                )));
            }
            if !(0.0..1.0).contains(&self.offset) {
                return Err(SyncError::InvalidFilter(format!(
                    "offset must be in [0, 1), got {}",
                    self.offset
                )));
            }
        }
        Ok(())
    }
}

/// Execution options for a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Worker pool size.
    pub parallel: usize,
    /// Location the downloads land in.
    pub target_location: String,
    /// Rebuild the local index before planning, for an accurate pre-skip.
    pub force_reindex: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            parallel: 1,
            target_location: core_dataset::DEFAULT_LOCATION.to_string(),
            force_reindex: false,
        }
    }
}

impl SyncOptions {
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_target_location(mut self, location: impl Into<String>) -> Self {
        self.target_location = location.into();
        self
    }

    pub fn with_force_reindex(mut self, force: bool) -> Self {
        self.force_reindex = force;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(SyncError::InvalidFilter(
                "parallel must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a sync, clone, or resume run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Files the plan selected, including pre-skipped ones.
    pub total: u64,
    pub downloaded: u64,
    /// Files skipped because they already existed with the right size.
    pub skipped: u64,
    pub failed: u64,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    /// State file left behind for `resume`; `None` after a clean run.
    pub state_file: Option<PathBuf>,
    pub cancelled: bool,
}

impl SyncReport {
    /// True iff every planned file ended `done`.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// One file the worker pool must download.
#[derive(Debug, Clone)]
struct WorkItem {
    hash: u64,
    remote_rel: String,
    expected_size: u64,
    local_abs: PathBuf,
}

struct Plan {
    items: Vec<WorkItem>,
    pre_skipped: u64,
    total: u64,
    total_bytes: u64,
}

/// Clone a remote dataset into a (typically empty) destination.
pub async fn clone_dataset(
    transport: Arc<dyn RemoteStorage>,
    dataset: &mut Dataset,
    filters: &SyncFilters,
    options: &SyncOptions,
) -> Result<SyncReport> {
    sync_with_cancel(transport, dataset, filters, options, CancellationToken::new()).await
}

/// Synchronize an existing local dataset against its remote origin.
pub async fn sync_dataset(
    transport: Arc<dyn RemoteStorage>,
    dataset: &mut Dataset,
    filters: &SyncFilters,
    options: &SyncOptions,
) -> Result<SyncReport> {
    sync_with_cancel(transport, dataset, filters, options, CancellationToken::new()).await
}

/// Synchronize with an external cancellation token. On cancellation, workers
/// finish the file in flight, flush state, and exit; outstanding items stay
/// `pending` in the state file.
#[instrument(skip_all, fields(target = %options.target_location, parallel = options.parallel))]
pub async fn sync_with_cancel(
    transport: Arc<dyn RemoteStorage>,
    dataset: &mut Dataset,
    filters: &SyncFilters,
    options: &SyncOptions,
    cancel: CancellationToken,
) -> Result<SyncReport> {
    filters.validate()?;
    options.validate()?;
    // Pre-flight: the target location must resolve before any work begins.
    dataset.registry().root_of(&options.target_location)?;

    if options.force_reindex {
        dataset.reindex()?;
    }

    info!("Fetching remote schema and index");
    let remote_schema = DatasetSchema::from_bytes(&transport.fetch_schema().await?)?;
    let remote_index = DatasetIndex::from_bytes(&transport.fetch_index().await?)?;

    // Only components whose files we were asked to download enter the local
    // schema; existing local definitions are never overwritten.
    dataset
        .schema_mut()
        .merge_remote(&remote_schema, filters.components.as_deref())?;
    dataset.save_schema()?;

    if let Some(missing) = &filters.missing_component {
        if !dataset.schema().components.contains_key(missing) {
            return Err(core_dataset::DatasetError::UnknownComponent(missing.clone()).into());
        }
    }

    let plan = build_plan(dataset, &remote_index, filters, &options.target_location)?;
    info!(
        planned = plan.items.len(),
        pre_skipped = plan.pre_skipped,
        total_bytes = plan.total_bytes,
        "Sync plan ready"
    );

    if plan.items.is_empty() {
        dataset.reindex()?;
        return Ok(SyncReport {
            total: plan.total,
            downloaded: 0,
            skipped: plan.pre_skipped,
            failed: 0,
            total_bytes: plan.total_bytes,
            downloaded_bytes: 0,
            state_file: None,
            cancelled: cancel.is_cancelled(),
        });
    }

    let state = OperationState::new(
        OperationType::Sync,
        transport.source(),
        &options.target_location,
        filters.components.clone(),
        plan.items.iter().map(|item| item.hash),
    );
    let state_path = state.create_in(&dataset.blackbird_dir())?;

    let plan_totals = Plan {
        items: Vec::new(),
        pre_skipped: plan.pre_skipped,
        total: plan.total,
        total_bytes: plan.total_bytes,
    };

    let outcome = execute_items(
        transport,
        plan.items,
        options.parallel,
        cancel.clone(),
        state_path.clone(),
        state,
    )
    .await?;

    finish_run(
        dataset,
        state_path,
        &outcome,
        cancel.is_cancelled(),
        &plan_totals,
    )
}

/// Resume a sync from its state file: files still `pending` or `failed` are
/// re-planned against a freshly fetched remote index and run through the
/// same execution loop. Files already present with the correct size
/// short-circuit to `done`.
#[instrument(skip_all, fields(state_file = %state_path.display()))]
pub async fn resume_operation(
    transport: Arc<dyn RemoteStorage>,
    dataset: &mut Dataset,
    state_path: &Path,
    options: &SyncOptions,
) -> Result<SyncReport> {
    options.validate()?;
    let mut state = OperationState::load(state_path)?;
    if state.operation_type != OperationType::Sync {
        return Err(SyncError::State {
            path: state_path.to_path_buf(),
            message: format!(
                "state file records a '{}' operation; use resume_move",
                state.operation_type
            ),
        });
    }

    let target = state.target_location.clone();
    dataset.registry().root_of(&target)?;

    let remote_index = DatasetIndex::from_bytes(&transport.fetch_index().await?)?;

    let total = state.files.len() as u64;
    let already_done = state.done_count() as u64;
    let mut items = Vec::new();
    let mut pre_skipped = 0u64;
    let mut total_bytes = 0u64;

    for hash in state.remaining() {
        let Some((symbolic, size)) = remote_index.file_info(hash) else {
            warn!(hash, "Hash from state file not found in remote index");
            state.update(
                hash,
                FileStatus::Failed("hash not found in remote index".to_string()),
            );
            continue;
        };
        let (_, remote_rel) = split_symbolic(symbolic).map_err(SyncError::from)?;
        let local_abs = dataset.resolve(&format!("{}/{}", target, remote_rel))?;
        total_bytes += size;

        if file_has_size(&local_abs, *size) {
            state.update(hash, FileStatus::Done);
            pre_skipped += 1;
            continue;
        }
        items.push(WorkItem {
            hash,
            remote_rel: remote_rel.to_string(),
            expected_size: *size,
            local_abs,
        });
    }
    items.sort_by(|a, b| a.remote_rel.cmp(&b.remote_rel));
    state.save(state_path)?;
    info!(
        remaining = items.len(),
        short_circuited = pre_skipped,
        "Resuming sync"
    );

    let totals = Plan {
        items: Vec::new(),
        pre_skipped: pre_skipped + already_done,
        total,
        total_bytes,
    };

    if items.is_empty() {
        let failed = state.failed_count() as u64;
        let state_file = if failed == 0 {
            delete_state_file(state_path)?;
            dataset.reindex()?;
            None
        } else {
            Some(state_path.to_path_buf())
        };
        return Ok(SyncReport {
            total,
            downloaded: 0,
            skipped: totals.pre_skipped,
            failed,
            total_bytes,
            downloaded_bytes: 0,
            state_file,
            cancelled: false,
        });
    }

    let cancel = CancellationToken::new();
    let outcome = execute_items(
        transport,
        items,
        options.parallel,
        cancel.clone(),
        state_path.to_path_buf(),
        state,
    )
    .await?;

    finish_run(
        dataset,
        state_path.to_path_buf(),
        &outcome,
        cancel.is_cancelled(),
        &totals,
    )
}

fn finish_run(
    dataset: &mut Dataset,
    state_path: PathBuf,
    outcome: &ExecOutcome,
    cancelled: bool,
    plan: &Plan,
) -> Result<SyncReport> {
    // The state file is authoritative: it also carries failures recorded
    // before execution (e.g. hashes missing from the remote index).
    let failed = outcome.final_state.failed_count() as u64;
    let state_file = if failed == 0 && !cancelled {
        delete_state_file(&state_path)?;
        dataset.reindex()?;
        None
    } else {
        warn!(
            path = %state_path.display(),
            remaining = outcome.final_state.remaining().len(),
            "Operation incomplete; run resume with the state file to continue"
        );
        Some(state_path)
    };

    Ok(SyncReport {
        total: plan.total,
        downloaded: outcome.downloaded,
        skipped: plan.pre_skipped,
        failed,
        total_bytes: plan.total_bytes,
        downloaded_bytes: outcome.downloaded_bytes,
        state_file,
        cancelled,
    })
}

fn build_globset(patterns: &[String], what: &str) -> Result<Option<GlobSet>> {
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

/// Swap the leading location segment of a symbolic path.
fn swap_location(symbolic: &str, new_location: &str) -> Result<String> {
    let (_, rel) = split_symbolic(symbolic).map_err(SyncError::from)?;
    Ok(format!("{}/{}", new_location, rel))
}

fn file_has_size(path: &Path, expected: u64) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() == expected)
        .unwrap_or(false)
}

fn build_plan(
    dataset: &Dataset,
    remote_index: &DatasetIndex,
    filters: &SyncFilters,
    target_location: &str,
) -> Result<Plan> {
    let artist_globs = build_globset(&filters.artists, "artist")?;
    let album_globs = build_globset(&filters.albums, "album")?;
    let requested: Option<HashSet<&str>> = filters
        .components
        .as_ref()
        .map(|list| list.iter().map(String::as_str).collect());

    // Proportion slicing over the (filtered) lexicographically sorted
    // artist list.
    let allowed_artists: Option<HashSet<&str>> = filters.proportion.map(|proportion| {
        let artists: Vec<&str> = remote_index
            .album_by_artist
            .keys()
            .map(String::as_str)
            .filter(|artist| {
                artist_globs
                    .as_ref()
                    .map_or(true, |globs| globs.is_match(artist))
            })
            .collect();
        let n = artists.len();
        let start = (filters.offset.clamp(0.0, 1.0) * n as f64).floor() as usize;
        let len = ((proportion * n as f64).round() as usize).max(1);
        artists
            .into_iter()
            .skip(start)
            .take(len)
            .collect()
    });

    let local_index = dataset.index_opt();
    let track_missing_locally = |track: &TrackInfo| -> Result<bool> {
        let Some(missing) = &filters.missing_component else {
            return Ok(true);
        };
        let Some(index) = local_index else {
            // Without a local index every track counts as missing.
            return Ok(true);
        };
        let local_key = swap_location(&track.track_path, target_location)?;
        Ok(match index.tracks.get(&local_key) {
            Some(local) => !local.has_component(missing),
            None => true,
        })
    };

    let mut items = Vec::new();
    let mut pre_skipped = 0u64;
    let mut total = 0u64;
    let mut total_bytes = 0u64;
    let mut seen = HashSet::new();

    for track in remote_index.tracks.values() {
        if let Some(globs) = &artist_globs {
            if !globs.is_match(&track.artist) {
                continue;
            }
        }
        if let Some(allowed) = &allowed_artists {
            if !allowed.contains(track.artist.as_str()) {
                continue;
            }
        }
        if let Some(globs) = &album_globs {
            if !globs.is_match(album_name(&track.album_path)) {
                continue;
            }
        }
        if !track_missing_locally(track)? {
            continue;
        }

        for (component, paths) in &track.files {
            if let Some(requested) = &requested {
                if !requested.contains(component.as_str()) {
                    continue;
                }
            }
            for symbolic in paths {
                let hash = path_hash(symbolic);
                if !seen.insert(hash) {
                    continue;
                }
                let Some(&size) = track.file_sizes.get(symbolic) else {
                    warn!(path = %symbolic, "Remote index lists a file without a size; skipping");
                    continue;
                };
                let (_, remote_rel) = split_symbolic(symbolic).map_err(SyncError::from)?;
                let local_abs =
                    dataset.resolve(&format!("{}/{}", target_location, remote_rel))?;

                total += 1;
                total_bytes += size;

                if file_has_size(&local_abs, size) {
                    debug!(path = %symbolic, "Pre-skip: already present with matching size");
                    pre_skipped += 1;
                    continue;
                }
                items.push(WorkItem {
                    hash,
                    remote_rel: remote_rel.to_string(),
                    expected_size: size,
                    local_abs,
                });
            }
        }
    }

    items.sort_by(|a, b| a.remote_rel.cmp(&b.remote_rel));
    Ok(Plan {
        items,
        pre_skipped,
        total,
        total_bytes,
    })
}

struct ExecOutcome {
    downloaded: u64,
    downloaded_bytes: u64,
    final_state: OperationState,
}

/// Run the worker pool over the plan. Within one worker, operations on a
/// single file are strictly ordered: create parents → download → size check
/// → mark done. No ordering holds across workers.
async fn execute_items(
    transport: Arc<dyn RemoteStorage>,
    items: Vec<WorkItem>,
    parallel: usize,
    cancel: CancellationToken,
    state_path: PathBuf,
    state: OperationState,
) -> Result<ExecOutcome> {
    let writer = StateWriter::spawn(state_path, state);
    let queue = Arc::new(Mutex::new(VecDeque::from(items)));
    let downloaded = Arc::new(AtomicU64::new(0));
    let downloaded_bytes = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::with_capacity(parallel);
    for worker in 0..parallel {
        let transport = Arc::clone(&transport);
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        let state_handle = writer.handle();
        let downloaded = Arc::clone(&downloaded);
        let downloaded_bytes = Arc::clone(&downloaded_bytes);
        let failed = Arc::clone(&failed);

        handles.push(tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    debug!(worker, "Cancellation requested; worker exiting");
                    break;
                }
                let item = { queue.lock().await.pop_front() };
                let Some(item) = item else { break };

                match download_with_retry(transport.as_ref(), &item, &cancel).await {
                    Ok(bytes) => {
                        downloaded.fetch_add(1, Ordering::Relaxed);
                        downloaded_bytes.fetch_add(bytes, Ordering::Relaxed);
                        state_handle.update(item.hash, FileStatus::Done);
                    }
                    Err(SyncError::Cancelled) => {
                        // The item stays pending in the state file.
                        let _ = tokio::fs::remove_file(&item.local_abs).await;
                        break;
                    }
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&item.local_abs).await;
                        warn!(file = %item.remote_rel, error = %e, "Download failed permanently");
                        failed.fetch_add(1, Ordering::Relaxed);
                        state_handle.update(item.hash, FileStatus::Failed(e.to_string()));
                    }
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    let final_state = writer.finish().await?;
    info!(
        downloaded = downloaded.load(Ordering::Relaxed),
        failed = failed.load(Ordering::Relaxed),
        "Download pool drained"
    );

    Ok(ExecOutcome {
        downloaded: downloaded.load(Ordering::Relaxed),
        downloaded_bytes: downloaded_bytes.load(Ordering::Relaxed),
        final_state,
    })
}

/// Three attempts with exponential backoff; the downloaded size must match
/// the expected size or the file is deleted and the attempt retried.
async fn download_with_retry(
    transport: &dyn RemoteStorage,
    item: &WorkItem,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut last_err = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_millis(BACKOFF_BASE_MS * 4u64.pow(attempt - 1));
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            }
        }

        match transport.download(&item.remote_rel, &item.local_abs).await {
            Ok(bytes) if bytes == item.expected_size => return Ok(bytes),
            Ok(bytes) => {
                let _ = tokio::fs::remove_file(&item.local_abs).await;
                debug!(
                    file = %item.remote_rel,
                    attempt = attempt + 1,
                    expected = item.expected_size,
                    actual = bytes,
                    "Size mismatch; retrying"
                );
                last_err = Some(SyncError::SizeMismatch {
                    path: item.remote_rel.clone(),
                    expected: item.expected_size,
                    actual: bytes,
                });
            }
            Err(e) => {
                debug!(file = %item.remote_rel, attempt = attempt + 1, error = %e, "Download attempt failed");
                last_err = Some(e.into());
            }
        }
    }

    Err(last_err.unwrap_or(SyncError::RetriesExhausted(MAX_ATTEMPTS)))
}
