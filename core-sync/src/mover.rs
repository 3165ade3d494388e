//! # Mover
//!
//! Physical relocation of files between storage locations. Selection is
//! either an explicit list of folders or a size budget; a size budget moves
//! whole albums (an album is never split). Operation state gives crash
//! resume; a completed move re-indexes the dataset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use core_dataset::locations::split_symbolic;
use core_dataset::Dataset;

use crate::error::{Result, SyncError};
use crate::operation::{delete_state_file, FileStatus, OperationState, OperationType};

/// What to move.
#[derive(Debug, Clone)]
pub enum MoveSelection {
    /// Specific folders: symbolic album or artist paths (a missing location
    /// prefix is taken relative to the source location).
    Folders(Vec<String>),
    /// Move whole albums, sorted by path, until this many gigabytes moved.
    SizeBudget(f64),
}

/// Outcome of a move operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveStats {
    pub moved: u64,
    pub failed: u64,
    /// Only populated by dry runs.
    pub skipped: u64,
    pub bytes_moved: u64,
    /// State file left behind when files failed; `None` after a clean run.
    pub state_file: Option<PathBuf>,
}

/// Move files from `source_location` to `target_location`.
#[instrument(skip(dataset, selection), fields(source = source_location, target = target_location))]
pub fn move_data(
    dataset: &mut Dataset,
    source_location: &str,
    target_location: &str,
    selection: &MoveSelection,
    dry_run: bool,
) -> Result<MoveStats> {
    if source_location == target_location {
        return Err(SyncError::InvalidMove(
            "source and target locations cannot be the same".to_string(),
        ));
    }
    dataset.registry().root_of(source_location)?;
    dataset.registry().root_of(target_location)?;

    let candidates = select_candidates(dataset, source_location, selection)?;
    if candidates.is_empty() {
        warn!("No files match the move criteria; nothing to do");
        return Ok(MoveStats {
            moved: 0,
            failed: 0,
            skipped: 0,
            bytes_moved: 0,
            state_file: None,
        });
    }
    info!(files = candidates.len(), "Move candidates selected");

    if dry_run {
        for (_, symbolic, size) in &candidates {
            let (_, rel) = split_symbolic(symbolic).map_err(SyncError::from)?;
            info!(
                from = %symbolic,
                to = %format!("{}/{}", target_location, rel),
                size,
                "Dry run: would move"
            );
        }
        return Ok(MoveStats {
            moved: 0,
            failed: 0,
            skipped: candidates.len() as u64,
            bytes_moved: 0,
            state_file: None,
        });
    }

    let state = OperationState::new(
        OperationType::Move,
        source_location,
        target_location,
        None,
        candidates.iter().map(|(hash, _, _)| *hash),
    );
    let state_path = state.create_in(&dataset.blackbird_dir())?;

    run_moves(dataset, state, state_path, candidates, target_location)
}

/// Resume a move from its state file. Files still `pending` or `failed`
/// are looked up through the local index and moved again; a file whose
/// source is gone but whose target has the right size counts as done.
#[instrument(skip(dataset), fields(state_file = %state_path.display()))]
pub fn resume_move(dataset: &mut Dataset, state_path: &Path) -> Result<MoveStats> {
    let mut state = OperationState::load(state_path)?;
    if state.operation_type != OperationType::Move {
        return Err(SyncError::State {
            path: state_path.to_path_buf(),
            message: format!(
                "state file records a '{}' operation; use resume_operation",
                state.operation_type
            ),
        });
    }
    let target_location = state.target_location.clone();
    dataset.registry().root_of(&target_location)?;

    let mut candidates = Vec::new();
    {
        let index = dataset.index()?;
        for hash in state.remaining() {
            match index.file_info(hash) {
                Some((symbolic, size)) => {
                    candidates.push((hash, symbolic.clone(), *size));
                }
                None => {
                    warn!(hash, "Hash from state file not found in the index");
                    state.update(
                        hash,
                        FileStatus::Failed("hash not found in index".to_string()),
                    );
                }
            }
        }
    }
    candidates.sort_by(|a, b| a.1.cmp(&b.1));
    state.save(state_path)?;
    info!(remaining = candidates.len(), "Resuming move");

    run_moves(
        dataset,
        state,
        state_path.to_path_buf(),
        candidates,
        &target_location,
    )
}

fn run_moves(
    dataset: &mut Dataset,
    mut state: OperationState,
    state_path: PathBuf,
    candidates: Vec<(u64, String, u64)>,
    target_location: &str,
) -> Result<MoveStats> {
    let mut moved = 0u64;
    let mut failed = 0u64;
    let mut bytes_moved = 0u64;

    for (hash, symbolic, size) in candidates {
        match move_one(dataset, &symbolic, target_location, size) {
            Ok(()) => {
                debug!(file = %symbolic, "Moved");
                moved += 1;
                bytes_moved += size;
                state.update(hash, FileStatus::Done);
            }
            Err(e) => {
                warn!(file = %symbolic, error = %e, "Move failed");
                failed += 1;
                state.update(hash, FileStatus::Failed(e.to_string()));
            }
        }
        state.save(&state_path)?;
    }

    let total_failed = state.failed_count() as u64;
    let state_file = if total_failed == 0 {
        delete_state_file(&state_path)?;
        dataset.reindex()?;
        None
    } else {
        warn!(
            path = %state_path.display(),
            failed = total_failed,
            "Move incomplete; state file kept for resume"
        );
        Some(state_path)
    };

    Ok(MoveStats {
        moved,
        failed: total_failed,
        skipped: 0,
        bytes_moved,
        state_file,
    })
}

/// Move one file: swap the location prefix, resolve both sides, rename, and
/// fall back to copy-then-delete across filesystems. A source that is
/// already gone while the target has the right size was moved before a
/// crash and counts as done.
fn move_one(dataset: &Dataset, source_symbolic: &str, target_location: &str, size: u64) -> Result<()> {
    let (_, rel) = split_symbolic(source_symbolic).map_err(SyncError::from)?;
    let src = dataset.resolve(source_symbolic)?;
    let dst = dataset.resolve(&format!("{}/{}", target_location, rel))?;

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(&src, &dst) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            if !src.exists() {
                if file_has_size(&dst, size) {
                    debug!(file = %source_symbolic, "Target already in place; source gone");
                    return Ok(());
                }
                return Err(rename_err.into());
            }
            // Different filesystem: copy then delete.
            fs::copy(&src, &dst)?;
            fs::remove_file(&src)?;
            Ok(())
        }
    }
}

fn file_has_size(path: &Path, expected: u64) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() == expected)
        .unwrap_or(false)
}

/// Collect `(hash, symbolic path, size)` triples from the index according
/// to the selection.
fn select_candidates(
    dataset: &Dataset,
    source_location: &str,
    selection: &MoveSelection,
) -> Result<Vec<(u64, String, u64)>> {
    let index = dataset.index()?;
    let prefix = format!("{}/", source_location);

    let mut in_source: Vec<(u64, String, u64)> = index
        .file_info_by_hash
        .iter()
        .filter(|(_, (symbolic, _))| symbolic.starts_with(&prefix))
        .map(|(&hash, (symbolic, size))| (hash, symbolic.clone(), *size))
        .collect();
    in_source.sort_by(|a, b| a.1.cmp(&b.1));

    match selection {
        MoveSelection::Folders(folders) => {
            let normalized: Vec<String> = folders
                .iter()
                .map(|folder| {
                    folder
                        .strip_prefix(&prefix)
                        .unwrap_or(folder)
                        .trim_matches('/')
                        .to_string()
                })
                .collect();

            Ok(in_source
                .into_iter()
                .filter(|(_, symbolic, _)| {
                    let rel = &symbolic[prefix.len()..];
                    normalized.iter().any(|folder| {
                        rel == folder || rel.starts_with(&format!("{}/", folder))
                    })
                })
                .collect())
        }
        MoveSelection::SizeBudget(gb) => {
            if *gb <= 0.0 {
                return Err(SyncError::InvalidMove(format!(
                    "size budget must be positive, got {} GB",
                    gb
                )));
            }
            let limit = (gb * (1u64 << 30) as f64) as u64;

            // Group by album so an album is never split.
            let mut by_album: BTreeMap<String, Vec<(u64, String, u64)>> = BTreeMap::new();
            for entry in in_source {
                let rel = &entry.1[prefix.len()..];
                let album: String = rel.split('/').take(2).collect::<Vec<_>>().join("/");
                by_album.entry(album).or_default().push(entry);
            }

            let mut selected = Vec::new();
            let mut selected_bytes = 0u64;
            for (album, files) in by_album {
                if selected_bytes >= limit {
                    break;
                }
                let album_bytes: u64 = files.iter().map(|(_, _, size)| size).sum();
                debug!(album = %album, bytes = album_bytes, "Selecting whole album");
                selected_bytes += album_bytes;
                selected.extend(files);
            }
            Ok(selected)
        }
    }
}
