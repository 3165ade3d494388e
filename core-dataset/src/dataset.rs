//! # Dataset Owner
//!
//! Composes the location registry, schema, and index behind one handle.
//! Mutation flows one way: the owner updates its components, none of them
//! reaches back up.

use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::error::{DatasetError, Result};
use crate::index::{album_name, DatasetIndex, LocationStats, TrackInfo};
use crate::indexer::build_index;
use crate::locations::LocationRegistry;
use crate::schema::DatasetSchema;
use crate::BLACKBIRD_DIR;

/// Track selection for [`Dataset::find_tracks`].
#[derive(Debug, Clone, Default)]
pub struct FindFilter {
    /// Components that must be present.
    pub has: Vec<String>,
    /// Components that must be absent.
    pub missing: Vec<String>,
    /// Exact artist name.
    pub artist: Option<String>,
    /// Album name (the directory name, not the symbolic path).
    pub album: Option<String>,
}

impl FindFilter {
    pub fn with_has(mut self, components: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.has = components.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_missing(
        mut self,
        components: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.missing = components.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album = Some(album.into());
        self
    }
}

/// Aggregate numbers over the whole dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetStats {
    pub artists: u64,
    pub albums: u64,
    pub tracks: u64,
    pub files: u64,
    pub total_size: u64,
    pub by_location: Vec<(String, LocationStats)>,
}

/// One dataset rooted at a primary directory, possibly spanning several
/// storage locations.
pub struct Dataset {
    root: PathBuf,
    registry: LocationRegistry,
    schema: DatasetSchema,
    index: Option<DatasetIndex>,
}

impl Dataset {
    /// Open a dataset at `root`. Loads the registry and schema (an absent
    /// schema starts empty); loads a persisted index when present.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let registry = LocationRegistry::load(&root)?;

        let schema_path = DatasetSchema::file_path(&root);
        let schema = if schema_path.exists() {
            DatasetSchema::load(&schema_path)?
        } else {
            DatasetSchema::default()
        };

        let index_path = DatasetIndex::file_path(&root);
        let index = if index_path.exists() {
            Some(DatasetIndex::load(&index_path)?)
        } else {
            None
        };

        Ok(Self {
            root,
            registry,
            schema,
            index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `.blackbird` directory under the primary root.
    pub fn blackbird_dir(&self) -> PathBuf {
        self.root.join(BLACKBIRD_DIR)
    }

    pub fn registry(&self) -> &LocationRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &DatasetSchema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut DatasetSchema {
        &mut self.schema
    }

    /// Persist the current schema.
    pub fn save_schema(&self) -> Result<()> {
        self.schema.save(&DatasetSchema::file_path(&self.root))
    }

    /// The loaded index, or [`DatasetError::IndexMissing`].
    pub fn index(&self) -> Result<&DatasetIndex> {
        self.index.as_ref().ok_or(DatasetError::IndexMissing)
    }

    /// The loaded index, if any.
    pub fn index_opt(&self) -> Option<&DatasetIndex> {
        self.index.as_ref()
    }

    /// Replace the in-memory index and persist it.
    pub fn set_index(&mut self, index: DatasetIndex) -> Result<()> {
        index.save(&DatasetIndex::file_path(&self.root))?;
        self.index = Some(index);
        Ok(())
    }

    /// Rebuild the index from disk and persist it.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn reindex(&mut self) -> Result<&DatasetIndex> {
        let index = build_index(&self.registry, &self.schema)?;
        self.set_index(index)?;
        info!("Reindex complete");
        self.index()
    }

    /// Register a new location and persist the registry.
    pub fn add_location(&mut self, name: &str, path: impl Into<PathBuf>) -> Result<()> {
        self.registry.add(name, path)?;
        self.registry.save()
    }

    /// Remove a location. Fails with [`DatasetError::LocationInUse`] when
    /// index entries still reference it, unless `force` is set.
    pub fn remove_location(&mut self, name: &str, force: bool) -> Result<()> {
        if !force {
            if let Some(index) = &self.index {
                let prefix = format!("{}/", name);
                let in_use = index
                    .tracks
                    .values()
                    .flat_map(|t| t.file_sizes.keys())
                    .any(|path| path.starts_with(&prefix));
                if in_use {
                    return Err(DatasetError::LocationInUse(name.to_string()));
                }
            }
        }
        self.registry.remove(name)?;
        self.registry.save()
    }

    /// Resolve a symbolic path through the registry.
    pub fn resolve(&self, symbolic_path: &str) -> Result<PathBuf> {
        self.registry.resolve(symbolic_path)
    }

    /// Build a symbolic path from a location and relative path.
    pub fn symbolize(&self, location: &str, relative: &Path) -> Result<String> {
        self.registry.symbolize(location, relative)
    }

    /// Find tracks by component presence and artist/album, from the index.
    pub fn find_tracks(&self, filter: &FindFilter) -> Result<Vec<&TrackInfo>> {
        for component in filter.has.iter().chain(&filter.missing) {
            if !self.schema.components.contains_key(component) {
                return Err(DatasetError::UnknownComponent(component.clone()));
            }
        }
        let index = self.index()?;

        Ok(index
            .tracks
            .values()
            .filter(|t| filter.artist.as_deref().map_or(true, |a| t.artist == a))
            .filter(|t| {
                filter
                    .album
                    .as_deref()
                    .map_or(true, |a| album_name(&t.album_path) == a)
            })
            .filter(|t| filter.has.iter().all(|c| t.has_component(c)))
            .filter(|t| filter.missing.iter().all(|c| !t.has_component(c)))
            .collect())
    }

    /// Aggregate statistics from the index.
    pub fn stats(&self) -> Result<DatasetStats> {
        let index = self.index()?;
        Ok(DatasetStats {
            artists: index.album_by_artist.len() as u64,
            albums: index.track_by_album.len() as u64,
            tracks: index.tracks.len() as u64,
            files: index.total_files,
            total_size: index.total_size,
            by_location: index
                .stats_by_location
                .iter()
                .map(|(name, stats)| (name.clone(), *stats))
                .collect(),
        })
    }
}
