//! # Dataset Index
//!
//! In-memory, disk-persisted catalog of tracks and component files keyed by
//! symbolic path. All searches run in memory; persistence is a versioned
//! binary file (`BBIX` magic + format version + bincode body) with fast
//! load.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DatasetError, Result};
use crate::hash::path_hash;
use crate::locations::split_symbolic;
use crate::{BLACKBIRD_DIR, INDEX_FILE};

/// Magic bytes at the start of a persisted index file.
const INDEX_MAGIC: &[u8; 4] = b"BBIX";

/// Current binary format version.
const INDEX_FORMAT_VERSION: u16 = 1;

/// One logical track: artist/album[/CD]/base-name plus its component files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Symbolic track path: `Location/Artist/Album[/CD]/BaseName`.
    pub track_path: String,
    pub artist: String,
    /// Symbolic album path: `Location/Artist/Album`.
    pub album_path: String,
    /// CD directory name (`CD<digits>`) when present.
    pub cd_number: Option<String>,
    /// Track name with the matched component suffix stripped.
    pub base_name: String,
    /// Component name → symbolic file paths. `multiple:false` components
    /// hold exactly one entry.
    pub files: BTreeMap<String, Vec<String>>,
    /// Symbolic file path → size in bytes.
    pub file_sizes: BTreeMap<String, u64>,
}

impl TrackInfo {
    /// Whether this track has at least one file of the given component.
    pub fn has_component(&self, component: &str) -> bool {
        self.files
            .get(component)
            .map(|paths| !paths.is_empty())
            .unwrap_or(false)
    }
}

/// Per-location aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationStats {
    pub files: u64,
    pub size: u64,
    pub tracks: u64,
    pub albums: u64,
    pub artists: u64,
}

/// The catalog of one dataset across all of its locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetIndex {
    pub version: String,
    pub last_updated: DateTime<Utc>,
    /// Symbolic track path → track.
    pub tracks: BTreeMap<String, TrackInfo>,
    /// Symbolic album path → set of symbolic track paths.
    pub track_by_album: BTreeMap<String, BTreeSet<String>>,
    /// Artist name → set of symbolic album paths.
    pub album_by_artist: BTreeMap<String, BTreeSet<String>>,
    pub total_size: u64,
    pub total_files: u64,
    pub stats_by_location: BTreeMap<String, LocationStats>,
    /// `path_hash(symbolic file path)` → (symbolic file path, size).
    pub file_info_by_hash: HashMap<u64, (String, u64)>,
}

impl DatasetIndex {
    /// A new empty index.
    pub fn new() -> Self {
        Self {
            version: "1.0".to_string(),
            last_updated: Utc::now(),
            tracks: BTreeMap::new(),
            track_by_album: BTreeMap::new(),
            album_by_artist: BTreeMap::new(),
            total_size: 0,
            total_files: 0,
            stats_by_location: BTreeMap::new(),
            file_info_by_hash: HashMap::new(),
        }
    }

    /// Path of the index file under a dataset root.
    pub fn file_path(root: &Path) -> PathBuf {
        root.join(BLACKBIRD_DIR).join(INDEX_FILE)
    }

    /// Load an index from its binary file.
    pub fn load(path: &Path) -> Result<Self> {
        let mut file = fs::File::open(path)?;
        let mut header = [0u8; 6];
        file.read_exact(&mut header)
            .map_err(|_| DatasetError::IndexCorrupt("file too short for header".to_string()))?;

        if &header[..4] != INDEX_MAGIC {
            return Err(DatasetError::IndexCorrupt(
                "bad magic; not a Blackbird index file".to_string(),
            ));
        }
        let found = u16::from_le_bytes([header[4], header[5]]);
        if found != INDEX_FORMAT_VERSION {
            return Err(DatasetError::IndexVersion {
                found,
                supported: INDEX_FORMAT_VERSION,
            });
        }

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        bincode::deserialize(&body).map_err(|e| DatasetError::IndexCorrupt(e.to_string()))
    }

    /// Parse an index from raw bytes (e.g. fetched from a remote).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 6 || &data[..4] != INDEX_MAGIC {
            return Err(DatasetError::IndexCorrupt(
                "bad magic; not a Blackbird index file".to_string(),
            ));
        }
        let found = u16::from_le_bytes([data[4], data[5]]);
        if found != INDEX_FORMAT_VERSION {
            return Err(DatasetError::IndexVersion {
                found,
                supported: INDEX_FORMAT_VERSION,
            });
        }
        bincode::deserialize(&data[6..]).map_err(|e| DatasetError::IndexCorrupt(e.to_string()))
    }

    /// Serialize to the versioned binary format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body =
            bincode::serialize(self).map_err(|e| DatasetError::IndexCorrupt(e.to_string()))?;
        let mut out = Vec::with_capacity(body.len() + 6);
        out.extend_from_slice(INDEX_MAGIC);
        out.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Persist atomically, keeping the previous index as `.bak`.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = self.to_bytes()?;

        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
        }
        if path.exists() {
            fs::rename(path, path.with_extension("bin.bak"))?;
        }
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), tracks = self.tracks.len(), "Saved index");
        Ok(())
    }

    /// Look up a file by its 64-bit symbolic-path hash.
    pub fn file_info(&self, hash: u64) -> Option<&(String, u64)> {
        self.file_info_by_hash.get(&hash)
    }

    /// Artists whose name matches the query. Substring match, optionally
    /// case-sensitive. With `fuzzy`, an edit-distance rank is returned when
    /// (and only when) no substring match exists.
    pub fn search_by_artist(&self, query: &str, case_sensitive: bool, fuzzy: bool) -> Vec<String> {
        let matcher = |artist: &str| {
            if case_sensitive {
                artist.contains(query)
            } else {
                artist.to_lowercase().contains(&query.to_lowercase())
            }
        };

        let matches: Vec<String> = self
            .album_by_artist
            .keys()
            .filter(|a| matcher(a))
            .cloned()
            .collect();

        if !matches.is_empty() || !fuzzy {
            return matches;
        }

        // No direct hit: rank all artists by edit distance, closest first.
        let query_lower = query.to_lowercase();
        let mut ranked: Vec<(usize, String)> = self
            .album_by_artist
            .keys()
            .map(|a| (strsim::levenshtein(&a.to_lowercase(), &query_lower), a.clone()))
            .collect();
        ranked.sort();
        ranked.into_iter().map(|(_, a)| a).collect()
    }

    /// Symbolic album paths whose album name contains the query
    /// (case-insensitive), optionally restricted to one artist.
    pub fn search_by_album(&self, query: &str, artist: Option<&str>) -> Vec<String> {
        let query = query.to_lowercase();
        let albums: Vec<&String> = match artist {
            Some(artist) => self
                .album_by_artist
                .get(artist)
                .map(|set| set.iter().collect())
                .unwrap_or_default(),
            None => self.album_by_artist.values().flatten().collect(),
        };

        let mut matches: Vec<String> = albums
            .into_iter()
            .filter(|album_path| {
                album_name(album_path).to_lowercase().contains(&query)
            })
            .cloned()
            .collect();
        matches.sort();
        matches.dedup();
        matches
    }

    /// Tracks whose base name contains the query, optionally restricted by
    /// artist and/or symbolic album path.
    pub fn search_by_track(
        &self,
        query: &str,
        artist: Option<&str>,
        album: Option<&str>,
    ) -> Vec<&TrackInfo> {
        let query = query.to_lowercase();
        self.tracks
            .values()
            .filter(|track| artist.map_or(true, |a| track.artist == a))
            .filter(|track| album.map_or(true, |a| track.album_path == a))
            .filter(|track| track.base_name.to_lowercase().contains(&query))
            .collect()
    }

    /// Tracks whose local view lacks the given component.
    pub fn tracks_missing_component(&self, component: &str) -> Vec<&TrackInfo> {
        self.tracks
            .values()
            .filter(|track| !track.has_component(component))
            .collect()
    }

    /// All symbolic file paths of one track, across components.
    pub fn track_files<'a>(&'a self, track_path: &str) -> Vec<&'a str> {
        self.tracks
            .get(track_path)
            .map(|t| {
                t.files
                    .values()
                    .flatten()
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Recompute `total_*`, `stats_by_location`, and `file_info_by_hash`
    /// from the track table. Called by the indexer after the walk and by the
    /// mover after relocation.
    pub fn rebuild_aggregates(&mut self) {
        self.total_size = 0;
        self.total_files = 0;
        self.stats_by_location.clear();
        self.file_info_by_hash.clear();

        let mut albums_by_location: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
        let mut artists_by_location: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();

        for track in self.tracks.values() {
            let Ok((track_location, _)) = split_symbolic(&track.track_path) else {
                continue;
            };
            let entry = self
                .stats_by_location
                .entry(track_location.to_string())
                .or_default();
            entry.tracks += 1;
            albums_by_location
                .entry(track_location.to_string())
                .or_default()
                .insert(&track.album_path);
            artists_by_location
                .entry(track_location.to_string())
                .or_default()
                .insert(&track.artist);

            for (path, &size) in &track.file_sizes {
                let Ok((file_location, _)) = split_symbolic(path) else {
                    continue;
                };
                let entry = self
                    .stats_by_location
                    .entry(file_location.to_string())
                    .or_default();
                entry.files += 1;
                entry.size += size;
                self.total_files += 1;
                self.total_size += size;
                self.file_info_by_hash
                    .insert(path_hash(path), (path.clone(), size));
            }
        }

        for (location, albums) in albums_by_location {
            self.stats_by_location
                .entry(location)
                .or_default()
                .albums = albums.len() as u64;
        }
        for (location, artists) in artists_by_location {
            self.stats_by_location
                .entry(location)
                .or_default()
                .artists = artists.len() as u64;
        }

        self.last_updated = Utc::now();
    }
}

impl Default for DatasetIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Album name (last path segment) of a symbolic album path.
pub fn album_name(album_path: &str) -> &str {
    album_path.rsplit('/').next().unwrap_or(album_path)
}
