//! # Location Registry
//!
//! Persisted mapping of *location name → absolute root path*. The dataset may
//! physically span several disks; the registry is what turns a symbolic path
//! (`LocationName/relative/posix/path`) into an absolute one.
//!
//! Keeping physical roots out of the persisted index decouples relocation
//! (rename, mount-point change) from re-indexing: only `locations.json`
//! needs updating.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{DatasetError, Result};
use crate::{BLACKBIRD_DIR, DEFAULT_LOCATION, LOCATIONS_FILE};

/// Registry of named storage locations backing one logical dataset.
///
/// One location named `Main` always exists. Persisted as a flat JSON object
/// (name → absolute path string) at `.blackbird/locations.json` under the
/// primary root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationRegistry {
    primary_root: PathBuf,
    locations: BTreeMap<String, PathBuf>,
}

impl LocationRegistry {
    /// Load the registry from `.blackbird/locations.json` under
    /// `primary_root`. If the file is absent, synthesizes `{Main: primary_root}`
    /// in memory without writing it.
    pub fn load(primary_root: impl Into<PathBuf>) -> Result<Self> {
        let primary_root = primary_root.into();
        if !primary_root.is_dir() {
            return Err(DatasetError::PathInvalid(primary_root));
        }

        let file_path = locations_file(&primary_root);
        let locations = if file_path.exists() {
            let data = fs::read_to_string(&file_path)?;
            let raw: BTreeMap<String, String> = serde_json::from_str(&data)?;
            let mut locations = BTreeMap::new();
            for (name, path) in raw {
                validate_name(&name)?;
                // Paths are accepted as-is on load; a location may live on a
                // mount that is not currently attached.
                locations.insert(name, PathBuf::from(path));
            }
            if locations.is_empty() {
                return Err(DatasetError::Config(format!(
                    "{} is empty; expected at least one location",
                    file_path.display()
                )));
            }
            locations
        } else {
            debug!(
                root = %primary_root.display(),
                "No locations file found; defaulting to a single 'Main' location"
            );
            let mut locations = BTreeMap::new();
            locations.insert(DEFAULT_LOCATION.to_string(), primary_root.clone());
            locations
        };

        Ok(Self {
            primary_root,
            locations,
        })
    }

    /// Persist the registry to `.blackbird/locations.json` (atomic rename-over).
    pub fn save(&self) -> Result<()> {
        let file_path = locations_file(&self.primary_root);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let raw: BTreeMap<&str, String> = self
            .locations
            .iter()
            .map(|(name, path)| (name.as_str(), path.display().to_string()))
            .collect();
        let data = serde_json::to_string_pretty(&raw)?;

        let tmp = file_path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &file_path)?;
        Ok(())
    }

    /// The primary root this registry was loaded from.
    pub fn primary_root(&self) -> &Path {
        &self.primary_root
    }

    /// All locations, name → absolute root.
    pub fn all(&self) -> &BTreeMap<String, PathBuf> {
        &self.locations
    }

    /// Sorted location names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.locations.keys().map(String::as_str)
    }

    /// Whether a location with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.locations.contains_key(name)
    }

    /// Absolute root path of a location.
    pub fn root_of(&self, name: &str) -> Result<&Path> {
        self.locations
            .get(name)
            .map(PathBuf::as_path)
            .ok_or_else(|| DatasetError::UnknownLocation(name.to_string()))
    }

    /// Register a new location. The path must be an existing directory.
    pub fn add(&mut self, name: &str, path: impl Into<PathBuf>) -> Result<()> {
        validate_name(name)?;
        if self.locations.contains_key(name) {
            return Err(DatasetError::LocationExists(name.to_string()));
        }

        let path = path.into();
        if !path.is_dir() {
            return Err(DatasetError::PathInvalid(path));
        }

        info!(location = name, path = %path.display(), "Registered location");
        self.locations.insert(name.to_string(), path);
        Ok(())
    }

    /// Remove a location. The last remaining location can never be removed;
    /// the index-reference check belongs to the [`Dataset`](crate::Dataset)
    /// owner, which sees both registry and index.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if !self.locations.contains_key(name) {
            return Err(DatasetError::UnknownLocation(name.to_string()));
        }
        if self.locations.len() == 1 {
            return Err(DatasetError::LastLocation(name.to_string()));
        }
        self.locations.remove(name);
        info!(location = name, "Removed location");
        Ok(())
    }

    /// Resolve a symbolic path (`Location/relative/path`) to an absolute path.
    pub fn resolve(&self, symbolic_path: &str) -> Result<PathBuf> {
        let (location, relative) = split_symbolic(symbolic_path)?;
        let root = self.root_of(location)?;
        Ok(root.join(relative))
    }

    /// Build a symbolic path from a location name and a relative path.
    pub fn symbolize(&self, location: &str, relative: &Path) -> Result<String> {
        if !self.locations.contains_key(location) {
            return Err(DatasetError::UnknownLocation(location.to_string()));
        }
        let relative = relative.to_string_lossy();
        if relative.is_empty() {
            return Err(DatasetError::MalformedSymbolic(format!("{}/", location)));
        }
        Ok(format!("{}/{}", location, relative.replace('\\', "/")))
    }
}

/// Split a symbolic path into `(location, relative)`. The relative part must
/// be non-empty: `"Main/"` and `"Main"` are both malformed.
pub fn split_symbolic(symbolic_path: &str) -> Result<(&str, &str)> {
    match symbolic_path.split_once('/') {
        Some((location, relative)) if !location.is_empty() && !relative.is_empty() => {
            Ok((location, relative))
        }
        _ => Err(DatasetError::MalformedSymbolic(symbolic_path.to_string())),
    }
}

fn locations_file(primary_root: &Path) -> PathBuf {
    primary_root.join(BLACKBIRD_DIR).join(LOCATIONS_FILE)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(DatasetError::LocationNameInvalid(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_with_two_locations() -> (TempDir, TempDir, LocationRegistry) {
        let primary = TempDir::new().unwrap();
        let ssd = TempDir::new().unwrap();
        let mut registry = LocationRegistry::load(primary.path()).unwrap();
        registry.add("SSD", ssd.path()).unwrap();
        (primary, ssd, registry)
    }

    #[test]
    fn test_load_defaults_to_main() {
        let dir = TempDir::new().unwrap();
        let registry = LocationRegistry::load(dir.path()).unwrap();
        assert!(registry.contains("Main"));
        assert_eq!(registry.root_of("Main").unwrap(), dir.path());
    }

    #[test]
    fn test_load_rejects_missing_root() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            LocationRegistry::load(&missing),
            Err(DatasetError::PathInvalid(_))
        ));
    }

    #[test]
    fn test_save_and_reload() {
        let (primary, ssd, registry) = registry_with_two_locations();
        registry.save().unwrap();

        let reloaded = LocationRegistry::load(primary.path()).unwrap();
        assert!(reloaded.contains("Main"));
        assert_eq!(reloaded.root_of("SSD").unwrap(), ssd.path());
    }

    #[test]
    fn test_add_duplicate_fails() {
        let (_primary, ssd, mut registry) = registry_with_two_locations();
        assert!(matches!(
            registry.add("SSD", ssd.path()),
            Err(DatasetError::LocationExists(_))
        ));
    }

    #[test]
    fn test_add_invalid_name_fails() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let mut registry = LocationRegistry::load(dir.path()).unwrap();
        assert!(registry.add("", other.path()).is_err());
        assert!(registry.add("a/b", other.path()).is_err());
    }

    #[test]
    fn test_add_nonexistent_path_fails() {
        let dir = TempDir::new().unwrap();
        let mut registry = LocationRegistry::load(dir.path()).unwrap();
        let missing = dir.path().join("not-there");
        assert!(matches!(
            registry.add("SSD", &missing),
            Err(DatasetError::PathInvalid(_))
        ));
    }

    #[test]
    fn test_remove_last_location_forbidden() {
        let dir = TempDir::new().unwrap();
        let mut registry = LocationRegistry::load(dir.path()).unwrap();
        assert!(matches!(
            registry.remove("Main"),
            Err(DatasetError::LastLocation(_))
        ));
    }

    #[test]
    fn test_remove_location() {
        let (_primary, _ssd, mut registry) = registry_with_two_locations();
        registry.remove("SSD").unwrap();
        assert!(!registry.contains("SSD"));
    }

    #[test]
    fn test_resolve_and_symbolize_roundtrip() {
        let (_primary, ssd, registry) = registry_with_two_locations();
        let rel = Path::new("Artist/Album/track_instrumental.mp3");
        let symbolic = registry.symbolize("SSD", rel).unwrap();
        assert_eq!(symbolic, "SSD/Artist/Album/track_instrumental.mp3");
        assert_eq!(registry.resolve(&symbolic).unwrap(), ssd.path().join(rel));
    }

    #[test]
    fn test_resolve_unknown_location() {
        let dir = TempDir::new().unwrap();
        let registry = LocationRegistry::load(dir.path()).unwrap();
        assert!(matches!(
            registry.resolve("Nowhere/a/b.mp3"),
            Err(DatasetError::UnknownLocation(_))
        ));
    }

    #[test]
    fn test_malformed_symbolic_paths() {
        let dir = TempDir::new().unwrap();
        let registry = LocationRegistry::load(dir.path()).unwrap();
        // Empty relative part is invalid, with or without the trailing slash.
        assert!(matches!(
            registry.resolve("Main/"),
            Err(DatasetError::MalformedSymbolic(_))
        ));
        assert!(matches!(
            registry.resolve("Main"),
            Err(DatasetError::MalformedSymbolic(_))
        ));
        assert!(matches!(
            registry.resolve(""),
            Err(DatasetError::MalformedSymbolic(_))
        ));
    }

    #[test]
    fn test_symbolize_empty_relative_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = LocationRegistry::load(dir.path()).unwrap();
        assert!(registry.symbolize("Main", Path::new("")).is_err());
    }
}
