//! # Component Schema
//!
//! Declarative description of the file kinds that make up a track. Each
//! component is a glob over the file *name* only (case-sensitive, exact
//! extensions, compound extensions like `.mir.json` preserved) plus a
//! `multiple` flag for components that may repeat per base track.
//!
//! The schema can be discovered from an existing tree, merged with a remote
//! schema during sync, and guarantees pattern uniqueness: no two components
//! may match the same concrete filename.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{DatasetError, Result};
use crate::{BLACKBIRD_DIR, SCHEMA_FILE};

/// Current schema format version.
const SCHEMA_VERSION: &str = "1.0";

/// File extensions considered by schema discovery.
const DISCOVERY_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg", "opus", "json", "txt"];

/// Audio extensions, used for canonical component naming.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg", "opus"];

/// One named file category within a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDef {
    /// Glob over the file name only, e.g. `*_instrumental.mp3`.
    pub pattern: String,
    /// Whether files of this kind may repeat per base track.
    #[serde(default)]
    pub multiple: bool,
    /// Free text, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A component that matched a filename, with the base name left after
/// stripping the matched suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentMatch {
    pub component: String,
    pub base_name: String,
    pub multiple: bool,
}

/// The dataset component schema, persisted at `.blackbird/schema.json`.
///
/// Unknown top-level siblings (the legacy `structure` and `sync` objects)
/// are carried through load/save untouched; they are informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub version: String,
    pub components: BTreeMap<String, ComponentDef>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl Default for DatasetSchema {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION.to_string(),
            components: BTreeMap::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl DatasetSchema {
    /// Path of the schema file under a dataset root.
    pub fn file_path(root: &Path) -> PathBuf {
        root.join(BLACKBIRD_DIR).join(SCHEMA_FILE)
    }

    /// Load a schema from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Parse a schema from raw JSON bytes (e.g. fetched from a remote).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Persist the schema as pretty JSON (atomic rename-over).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Add a component, enforcing name validity and pattern uniqueness.
    pub fn add_component(&mut self, name: &str, def: ComponentDef) -> Result<()> {
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(DatasetError::ComponentNameInvalid(name.to_string()));
        }
        if self.components.contains_key(name) {
            return Err(DatasetError::ComponentExists(name.to_string()));
        }

        // Compile up front so a bad glob fails here, not at match time.
        compile_glob(&def.pattern)?;

        for (existing_name, existing) in &self.components {
            if patterns_conflict(&def.pattern, &existing.pattern)? {
                return Err(DatasetError::PatternAmbiguous {
                    new: def.pattern.clone(),
                    existing: existing_name.clone(),
                    existing_pattern: existing.pattern.clone(),
                });
            }
        }

        info!(component = name, pattern = %def.pattern, "Added schema component");
        self.components.insert(name.to_string(), def);
        Ok(())
    }

    /// Compile the schema into a reusable filename matcher.
    pub fn compile(&self) -> Result<SchemaMatcher> {
        let mut entries = Vec::with_capacity(self.components.len());
        for (name, def) in &self.components {
            entries.push(MatcherEntry {
                name: name.clone(),
                matcher: compile_glob(&def.pattern)?,
                pattern: def.pattern.clone(),
                multiple: def.multiple,
            });
        }
        Ok(SchemaMatcher { entries })
    }

    /// Merge remote component definitions into this schema.
    ///
    /// Only components in `requested` (or every remote component when
    /// `requested` is `None`) are considered; definitions already present
    /// locally are never overwritten. The same name mapping to a different
    /// pattern on both sides is a conflict. Returns the names added.
    pub fn merge_remote(
        &mut self,
        remote: &DatasetSchema,
        requested: Option<&[String]>,
    ) -> Result<Vec<String>> {
        let names: Vec<String> = match requested {
            Some(names) => names.to_vec(),
            None => remote.components.keys().cloned().collect(),
        };

        let mut added = Vec::new();
        for name in names {
            let remote_def = remote
                .components
                .get(&name)
                .ok_or_else(|| DatasetError::UnknownComponent(name.clone()))?;

            match self.components.get(&name) {
                Some(local_def) => {
                    if local_def.pattern != remote_def.pattern {
                        return Err(DatasetError::SchemaConflict {
                            name,
                            local: local_def.pattern.clone(),
                            remote: remote_def.pattern.clone(),
                        });
                    }
                }
                None => {
                    for (existing_name, existing) in &self.components {
                        if patterns_conflict(&remote_def.pattern, &existing.pattern)? {
                            return Err(DatasetError::PatternAmbiguous {
                                new: remote_def.pattern.clone(),
                                existing: existing_name.clone(),
                                existing_pattern: existing.pattern.clone(),
                            });
                        }
                    }
                    debug!(component = %name, pattern = %remote_def.pattern, "Merged remote component");
                    self.components.insert(name.clone(), remote_def.clone());
                    added.push(name);
                }
            }
        }
        Ok(added)
    }

    /// Derive a schema from the files under `root`.
    ///
    /// When `sample_artists` is given, only those top-level directories are
    /// walked; otherwise the whole tree is. Component suffixes ending in
    /// digits become `multiple:true` wildcard patterns.
    pub fn discover(root: &Path, sample_artists: Option<&[String]>) -> Result<Self> {
        let mut groups: BTreeMap<(String, bool), u64> = BTreeMap::new();

        let roots: Vec<PathBuf> = match sample_artists {
            Some(artists) => artists.iter().map(|a| root.join(a)).collect(),
            None => vec![root.to_path_buf()],
        };

        for walk_root in roots {
            for entry in WalkDir::new(&walk_root)
                .into_iter()
                .filter_entry(|e| e.file_name() != BLACKBIRD_DIR)
                .filter_map(|e| e.ok())
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(filename) = entry.file_name().to_str() else {
                    continue;
                };
                if let Some((pattern, multiple)) = discover_pattern(filename) {
                    *groups.entry((pattern, multiple)).or_insert(0) += 1;
                }
            }
        }

        let mut schema = DatasetSchema::default();
        for ((pattern, multiple), count) in groups {
            let name = canonical_component_name(&pattern);
            debug!(component = %name, pattern = %pattern, files = count, "Discovered component");
            schema.add_component(
                &name,
                ComponentDef {
                    pattern,
                    multiple,
                    description: None,
                },
            )?;
        }
        Ok(schema)
    }
}

/// Compiled matcher set for a schema.
pub struct SchemaMatcher {
    entries: Vec<MatcherEntry>,
}

struct MatcherEntry {
    name: String,
    matcher: GlobMatcher,
    pattern: String,
    multiple: bool,
}

impl SchemaMatcher {
    /// All components matching a filename, with the base name derived by
    /// stripping each pattern's literal tail. Under pattern uniqueness this
    /// yields at most one match for well-formed schemas.
    pub fn matches(&self, filename: &str) -> Vec<ComponentMatch> {
        self.entries
            .iter()
            .filter(|e| e.matcher.is_match(filename))
            .map(|e| ComponentMatch {
                component: e.name.clone(),
                base_name: strip_component_suffix(&e.pattern, filename),
                multiple: e.multiple,
            })
            .collect()
    }

    /// Whether any component matches the filename.
    pub fn matches_any(&self, filename: &str) -> bool {
        self.entries.iter().any(|e| e.matcher.is_match(filename))
    }
}

fn compile_glob(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| DatasetError::PatternInvalid {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

/// Whether two globs can match the same concrete filename.
///
/// Checked by synthesizing a sample name from each pattern (wildcards
/// replaced by a plausible track title) and cross-matching.
fn patterns_conflict(a: &str, b: &str) -> Result<bool> {
    if a == b {
        return Ok(true);
    }
    let matcher_a = compile_glob(a)?;
    let matcher_b = compile_glob(b)?;
    let sample_a = sample_name(a);
    let sample_b = sample_name(b);
    Ok(matcher_b.is_match(&sample_a) || matcher_a.is_match(&sample_b))
}

/// A concrete filename the pattern matches, wildcards filled with a
/// plausible track title.
fn sample_name(pattern: &str) -> String {
    pattern.replace('*', "01.Sample Track")
}

/// Strip the pattern's literal tail from a matched filename, leaving the
/// base track name. For `*_vocals_noreverb.mp3` and
/// `Song_vocals_noreverb.mp3` this is `Song`; for `*.mir.json` and
/// `Song.mir.json` it is `Song`; for wildcard-tailed patterns like
/// `*_section*.mp3` the base ends before the `_section` literal.
fn strip_component_suffix(pattern: &str, filename: &str) -> String {
    let after_star = pattern.strip_prefix('*').unwrap_or(pattern);
    let literal = match after_star.find('*') {
        Some(i) => &after_star[..i],
        None => after_star,
    };
    if literal.is_empty() {
        return filename.to_string();
    }
    match filename.rfind(literal) {
        Some(i) => filename[..i].to_string(),
        None => filename.to_string(),
    }
}

/// Split a filename into `(stem, extension)`, preserving compound
/// extensions: `Song.mir.json` splits as `("Song", "mir.json")`.
fn split_extension(filename: &str) -> Option<(&str, &str)> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if !DISCOVERY_EXTENSIONS.contains(&ext) {
        return None;
    }
    // A short, space-free, underscore-free dotted tail before a .json is a
    // compound extension (.mir.json), not part of the track name.
    if ext == "json" {
        if let Some((inner_stem, inner)) = stem.rsplit_once('.') {
            if !inner.is_empty()
                && inner.len() <= 4
                && inner.chars().all(|c| c.is_ascii_lowercase())
                && !inner_stem.is_empty()
            {
                return Some((inner_stem, &filename[inner_stem.len() + 1..]));
            }
        }
    }
    Some((stem, ext))
}

/// Derive a `(pattern, multiple)` pair from one filename, or `None` when the
/// extension is not a discovery candidate.
fn discover_pattern(filename: &str) -> Option<(String, bool)> {
    let (stem, ext) = split_extension(filename)?;

    // Longest `_<suffix>` tail that is non-empty and contains no spaces.
    let suffix = stem
        .char_indices()
        .filter(|&(_, c)| c == '_')
        .map(|(i, _)| &stem[i + 1..])
        .find(|tail| !tail.is_empty() && !tail.contains(' '));

    match suffix {
        Some(suffix) => {
            let trimmed = suffix.trim_end_matches(|c: char| c.is_ascii_digit());
            if trimmed.len() < suffix.len() && !trimmed.is_empty() {
                // Numeric tail becomes a wildcard: files repeat per track.
                Some((format!("*_{}*.{}", trimmed, ext), true))
            } else if trimmed.is_empty() {
                // All-digit suffix carries no component meaning.
                Some((format!("*.{}", ext), false))
            } else {
                Some((format!("*_{}.{}", suffix, ext), false))
            }
        }
        None => Some((format!("*.{}", ext), false)),
    }
}

/// Canonical component name for a discovered pattern: the pattern with the
/// leading `*_`/`*.` stripped and the extension normalized (audio extensions
/// map to an `_audio` suffix, compound `.mir.json` collapses to `mir`).
fn canonical_component_name(pattern: &str) -> String {
    let is_audio = AUDIO_EXTENSIONS.iter().any(|ext| pattern.ends_with(ext));
    let tail = pattern
        .trim_start_matches('*')
        .trim_start_matches(['_', '.']);
    let mut core = tail.replace('*', "");
    for ext in DISCOVERY_EXTENSIONS {
        if let Some(stripped) = core.strip_suffix(&format!(".{}", ext)) {
            core = stripped.to_string();
            break;
        }
    }

    // Pure-extension patterns like `*.mp3` reduce to the bare extension.
    if DISCOVERY_EXTENSIONS.contains(&core.as_str()) {
        return if is_audio {
            format!("source_{}", core)
        } else {
            core
        };
    }

    let core = core.trim_end_matches(['_', '.']).replace('.', "_");
    if is_audio && !core.ends_with("_audio") {
        format!("{}_audio", core)
    } else {
        core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn component(pattern: &str, multiple: bool) -> ComponentDef {
        ComponentDef {
            pattern: pattern.to_string(),
            multiple,
            description: None,
        }
    }

    fn canonical_schema() -> DatasetSchema {
        let mut schema = DatasetSchema::default();
        schema
            .add_component("instrumental", component("*_instrumental.mp3", false))
            .unwrap();
        schema
            .add_component("vocals", component("*_vocals_noreverb.mp3", false))
            .unwrap();
        schema
            .add_component("mir", component("*.mir.json", false))
            .unwrap();
        schema
            .add_component("caption", component("*_caption.txt", false))
            .unwrap();
        schema
    }

    #[test]
    fn test_match_strips_suffix() {
        let matcher = canonical_schema().compile().unwrap();

        let matches = matcher.matches("01.Track_instrumental.mp3");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].component, "instrumental");
        assert_eq!(matches[0].base_name, "01.Track");

        let matches = matcher.matches("01.Track.mir.json");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].component, "mir");
        assert_eq!(matches[0].base_name, "01.Track");
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let matcher = canonical_schema().compile().unwrap();
        // Extension case differs from the lower-case glob: no match.
        assert!(matcher.matches("01.Track_instrumental.MP3").is_empty());
        assert!(matcher.matches("01.Track_INSTRUMENTAL.mp3").is_empty());
    }

    #[test]
    fn test_unmatched_file_yields_nothing() {
        let matcher = canonical_schema().compile().unwrap();
        assert!(matcher.matches("cover.jpg").is_empty());
        assert!(matcher.matches("01.Track_vocals.mp3").is_empty());
    }

    #[test]
    fn test_wildcard_tail_base_name() {
        let mut schema = DatasetSchema::default();
        schema
            .add_component("section", component("*_section*.mp3", true))
            .unwrap();
        let matcher = schema.compile().unwrap();
        let matches = matcher.matches("01.Track_section3.mp3");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].base_name, "01.Track");
        assert!(matches[0].multiple);
    }

    #[test]
    fn test_add_duplicate_name_fails() {
        let mut schema = canonical_schema();
        let err = schema
            .add_component("mir", component("*.analysis.json", false))
            .unwrap_err();
        assert!(matches!(err, DatasetError::ComponentExists(_)));
    }

    #[test]
    fn test_add_invalid_name_fails() {
        let mut schema = DatasetSchema::default();
        assert!(schema
            .add_component("has space", component("*_x.mp3", false))
            .is_err());
        assert!(schema.add_component("", component("*_x.mp3", false)).is_err());
    }

    #[test]
    fn test_ambiguous_pattern_rejected() {
        let mut schema = canonical_schema();
        // `*.mp3` would swallow every audio component.
        let err = schema
            .add_component("audio", component("*.mp3", false))
            .unwrap_err();
        assert!(matches!(err, DatasetError::PatternAmbiguous { .. }));
    }

    #[test]
    fn test_identical_pattern_rejected() {
        let mut schema = canonical_schema();
        let err = schema
            .add_component("inst2", component("*_instrumental.mp3", false))
            .unwrap_err();
        assert!(matches!(err, DatasetError::PatternAmbiguous { .. }));
    }

    #[test]
    fn test_save_load_preserves_extra_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schema.json");

        let raw = serde_json::json!({
            "version": "1.0",
            "components": {
                "instrumental": {"pattern": "*_instrumental.mp3", "multiple": false}
            },
            "structure": {"artist_album_format": {"cd_pattern": "CD\\d+"}},
            "sync": {"default_components": ["instrumental"]}
        });
        fs::write(&path, serde_json::to_string_pretty(&raw).unwrap()).unwrap();

        let schema = DatasetSchema::load(&path).unwrap();
        assert!(schema.components.contains_key("instrumental"));
        schema.save(&path).unwrap();

        let reread: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert!(reread.get("structure").is_some());
        assert!(reread.get("sync").is_some());
    }

    #[test]
    fn test_merge_remote_adds_requested_only() {
        let mut local = DatasetSchema::default();
        local
            .add_component("instrumental", component("*_instrumental.mp3", false))
            .unwrap();

        let remote = canonical_schema();
        let added = local
            .merge_remote(&remote, Some(&["mir".to_string()]))
            .unwrap();
        assert_eq!(added, vec!["mir".to_string()]);
        assert!(local.components.contains_key("mir"));
        assert!(!local.components.contains_key("vocals"));
    }

    #[test]
    fn test_merge_remote_never_overwrites_local() {
        let mut local = DatasetSchema::default();
        local
            .add_component(
                "instrumental",
                ComponentDef {
                    pattern: "*_instrumental.mp3".to_string(),
                    multiple: false,
                    description: Some("local description".to_string()),
                },
            )
            .unwrap();

        let remote = canonical_schema();
        local
            .merge_remote(&remote, Some(&["instrumental".to_string()]))
            .unwrap();
        assert_eq!(
            local.components["instrumental"].description.as_deref(),
            Some("local description")
        );
    }

    #[test]
    fn test_merge_remote_conflict() {
        let mut local = DatasetSchema::default();
        local
            .add_component("mir", component("*.analysis.json", false))
            .unwrap();

        let remote = canonical_schema();
        let err = local
            .merge_remote(&remote, Some(&["mir".to_string()]))
            .unwrap_err();
        assert!(matches!(err, DatasetError::SchemaConflict { .. }));
    }

    #[test]
    fn test_merge_remote_unknown_component() {
        let mut local = DatasetSchema::default();
        let remote = canonical_schema();
        let err = local
            .merge_remote(&remote, Some(&["nonexistent".to_string()]))
            .unwrap_err();
        assert!(matches!(err, DatasetError::UnknownComponent(_)));
    }

    #[test]
    fn test_split_extension_compound() {
        assert_eq!(
            split_extension("01.Track.mir.json"),
            Some(("01.Track", "mir.json"))
        );
        assert_eq!(
            split_extension("01.Track_instrumental.mp3"),
            Some(("01.Track_instrumental", "mp3"))
        );
        assert_eq!(split_extension("cover.jpg"), None);
    }

    #[test]
    fn test_discover_pattern_rules() {
        assert_eq!(
            discover_pattern("01.Some Track_instrumental.mp3"),
            Some(("*_instrumental.mp3".to_string(), false))
        );
        assert_eq!(
            discover_pattern("01.Some Track_vocals_noreverb.mp3"),
            Some(("*_vocals_noreverb.mp3".to_string(), false))
        );
        // Trailing digits become a wildcard, multiple = true.
        assert_eq!(
            discover_pattern("01.Some Track_section12.mp3"),
            Some(("*_section*.mp3".to_string(), true))
        );
        // Compound extension preserved.
        assert_eq!(
            discover_pattern("01.Some Track.mir.json"),
            Some(("*.mir.json".to_string(), false))
        );
        // Spaces in the tail disqualify it as a component suffix.
        assert_eq!(
            discover_pattern("01.Some_Band Track.mp3"),
            Some(("*.mp3".to_string(), false))
        );
    }

    #[test]
    fn test_canonical_component_names() {
        assert_eq!(canonical_component_name("*_vocals.mp3"), "vocals_audio");
        assert_eq!(
            canonical_component_name("*_vocals_noreverb.mp3"),
            "vocals_noreverb_audio"
        );
        assert_eq!(canonical_component_name("*.mir.json"), "mir");
        assert_eq!(canonical_component_name("*_lyrics.json"), "lyrics");
        assert_eq!(canonical_component_name("*_section*.mp3"), "section_audio");
        assert_eq!(canonical_component_name("*_caption.txt"), "caption");
    }

    #[test]
    fn test_discover_from_tree() {
        let dir = TempDir::new().unwrap();
        let album = dir.path().join("Artist").join("Album");
        fs::create_dir_all(&album).unwrap();
        for name in [
            "01.Track_instrumental.mp3",
            "01.Track_vocals_noreverb.mp3",
            "01.Track.mir.json",
            "02.Track_instrumental.mp3",
        ] {
            fs::write(album.join(name), b"data").unwrap();
        }

        let schema = DatasetSchema::discover(dir.path(), None).unwrap();
        let patterns: Vec<&str> = schema
            .components
            .values()
            .map(|c| c.pattern.as_str())
            .collect();
        assert!(patterns.contains(&"*_instrumental.mp3"));
        assert!(patterns.contains(&"*_vocals_noreverb.mp3"));
        assert!(patterns.contains(&"*.mir.json"));
    }

    #[test]
    fn test_discover_with_sample_artists() {
        let dir = TempDir::new().unwrap();
        for (artist, file) in [
            ("Artist_A", "01.Track_instrumental.mp3"),
            ("Artist_B", "01.Track_caption.txt"),
        ] {
            let album = dir.path().join(artist).join("Album");
            fs::create_dir_all(&album).unwrap();
            fs::write(album.join(file), b"data").unwrap();
        }

        let schema =
            DatasetSchema::discover(dir.path(), Some(&["Artist_A".to_string()])).unwrap();
        assert_eq!(schema.components.len(), 1);
        assert!(schema
            .components
            .values()
            .any(|c| c.pattern == "*_instrumental.mp3"));
    }
}
