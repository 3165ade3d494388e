//! # Indexer
//!
//! Walks every registered location, matches files against the schema, and
//! produces a fresh [`DatasetIndex`]. Building is single-threaded; the
//! resulting index is read-only during sync runs.

use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::index::{DatasetIndex, TrackInfo};
use crate::locations::LocationRegistry;
use crate::schema::DatasetSchema;
use crate::BLACKBIRD_DIR;

/// Whether a directory name is a CD directory (`CD<digits>`).
pub fn is_cd_dir(name: &str) -> bool {
    name.strip_prefix("CD")
        .map(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Build a new index over every location in the registry.
pub fn build_index(registry: &LocationRegistry, schema: &DatasetSchema) -> Result<DatasetIndex> {
    let matcher = schema.compile()?;
    let mut index = DatasetIndex::new();

    for (location, root) in registry.all() {
        if !root.is_dir() {
            warn!(location = %location, root = %root.display(), "Location root missing; skipping");
            continue;
        }
        debug!(location = %location, root = %root.display(), "Scanning location");

        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| e.file_name() != BLACKBIRD_DIR)
            .filter_map(|e| match e {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable entry");
                    None
                }
            })
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(filename) = entry.file_name().to_str() else {
                warn!(path = %entry.path().display(), "Skipping non-UTF-8 filename");
                continue;
            };

            let matches = matcher.matches(filename);
            let Some(m) = matches.first() else {
                continue;
            };

            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let Some(layout) = track_layout(rel) else {
                warn!(path = %rel.display(), "Path does not fit Artist/Album[/CD]/file; skipping");
                continue;
            };

            let size = match entry.metadata() {
                Ok(meta) => meta.len(),
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "Failed to stat file; skipping");
                    continue;
                }
            };

            let symbolic_file = registry.symbolize(location, rel)?;
            let album_path = format!("{}/{}/{}", location, layout.artist, layout.album);
            let track_path = match &layout.cd {
                Some(cd) => format!("{}/{}/{}", album_path, cd, m.base_name),
                None => format!("{}/{}", album_path, m.base_name),
            };

            let track = index
                .tracks
                .entry(track_path.clone())
                .or_insert_with(|| TrackInfo {
                    track_path: track_path.clone(),
                    artist: layout.artist.to_string(),
                    album_path: album_path.clone(),
                    cd_number: layout.cd.clone(),
                    base_name: m.base_name.clone(),
                    files: Default::default(),
                    file_sizes: Default::default(),
                });

            let paths = track.files.entry(m.component.clone()).or_default();
            if !m.multiple && !paths.is_empty() {
                warn!(
                    track = %track_path,
                    component = %m.component,
                    file = %symbolic_file,
                    "Second file for a single-file component; keeping the first"
                );
                continue;
            }
            paths.push(symbolic_file.clone());
            track.file_sizes.insert(symbolic_file, size);

            index
                .track_by_album
                .entry(album_path.clone())
                .or_default()
                .insert(track_path.clone());
            index
                .album_by_artist
                .entry(layout.artist.to_string())
                .or_default()
                .insert(album_path);
        }
    }

    index.rebuild_aggregates();
    info!(
        tracks = index.tracks.len(),
        files = index.total_files,
        size = index.total_size,
        "Index built"
    );
    Ok(index)
}

struct TrackLayout {
    artist: String,
    album: String,
    cd: Option<String>,
}

/// Derive `(artist, album, cd?)` from a location-relative file path.
/// Accepts `Artist/Album/file` and `Artist/Album/CD<digits>/file`.
fn track_layout(rel: &Path) -> Option<TrackLayout> {
    let parts: Vec<&str> = rel.iter().filter_map(|p| p.to_str()).collect();
    match parts.len() {
        3 => Some(TrackLayout {
            artist: parts[0].to_string(),
            album: parts[1].to_string(),
            cd: None,
        }),
        4 if is_cd_dir(parts[2]) => Some(TrackLayout {
            artist: parts[0].to_string(),
            album: parts[1].to_string(),
            cd: Some(parts[2].to_string()),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ComponentDef;
    use std::fs;
    use tempfile::TempDir;

    fn canonical_schema() -> DatasetSchema {
        let mut schema = DatasetSchema::default();
        for (name, pattern) in [
            ("instrumental", "*_instrumental.mp3"),
            ("vocals", "*_vocals_noreverb.mp3"),
            ("mir", "*.mir.json"),
            ("caption", "*_caption.txt"),
        ] {
            schema
                .add_component(
                    name,
                    ComponentDef {
                        pattern: pattern.to_string(),
                        multiple: false,
                        description: None,
                    },
                )
                .unwrap();
        }
        schema
    }

    fn write_track(dir: &Path, base: &str, components: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        for comp in components {
            let (name, body): (String, &[u8]) = match *comp {
                "instrumental" => (format!("{}_instrumental.mp3", base), b"mp3!"),
                "vocals" => (format!("{}_vocals_noreverb.mp3", base), b"mp3!"),
                "mir" => (format!("{}.mir.json", base), b"{}"),
                "caption" => (format!("{}_caption.txt", base), b"txt!"),
                other => panic!("unknown component {}", other),
            };
            fs::write(dir.join(name), body).unwrap();
        }
    }

    #[test]
    fn test_is_cd_dir() {
        assert!(is_cd_dir("CD1"));
        assert!(is_cd_dir("CD12"));
        assert!(!is_cd_dir("CD"));
        assert!(!is_cd_dir("CDx"));
        assert!(!is_cd_dir("Disc1"));
    }

    #[test]
    fn test_build_simple_dataset() {
        let dir = TempDir::new().unwrap();
        let album = dir.path().join("Artist_A").join("Album1");
        write_track(&album, "01.Alpha", &["instrumental", "vocals", "mir", "caption"]);
        write_track(&album, "02.Beta", &["instrumental", "mir"]);

        let registry = LocationRegistry::load(dir.path()).unwrap();
        let index = build_index(&registry, &canonical_schema()).unwrap();

        assert_eq!(index.tracks.len(), 2);
        assert_eq!(index.total_files, 6);
        let alpha = &index.tracks["Main/Artist_A/Album1/01.Alpha"];
        assert!(alpha.has_component("vocals"));
        assert_eq!(alpha.cd_number, None);
        let beta = &index.tracks["Main/Artist_A/Album1/02.Beta"];
        assert!(!beta.has_component("vocals"));
    }

    #[test]
    fn test_build_multi_cd_album() {
        let dir = TempDir::new().unwrap();
        let album = dir.path().join("Artist_B").join("Boxset");
        write_track(&album.join("CD1"), "01.One", &["instrumental"]);
        write_track(&album.join("CD2"), "01.Two", &["instrumental"]);

        let registry = LocationRegistry::load(dir.path()).unwrap();
        let index = build_index(&registry, &canonical_schema()).unwrap();

        assert_eq!(index.tracks.len(), 2);
        let one = &index.tracks["Main/Artist_B/Boxset/CD1/01.One"];
        assert_eq!(one.cd_number.as_deref(), Some("CD1"));
        // Both CDs belong to the same album.
        assert_eq!(
            index.track_by_album["Main/Artist_B/Boxset"].len(),
            2
        );
    }

    #[test]
    fn test_build_skips_blackbird_dir_and_odd_layouts() {
        let dir = TempDir::new().unwrap();
        let album = dir.path().join("Artist_A").join("Album1");
        write_track(&album, "01.Alpha", &["instrumental"]);

        // Engine artifacts and files outside Artist/Album depth are ignored.
        let blackbird = dir.path().join(BLACKBIRD_DIR);
        fs::create_dir_all(&blackbird).unwrap();
        fs::write(blackbird.join("stray_instrumental.mp3"), b"mp3!").unwrap();
        fs::write(dir.path().join("toplevel_instrumental.mp3"), b"mp3!").unwrap();
        let deep = album.join("NotACD").join("Deep");
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("x_instrumental.mp3"), b"mp3!").unwrap();

        let registry = LocationRegistry::load(dir.path()).unwrap();
        let index = build_index(&registry, &canonical_schema()).unwrap();
        assert_eq!(index.total_files, 1);
    }

    #[test]
    fn test_build_across_locations() {
        let main = TempDir::new().unwrap();
        let ssd = TempDir::new().unwrap();
        write_track(
            &main.path().join("Artist_A").join("Album1"),
            "01.Alpha",
            &["instrumental"],
        );
        write_track(
            &ssd.path().join("Artist_C").join("Album9"),
            "01.Omega",
            &["instrumental", "mir"],
        );

        let mut registry = LocationRegistry::load(main.path()).unwrap();
        registry.add("SSD", ssd.path()).unwrap();
        let index = build_index(&registry, &canonical_schema()).unwrap();

        assert_eq!(index.total_files, 3);
        assert_eq!(index.stats_by_location["Main"].files, 1);
        assert_eq!(index.stats_by_location["SSD"].files, 2);
        assert!(index.tracks.contains_key("SSD/Artist_C/Album9/01.Omega"));
    }

    #[test]
    fn test_empty_dataset() {
        let dir = TempDir::new().unwrap();
        let registry = LocationRegistry::load(dir.path()).unwrap();
        let index = build_index(&registry, &canonical_schema()).unwrap();
        assert_eq!(index.total_files, 0);
        assert!(index.tracks.is_empty());
    }

    #[test]
    fn test_multiple_component_collects_all_files() {
        let dir = TempDir::new().unwrap();
        let album = dir.path().join("Artist_A").join("Album1");
        fs::create_dir_all(&album).unwrap();
        for n in 1..=3 {
            fs::write(album.join(format!("01.Alpha_section{}.mp3", n)), b"mp3!").unwrap();
        }

        let mut schema = DatasetSchema::default();
        schema
            .add_component(
                "section",
                ComponentDef {
                    pattern: "*_section*.mp3".to_string(),
                    multiple: true,
                    description: None,
                },
            )
            .unwrap();

        let registry = LocationRegistry::load(dir.path()).unwrap();
        let index = build_index(&registry, &schema).unwrap();

        assert_eq!(index.tracks.len(), 1);
        let track = &index.tracks["Main/Artist_A/Album1/01.Alpha"];
        assert_eq!(track.files["section"].len(), 3);
        assert_eq!(index.total_files, 3);
    }
}
