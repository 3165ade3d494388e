//! Index invariants over a canonical multi-artist dataset:
//! round-trip persistence, symbolic-path stability, hash agreement, and
//! per-location stat aggregation.

use std::fs;
use std::path::Path;

use core_dataset::{
    build_index, path_hash, ComponentDef, Dataset, DatasetIndex, DatasetSchema, FindFilter,
    LocationRegistry,
};
use walkdir::WalkDir;

fn component(pattern: &str) -> ComponentDef {
    ComponentDef {
        pattern: pattern.to_string(),
        multiple: false,
        description: None,
    }
}

fn canonical_schema() -> DatasetSchema {
    let mut schema = DatasetSchema::default();
    schema
        .add_component("instrumental", component("*_instrumental.mp3"))
        .unwrap();
    schema
        .add_component("vocals", component("*_vocals_noreverb.mp3"))
        .unwrap();
    schema.add_component("mir", component("*.mir.json")).unwrap();
    schema
        .add_component("caption", component("*_caption.txt"))
        .unwrap();
    schema
}

fn write_component(dir: &Path, base: &str, component: &str) {
    fs::create_dir_all(dir).unwrap();
    let (name, body): (String, &[u8]) = match component {
        "instrumental" => (format!("{}_instrumental.mp3", base), b"mp3!"),
        "vocals" => (format!("{}_vocals_noreverb.mp3", base), b"mp3!"),
        "mir" => (format!("{}.mir.json", base), b"{}"),
        "caption" => (format!("{}_caption.txt", base), b"txt!"),
        other => panic!("unknown component {}", other),
    };
    fs::write(dir.join(name), body).unwrap();
}

/// The canonical dataset: Artist_A with 2 albums / 5 complete tracks,
/// Artist_B with one multi-CD album (CD1: 2 tracks, CD2: 1), Artist_C with
/// 4 tracks of which 2 lack vocals and caption. Data files are 4 bytes,
/// JSON 2 bytes.
fn build_canonical(root: &Path) {
    let all = ["instrumental", "vocals", "mir", "caption"];

    for (album, bases) in [
        ("Album1", vec!["01.Alpha", "02.Beta", "03.Ceta"]),
        ("Album2", vec!["01.Delta", "02.Epsilon"]),
    ] {
        let dir = root.join("Artist_A").join(album);
        for base in bases {
            for c in all {
                write_component(&dir, base, c);
            }
        }
    }

    let boxset = root.join("Artist_B").join("Boxset");
    for (cd, bases) in [("CD1", vec!["01.One", "02.Two"]), ("CD2", vec!["01.Three"])] {
        let dir = boxset.join(cd);
        for base in bases {
            for c in all {
                write_component(&dir, base, c);
            }
        }
    }

    let dir = root.join("Artist_C").join("Album9");
    for base in ["01.Alef", "02.Bet"] {
        for c in all {
            write_component(&dir, base, c);
        }
    }
    for base in ["03.Gamma", "04.Delta"] {
        for c in ["instrumental", "mir"] {
            write_component(&dir, base, c);
        }
    }
}

fn canonical_dataset() -> (tempfile::TempDir, Dataset) {
    let dir = tempfile::TempDir::new().unwrap();
    build_canonical(dir.path());

    let mut dataset = Dataset::open(dir.path()).unwrap();
    *dataset.schema_mut() = canonical_schema();
    dataset.save_schema().unwrap();
    dataset.reindex().unwrap();
    (dir, dataset)
}

#[test]
fn reindex_counts_canonical_dataset() {
    let (_dir, dataset) = canonical_dataset();
    let index = dataset.index().unwrap();

    // 12 tracks; 10 complete tracks of 4 files plus 2 tracks of 2 files.
    assert_eq!(index.tracks.len(), 12);
    assert_eq!(index.total_files, 44);
    assert_eq!(index.stats_by_location["Main"].tracks, 12);
    assert_eq!(index.stats_by_location["Main"].artists, 3);

    let b_albums = &index.album_by_artist["Artist_B"];
    assert_eq!(b_albums.len(), 1);
    let boxset = b_albums.iter().next().unwrap();
    assert_eq!(index.track_by_album[boxset].len(), 3);
}

#[test]
fn stats_missing_vocals_finds_incomplete_tracks() {
    let (_dir, dataset) = canonical_dataset();
    let tracks = dataset
        .find_tracks(&FindFilter::default().with_missing(["vocals"]))
        .unwrap();
    let mut bases: Vec<&str> = tracks.iter().map(|t| t.base_name.as_str()).collect();
    bases.sort();
    assert_eq!(bases, vec!["03.Gamma", "04.Delta"]);
}

#[test]
fn index_roundtrips_through_disk() {
    let (dir, dataset) = canonical_dataset();
    let index = dataset.index().unwrap();

    let path = dir.path().join("roundtrip.bin");
    index.save(&path).unwrap();
    let restored = DatasetIndex::load(&path).unwrap();
    assert_eq!(*index, restored);
}

#[test]
fn symbolic_paths_resolve_to_walked_files() {
    let (dir, dataset) = canonical_dataset();
    let registry = LocationRegistry::load(dir.path()).unwrap();

    for entry in WalkDir::new(dir.path())
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let rel = entry.path().strip_prefix(dir.path()).unwrap();
        if rel.starts_with(".blackbird") {
            continue;
        }
        let symbolic = registry.symbolize("Main", rel).unwrap();
        assert_eq!(registry.resolve(&symbolic).unwrap(), entry.path());
        assert_eq!(dataset.resolve(&symbolic).unwrap(), entry.path());
    }
}

#[test]
fn hash_table_agrees_with_track_table() {
    let (_dir, dataset) = canonical_dataset();
    let index = dataset.index().unwrap();

    let mut seen = 0usize;
    for track in index.tracks.values() {
        for (path, &size) in &track.file_sizes {
            let (stored_path, stored_size) = index.file_info(path_hash(path)).unwrap();
            assert_eq!(stored_path, path);
            assert_eq!(*stored_size, size);
            seen += 1;
        }
    }
    assert_eq!(seen as u64, index.total_files);
    assert_eq!(index.file_info_by_hash.len() as u64, index.total_files);
}

#[test]
fn location_stats_sum_to_totals() {
    let (_dir, dataset) = canonical_dataset();
    let index = dataset.index().unwrap();

    let files: u64 = index.stats_by_location.values().map(|s| s.files).sum();
    let size: u64 = index.stats_by_location.values().map(|s| s.size).sum();
    assert_eq!(files, index.total_files);
    assert_eq!(size, index.total_size);
}

#[test]
fn rebuilding_is_deterministic() {
    let (dir, dataset) = canonical_dataset();
    let first = dataset.index().unwrap().clone();

    let registry = LocationRegistry::load(dir.path()).unwrap();
    let mut second = build_index(&registry, dataset.schema()).unwrap();
    // Timestamps differ between builds; everything else must not.
    second.last_updated = first.last_updated;
    assert_eq!(first, second);
}

#[test]
fn dataset_with_only_engine_dir_is_empty() {
    let dir = tempfile::TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join(".blackbird")).unwrap();

    let mut dataset = Dataset::open(dir.path()).unwrap();
    *dataset.schema_mut() = canonical_schema();
    dataset.reindex().unwrap();
    let index = dataset.index().unwrap();
    assert_eq!(index.total_files, 0);
    assert!(index.album_by_artist.is_empty());
}
