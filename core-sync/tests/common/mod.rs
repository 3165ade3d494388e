//! Shared test fixtures: a canonical multi-artist dataset on disk and an
//! in-memory mock remote serving it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use walkdir::WalkDir;

use core_dataset::{ComponentDef, Dataset, DatasetIndex, DatasetSchema};
use provider_webdav::{RemoteEntry, RemoteStorage, TransportError};

pub fn component(pattern: &str) -> ComponentDef {
    ComponentDef {
        pattern: pattern.to_string(),
        multiple: false,
        description: None,
    }
}

pub fn canonical_schema() -> DatasetSchema {
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

pub fn write_component(dir: &Path, base: &str, component: &str) {
    std::fs::create_dir_all(dir).unwrap();
    let (name, body): (String, &[u8]) = match component {
        "instrumental" => (format!("{}_instrumental.mp3", base), b"mp3!"),
        "vocals" => (format!("{}_vocals_noreverb.mp3", base), b"mp3!"),
        "mir" => (format!("{}.mir.json", base), b"{}"),
        "caption" => (format!("{}_caption.txt", base), b"txt!"),
        other => panic!("unknown component {}", other),
    };
    std::fs::write(dir.join(name), body).unwrap();
}

/// The canonical dataset: Artist_A with 2 albums / 5 complete tracks,
/// Artist_B with one multi-CD album (CD1: 2 tracks, CD2: 1), Artist_C with
/// 4 tracks of which 2 lack vocals and caption. 44 files in total.
pub fn build_canonical(root: &Path) {
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

/// Build the canonical dataset at `root` and index it.
pub fn canonical_origin(root: &Path) -> Dataset {
    build_canonical(root);
    let mut dataset = Dataset::open(root).unwrap();
    *dataset.schema_mut() = canonical_schema();
    dataset.save_schema().unwrap();
    dataset.reindex().unwrap();
    dataset
}

/// In-memory remote origin with per-file download fault injection.
pub struct MockRemote {
    schema: DatasetSchema,
    index: DatasetIndex,
    files: BTreeMap<String, Bytes>,
    /// remote_rel → remaining failures (`u32::MAX` = fail forever).
    faults: Mutex<HashMap<String, u32>>,
    pub download_calls: AtomicU64,
    pub uploads: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MockRemote {
    /// Snapshot an indexed dataset: its schema, index, and file contents.
    pub fn from_origin(origin: &Dataset) -> Self {
        let mut files = BTreeMap::new();
        for entry in WalkDir::new(origin.root())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry.path().strip_prefix(origin.root()).unwrap();
            if rel.starts_with(".blackbird") {
                continue;
            }
            let rel = rel.to_str().unwrap().replace('\\', "/");
            files.insert(rel, Bytes::from(std::fs::read(entry.path()).unwrap()));
        }

        Self {
            schema: origin.schema().clone(),
            index: origin.index().unwrap().clone(),
            files,
            faults: Mutex::new(HashMap::new()),
            download_calls: AtomicU64::new(0),
            uploads: Mutex::new(BTreeMap::new()),
        }
    }

    /// Make the next `times` downloads of this file fail with a 503.
    pub fn fail_download(&self, remote_rel: &str, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .insert(remote_rel.to_string(), times);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn uploaded_names(&self) -> Vec<String> {
        self.uploads.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl RemoteStorage for MockRemote {
    fn source(&self) -> String {
        "mock://origin/".to_string()
    }

    async fn fetch_schema(&self) -> provider_webdav::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.schema).unwrap()))
    }

    async fn fetch_index(&self) -> provider_webdav::Result<Bytes> {
        Ok(Bytes::from(self.index.to_bytes().unwrap()))
    }

    async fn list(&self, remote_dir: &str) -> provider_webdav::Result<Vec<RemoteEntry>> {
        let prefix = if remote_dir.is_empty() {
            String::new()
        } else {
            format!("{}/", remote_dir.trim_matches('/'))
        };
        Ok(self
            .files
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, data)| RemoteEntry {
                path: path.clone(),
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
                is_dir: false,
                size: Some(data.len() as u64),
            })
            .collect())
    }

    async fn download(
        &self,
        remote_rel: &str,
        local_abs: &Path,
    ) -> provider_webdav::Result<u64> {
        self.download_calls.fetch_add(1, Ordering::Relaxed);

        {
            let mut faults = self.faults.lock().unwrap();
            if let Some(remaining) = faults.get_mut(remote_rel) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(TransportError::Status {
                        status: 503,
                        url: format!("mock://origin/{}", remote_rel),
                    });
                }
            }
        }

        let data = self
            .files
            .get(remote_rel)
            .ok_or_else(|| TransportError::Status {
                status: 404,
                url: format!("mock://origin/{}", remote_rel),
            })?;
        if let Some(parent) = local_abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local_abs, data)?;
        Ok(data.len() as u64)
    }

    async fn upload(&self, local_abs: &Path, remote_rel: &str) -> provider_webdav::Result<()> {
        let data = std::fs::read(local_abs)?;
        self.uploads
            .lock()
            .unwrap()
            .insert(remote_rel.to_string(), data);
        Ok(())
    }

    async fn check(&self) -> provider_webdav::Result<()> {
        Ok(())
    }
}

/// A fresh empty destination dataset.
pub fn empty_destination(root: &Path) -> Dataset {
    Dataset::open(root).unwrap()
}

/// Count data files (excluding `.blackbird`) under a root.
pub fn count_files(root: &Path) -> usize {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            !e.path()
                .strip_prefix(root)
                .unwrap()
                .starts_with(".blackbird")
        })
        .count()
}
