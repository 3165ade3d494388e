use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Location '{0}' already exists")]
    LocationExists(String),

    #[error("Invalid location name '{0}': names must be non-empty and must not contain '/'")]
    LocationNameInvalid(String),

    #[error("Path '{0}' does not exist or is not a directory")]
    PathInvalid(PathBuf),

    #[error("Location '{0}' is referenced by the index; pass force to remove it anyway")]
    LocationInUse(String),

    #[error("Cannot remove the last remaining location '{0}'")]
    LastLocation(String),

    #[error("Unknown location '{0}'")]
    UnknownLocation(String),

    #[error("Malformed symbolic path '{0}': expected <Location>/<relative/path>")]
    MalformedSymbolic(String),

    #[error("Component '{0}' already exists in the schema")]
    ComponentExists(String),

    #[error("Invalid component name '{0}'")]
    ComponentNameInvalid(String),

    #[error("Pattern '{new}' is ambiguous with existing component '{existing}' ('{existing_pattern}')")]
    PatternAmbiguous {
        new: String,
        existing: String,
        existing_pattern: String,
    },

    #[error("Invalid glob pattern '{pattern}': {message}")]
    PatternInvalid { pattern: String, message: String },

    #[error("Schema conflict for component '{name}': local pattern '{local}' != remote pattern '{remote}'")]
    SchemaConflict {
        name: String,
        local: String,
        remote: String,
    },

    #[error("Unknown component '{0}'")]
    UnknownComponent(String),

    #[error("Index file has unsupported format version {found} (supported: {supported})")]
    IndexVersion { found: u16, supported: u16 },

    #[error("Index file is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Index not loaded; run reindex first")]
    IndexMissing,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatasetError>;
