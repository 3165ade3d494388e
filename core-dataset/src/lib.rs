//! # Dataset Model
//!
//! The data model shared by every Blackbird subsystem:
//!
//! - **Location Registry** (`locations`): persisted mapping of location name
//!   to absolute root path; resolves symbolic paths
//! - **Schema** (`schema`): declarative set of components (glob pattern,
//!   multiple flag, description) with discovery from existing files
//! - **Index** (`index`): in-memory, disk-persisted catalog of tracks and
//!   component files keyed by symbolic path
//! - **Indexer** (`indexer`): walks every location, matches files against the
//!   schema, produces a fresh index
//! - **Dataset** (`dataset`): owner type composing the above; mutation flows
//!   one way, none of the components reaches back up
//!
//! Symbolic paths have the form `LocationName/Artist/Album[/CD]/file` and
//! resolve deterministically through the location registry.

pub mod dataset;
pub mod error;
pub mod hash;
pub mod index;
pub mod indexer;
pub mod locations;
pub mod schema;

pub use dataset::{Dataset, DatasetStats, FindFilter};
pub use error::{DatasetError, Result};
pub use hash::path_hash;
pub use index::{DatasetIndex, LocationStats, TrackInfo};
pub use indexer::build_index;
pub use locations::LocationRegistry;
pub use schema::{ComponentDef, ComponentMatch, DatasetSchema, SchemaMatcher};

/// Directory under the primary root that holds all engine artifacts
/// (schema, locations, index, operation state files).
pub const BLACKBIRD_DIR: &str = ".blackbird";

/// File name of the persisted schema inside [`BLACKBIRD_DIR`].
pub const SCHEMA_FILE: &str = "schema.json";

/// File name of the persisted location registry inside [`BLACKBIRD_DIR`].
pub const LOCATIONS_FILE: &str = "locations.json";

/// File name of the persisted binary index inside [`BLACKBIRD_DIR`].
pub const INDEX_FILE: &str = "index.bin";

/// Name of the location every dataset starts with.
pub const DEFAULT_LOCATION: &str = "Main";
