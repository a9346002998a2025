//! Depot: the storage core.
//!
//! Handles safe path resolution under the storage root, the JSON metadata
//! store, archive inspection/extraction and the upload/query/delete
//! lifecycle that ties them together.

pub mod archive;
pub mod error;
pub mod index;
pub mod paths;
pub mod preview;
pub mod schema;
pub mod storage;

pub use archive::{ArchiveKind, ArchiveSummary, ExtractedFile, ExtractedTree};
pub use error::{DepotError, DepotResult, ErrorKind};
pub use index::MetadataStore;
pub use paths::PathResolver;
pub use schema::{FileQuery, FileRecord, QueryPage, SortKey, SortOrder, UploadRequest};
pub use storage::{DepotOptions, FileDepot, Preview, StoredFile};
