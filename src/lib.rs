//! filedock: a date-partitioned file depot.
//!
//! Uploaded files land under `<root>/<relative_path>/<YYYY-MM-DD>/` and are
//! tracked in a JSON metadata document kept next to them. The [`depot`]
//! module is the storage core, [`gateway`] puts it behind HTTP and
//! [`config`] wires both from a TOML file.

pub mod config;
pub mod depot;
pub mod gateway;

pub use config::Config;
pub use depot::{DepotError, DepotResult, FileDepot};
