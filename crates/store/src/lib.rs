//! Sluice store: the shared table registry, catalog discovery that keeps it fresh,
//! and the ingest processor that evolves tables as documents arrive.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod clock;
pub mod connector;
pub mod discovery;
pub mod ingest;
pub mod memory;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connector::{Connector, Row};
pub use discovery::{
    spawn_discovery, DiscoveryError, DiscoveryHandle, TableDiscovery, COMMON_TABLE,
    INDEX_NAME_COLUMN, MANIFEST_BUCKET, STALENESS,
};
pub use ingest::{FrequencyPromoter, IngestError, IngestProcessor, IngestReport};
pub use memory::{CatalogColumn, CatalogTable, MemoryCatalog};
pub use registry::Registry;
