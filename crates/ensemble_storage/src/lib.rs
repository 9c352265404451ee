//! ENSEMBLE Storage
//!
//! Content addressing for chain outputs and the registry backends that
//! record services, data descriptions and submission claims.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod durable;
pub mod memory;
pub mod registry;

pub use address::{
    build_data_description, build_data_description_at, chain_hash, data_id, output_hash, storage_locator,
    LocatorConfig, CHAIN_HASH_DELIMITER, DATA_ID_SEPARATOR, DEFAULT_OUTPUT, DEFAULT_STORAGE_BASE,
};
pub use durable::RedbRegistry;
pub use memory::{MemoryRegistry, RegistryStats};
pub use registry::{ClaimOutcome, DataRecord, RecordState, Registry, RegistryError, RegistryResult};
