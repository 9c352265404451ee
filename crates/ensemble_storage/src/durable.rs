//! File-backed registry on `redb`.
//!
//! Services and data records are stored as JSON values keyed by name and
//! `dataId`. Claims live in their own table; because redb serializes write
//! transactions, a claim is a check-and-insert inside one transaction.

use crate::registry::{ClaimOutcome, DataRecord, RecordState, Registry, RegistryError, RegistryResult};
use async_trait::async_trait;
use chrono::Utc;
use ensemble_core::{DataDescription, Service};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");
const DATA: TableDefinition<&str, &[u8]> = TableDefinition::new("data");
const CLAIMS: TableDefinition<&str, i64> = TableDefinition::new("claims");

fn backend(err: impl Into<redb::Error>) -> RegistryError {
    RegistryError::Backend(err.into().to_string())
}

fn write_failed(err: impl Into<redb::Error>) -> RegistryError {
    RegistryError::WriteFailed(err.into().to_string())
}

/// Registry persisted in a single redb file
#[derive(Clone)]
pub struct RedbRegistry {
    db: Arc<Database>,
}

impl RedbRegistry {
    /// Open or create the registry file at `path`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or the tables created
    pub fn open(path: impl AsRef<Path>) -> RegistryResult<Self> {
        let db = Database::create(path.as_ref()).map_err(backend)?;

        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(SERVICES).map_err(backend)?;
            txn.open_table(DATA).map_err(backend)?;
            txn.open_table(CLAIMS).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        tracing::debug!(path = %path.as_ref().display(), "opened registry");
        Ok(Self { db: Arc::new(db) })
    }

    /// Run blocking redb work off the async executor
    async fn blocking<T, F>(&self, f: F) -> RegistryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> RegistryResult<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| RegistryError::Backend(e.to_string()))?
    }
}

fn read_record(db: &Database, data_id: &str) -> RegistryResult<Option<DataRecord>> {
    let txn = db.begin_read().map_err(backend)?;
    let table = txn.open_table(DATA).map_err(backend)?;
    match table.get(data_id).map_err(backend)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
        None => Ok(None),
    }
}

#[async_trait]
impl Registry for RedbRegistry {
    async fn put_service(&self, service: &Service) -> RegistryResult<()> {
        let bytes = serde_json::to_vec(service)?;
        let name = service.name.clone();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(write_failed)?;
            {
                let mut table = txn.open_table(SERVICES).map_err(write_failed)?;
                table.insert(name.as_str(), bytes.as_slice()).map_err(write_failed)?;
            }
            txn.commit().map_err(write_failed)
        })
        .await
    }

    async fn get_service(&self, name: &str) -> RegistryResult<Option<Service>> {
        let name = name.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(SERVICES).map_err(backend)?;
            match table.get(name.as_str()).map_err(backend)? {
                Some(bytes) => Ok(Some(serde_json::from_slice(bytes.value())?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_services(&self) -> RegistryResult<Vec<Service>> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(SERVICES).map_err(backend)?;
            let mut services = Vec::new();
            for entry in table.iter().map_err(backend)? {
                let (_, bytes) = entry.map_err(backend)?;
                services.push(serde_json::from_slice(bytes.value())?);
            }
            Ok(services)
        })
        .await
    }

    async fn put_data(&self, description: &DataDescription) -> RegistryResult<()> {
        let bytes = serde_json::to_vec(&DataRecord::pending(description.clone()))?;
        let data_id = description.data_id.clone();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(write_failed)?;
            {
                let mut table = txn.open_table(DATA).map_err(write_failed)?;
                let exists = table.get(data_id.as_str()).map_err(write_failed)?.is_some();
                if !exists {
                    table.insert(data_id.as_str(), bytes.as_slice()).map_err(write_failed)?;
                }
            }
            txn.commit().map_err(write_failed)
        })
        .await
    }

    async fn get_data(&self, data_id: &str) -> RegistryResult<Option<DataRecord>> {
        let data_id = data_id.to_string();
        self.blocking(move |db| read_record(db, &data_id)).await
    }

    async fn set_state(&self, data_id: &str, state: RecordState) -> RegistryResult<()> {
        let data_id = data_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(write_failed)?;
            {
                let mut table = txn.open_table(DATA).map_err(write_failed)?;
                let mut record: DataRecord = match table.get(data_id.as_str()).map_err(write_failed)? {
                    Some(bytes) => serde_json::from_slice(bytes.value())?,
                    None => return Err(RegistryError::NotFound(data_id.clone())),
                };
                record.state = state;
                let bytes = serde_json::to_vec(&record)?;
                table.insert(data_id.as_str(), bytes.as_slice()).map_err(write_failed)?;
            }
            txn.commit().map_err(write_failed)
        })
        .await
    }

    async fn claim(&self, data_id: &str) -> RegistryResult<ClaimOutcome> {
        let data_id = data_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(write_failed)?;
            let outcome = {
                let mut table = txn.open_table(CLAIMS).map_err(write_failed)?;
                let held = table.get(data_id.as_str()).map_err(write_failed)?.is_some();
                if held {
                    ClaimOutcome::Lost
                } else {
                    table
                        .insert(data_id.as_str(), Utc::now().timestamp_millis())
                        .map_err(write_failed)?;
                    ClaimOutcome::Won
                }
            };
            txn.commit().map_err(write_failed)?;
            Ok(outcome)
        })
        .await
    }

    async fn is_claimed(&self, data_id: &str) -> RegistryResult<bool> {
        let data_id = data_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(backend)?;
            let table = txn.open_table(CLAIMS).map_err(backend)?;
            Ok(table.get(data_id.as_str()).map_err(backend)?.is_some())
        })
        .await
    }

    async fn release(&self, data_id: &str) -> RegistryResult<()> {
        let data_id = data_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(write_failed)?;
            {
                let mut table = txn.open_table(CLAIMS).map_err(write_failed)?;
                table.remove(data_id.as_str()).map_err(write_failed)?;
            }
            txn.commit().map_err(write_failed)
        })
        .await
    }
}
