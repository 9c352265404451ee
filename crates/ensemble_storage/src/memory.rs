//! In-memory registry.

use crate::registry::{ClaimOutcome, DataRecord, RecordState, Registry, RegistryError, RegistryResult};
use async_trait::async_trait;
use ensemble_core::{DataDescription, Service};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Stored services
    pub service_count: usize,
    /// Stored data records
    pub data_count: usize,
    /// Claims currently held
    pub active_claims: usize,
    /// Claims won
    pub claims_won: u64,
    /// Claims lost
    pub claims_lost: u64,
}

#[derive(Default)]
struct Inner {
    services: IndexMap<String, Service>,
    data: HashMap<String, DataRecord>,
    claims: HashSet<String>,
    claims_won: u64,
    claims_lost: u64,
}

/// Registry held entirely in memory
///
/// Every operation takes the single lock, so claim-and-put is atomic per
/// `dataId`. Nothing survives the process.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: RwLock<Inner>,
}

impl MemoryRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every service of `source`, with no data records or claims
    ///
    /// Lets a dry run plan and dispatch against real registrations without
    /// writing records into `source`.
    ///
    /// # Errors
    ///
    /// Returns error if `source` cannot list its services
    pub async fn with_services_from(source: &dyn Registry) -> RegistryResult<Self> {
        let registry = Self::new();
        {
            let mut inner = registry.inner.write().await;
            for service in source.list_services().await? {
                inner.services.insert(service.name.clone(), service);
            }
        }
        Ok(registry)
    }

    /// Current statistics
    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;
        RegistryStats {
            service_count: inner.services.len(),
            data_count: inner.data.len(),
            active_claims: inner.claims.len(),
            claims_won: inner.claims_won,
            claims_lost: inner.claims_lost,
        }
    }

    /// Drop every data record and claim, keeping services
    pub async fn clear_data(&self) {
        let mut inner = self.inner.write().await;
        inner.data.clear();
        inner.claims.clear();
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn put_service(&self, service: &Service) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        inner.services.insert(service.name.clone(), service.clone());
        Ok(())
    }

    async fn get_service(&self, name: &str) -> RegistryResult<Option<Service>> {
        Ok(self.inner.read().await.services.get(name).cloned())
    }

    async fn list_services(&self) -> RegistryResult<Vec<Service>> {
        Ok(self.inner.read().await.services.values().cloned().collect())
    }

    async fn put_data(&self, description: &DataDescription) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .data
            .entry(description.data_id.clone())
            .or_insert_with(|| DataRecord::pending(description.clone()));
        Ok(())
    }

    async fn get_data(&self, data_id: &str) -> RegistryResult<Option<DataRecord>> {
        Ok(self.inner.read().await.data.get(data_id).cloned())
    }

    async fn set_state(&self, data_id: &str, state: RecordState) -> RegistryResult<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .data
            .get_mut(data_id)
            .ok_or_else(|| RegistryError::NotFound(data_id.to_string()))?;
        record.state = state;
        Ok(())
    }

    async fn claim(&self, data_id: &str) -> RegistryResult<ClaimOutcome> {
        let mut inner = self.inner.write().await;
        if inner.claims.insert(data_id.to_string()) {
            inner.claims_won += 1;
            Ok(ClaimOutcome::Won)
        } else {
            inner.claims_lost += 1;
            Ok(ClaimOutcome::Lost)
        }
    }

    async fn is_claimed(&self, data_id: &str) -> RegistryResult<bool> {
        Ok(self.inner.read().await.claims.contains(data_id))
    }

    async fn release(&self, data_id: &str) -> RegistryResult<()> {
        self.inner.write().await.claims.remove(data_id);
        Ok(())
    }
}
