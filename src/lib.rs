//! CONCYTEC institutional workflow synchronization

pub mod api;
pub mod authority;
pub mod config;
pub mod context;
pub mod correction;
pub mod discovery;
pub mod error;
pub mod feedback;
pub mod models;
pub mod services;
pub mod shadow;
pub mod store;
pub mod unlock;
pub mod workflow;

use sqlx::SqlitePool;
use std::sync::Arc;

use crate::services::Services;
use crate::store::Store;
use crate::workflow::WorkflowRegistry;

/// Application state shared across handlers
pub struct AppState {
    pub store: Store,
    /// Services outside any unit of work, for reads and single writes
    pub services: Services,
    pub registry: Arc<WorkflowRegistry>,
}

impl AppState {
    pub fn new(pool: SqlitePool, registry: WorkflowRegistry) -> Arc<Self> {
        Self::with_store(Store::new(pool), registry)
    }

    pub fn with_store(store: Store, registry: WorkflowRegistry) -> Arc<Self> {
        Arc::new(Self {
            services: Services::from_store(store.clone()),
            store,
            registry: Arc::new(registry),
        })
    }
}
