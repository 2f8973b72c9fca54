//! Narrow interfaces to the persistence layer
//!
//! The synchronization logic only talks to storage through these traits. The
//! SQLite [`Store`](crate::store::Store) implements all of them. Atomicity of a
//! whole transition comes from building the services on a
//! [`UnitOfWork`](crate::store::UnitOfWork) store.

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::Context;
use crate::discovery::DiscoveryQueryRunner;
use crate::error::Result;
use crate::models::{Item, MetadataValue, ShadowCopyLink, WorkflowItem};

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn find_item(&self, context: &Context, id: Uuid) -> Result<Option<Item>>;

    async fn create_item(
        &self,
        context: &Context,
        collection_id: Option<Uuid>,
        metadata: Vec<MetadataValue>,
    ) -> Result<Item>;

    /// Persist the metadata of all given items atomically
    async fn update_items(&self, context: &Context, items: &[Item]) -> Result<()>;

    /// Archive the item of a workflow item and remove the workflow item
    async fn install_item(&self, context: &Context, workflow_item: &WorkflowItem) -> Result<Item>;

    /// Hide an installed item from public view, keeping it as history
    async fn withdraw_item(&self, context: &Context, id: Uuid) -> Result<Item>;

    /// Remove the item together with its workflow item and correction link
    async fn delete_item(&self, context: &Context, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait MetadataRepository: Send + Sync {
    async fn first_value(&self, context: &Context, item_id: Uuid, field: &str) -> Result<Option<String>>;

    /// Replace all values of `field` with a single value
    async fn set_value(&self, context: &Context, item_id: Uuid, field: &str, value: &str) -> Result<()>;

    async fn clear_field(&self, context: &Context, item_id: Uuid, field: &str) -> Result<()>;
}

#[async_trait]
pub trait WorkflowItemRepository: Send + Sync {
    async fn find_workflow_item(&self, context: &Context, id: Uuid) -> Result<Option<WorkflowItem>>;

    async fn find_by_item(&self, context: &Context, item_id: Uuid) -> Result<Option<WorkflowItem>>;

    async fn start_workflow(
        &self,
        context: &Context,
        item_id: Uuid,
        collection_id: Uuid,
        step_id: &str,
        action_id: &str,
    ) -> Result<WorkflowItem>;

    async fn move_to(
        &self,
        context: &Context,
        id: Uuid,
        step_id: &str,
        action_id: &str,
    ) -> Result<WorkflowItem>;
}

#[async_trait]
pub trait LinkRepository: Send + Sync {
    async fn find_shadow_copy_link(&self, context: &Context, item_id: Uuid) -> Result<Option<ShadowCopyLink>>;

    async fn create_shadow_copy_link(&self, context: &Context, link: ShadowCopyLink) -> Result<()>;

    /// The item that `correction_item_id` corrects
    async fn find_corrected_item_id(&self, context: &Context, correction_item_id: Uuid) -> Result<Option<Uuid>>;

    async fn create_correction_link(
        &self,
        context: &Context,
        correction_item_id: Uuid,
        original_item_id: Uuid,
    ) -> Result<()>;
}

/// The collaborators shared by the synchronization components
#[derive(Clone)]
pub struct Services {
    pub items: Arc<dyn ItemRepository>,
    pub metadata: Arc<dyn MetadataRepository>,
    pub workflow_items: Arc<dyn WorkflowItemRepository>,
    pub links: Arc<dyn LinkRepository>,
    pub discovery: Arc<dyn DiscoveryQueryRunner>,
}

impl Services {
    /// Back every interface with the same store
    pub fn from_store<S>(store: S) -> Self
    where
        S: ItemRepository
            + MetadataRepository
            + WorkflowItemRepository
            + LinkRepository
            + DiscoveryQueryRunner
            + 'static,
    {
        let store = Arc::new(store);
        Self {
            items: store.clone(),
            metadata: store.clone(),
            workflow_items: store.clone(),
            links: store.clone(),
            discovery: store,
        }
    }

    pub fn with_items(mut self, items: Arc<dyn ItemRepository>) -> Self {
        self.items = items;
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn DiscoveryQueryRunner>) -> Self {
        self.discovery = discovery;
        self
    }
}
