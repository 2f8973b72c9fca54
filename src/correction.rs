//! Correction items replacing already installed items

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Result, WorkflowError};
use crate::models::{Item, MetadataValue, WorkflowItem, CONCYTEC_COMMENT, CONCYTEC_FEEDBACK, RELATIONSHIP_TYPE};
use crate::services::{ItemRepository, LinkRepository};

#[derive(Clone)]
pub struct ItemCorrectionService {
    items: Arc<dyn ItemRepository>,
    links: Arc<dyn LinkRepository>,
}

impl ItemCorrectionService {
    pub fn new(items: Arc<dyn ItemRepository>, links: Arc<dyn LinkRepository>) -> Self {
        Self { items, links }
    }

    /// The installed item that `item` corrects, if it is a correction
    pub async fn get_corrected_item(&self, context: &Context, item: &Item) -> Result<Option<Item>> {
        let Some(original_id) = self.links.find_corrected_item_id(context, item.id).await? else {
            return Ok(None);
        };

        self.items
            .find_item(context, original_id)
            .await?
            .map(Some)
            .ok_or_else(|| {
                WorkflowError::InvalidState(format!(
                    "Item {} corrects missing item {}",
                    item.id, original_id
                ))
            })
    }

    pub async fn create_correction(&self, context: &Context, correction: &Item, original: &Item) -> Result<()> {
        if !original.state.is_installed() {
            return Err(WorkflowError::BadRequest(format!(
                "Item {} is not installed and cannot be corrected",
                original.id
            )));
        }
        self.links
            .create_correction_link(context, correction.id, original.id)
            .await
    }

    /// Copy the correction's content onto the original and discard the correction
    pub async fn replace_correction_item_with_native(
        &self,
        context: &Context,
        workflow_item: &WorkflowItem,
    ) -> Result<Item> {
        let correction = self
            .items
            .find_item(context, workflow_item.item_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Item {} not found", workflow_item.item_id)))?;

        let mut original = self
            .get_corrected_item(context, &correction)
            .await?
            .ok_or_else(|| {
                WorkflowError::InvalidState(format!("Item {} is not a correction", correction.id))
            })?;

        if original.relationship_type().is_none() {
            return Err(WorkflowError::IllegalArgument(format!(
                "The item to correct has no {}: {}",
                RELATIONSHIP_TYPE, original.id
            )));
        }

        original.metadata = correction
            .metadata
            .iter()
            .filter(|m| !is_review_field(m))
            .cloned()
            .collect();
        self.items.update_items(context, std::slice::from_ref(&original)).await?;
        self.items.delete_item(context, correction.id).await?;

        tracing::info!(
            original_item_id = %original.id,
            correction_item_id = %correction.id,
            "correction applied to original item"
        );
        Ok(original)
    }
}

fn is_review_field(value: &MetadataValue) -> bool {
    value.field == CONCYTEC_FEEDBACK || value.field == CONCYTEC_COMMENT
}
