//! Shadow-copy pairing between directorio and institution items

use std::sync::Arc;

use crate::context::Context;
use crate::error::{Result, WorkflowError};
use crate::models::{Item, ShadowCopyLink};
use crate::services::{ItemRepository, LinkRepository};

/// Resolves the item paired with a given item in the other workflow
#[derive(Clone)]
pub struct ShadowCopyResolver {
    items: Arc<dyn ItemRepository>,
    links: Arc<dyn LinkRepository>,
}

impl ShadowCopyResolver {
    pub fn new(items: Arc<dyn ItemRepository>, links: Arc<dyn LinkRepository>) -> Self {
        Self { items, links }
    }

    /// The paired item, from either end of the link; `None` for independent submissions
    pub async fn find_paired_item(&self, context: &Context, item: &Item) -> Result<Option<Item>> {
        let Some(link) = self.links.find_shadow_copy_link(context, item.id).await? else {
            return Ok(None);
        };
        let Some(paired_id) = link.other(item.id) else {
            return Ok(None);
        };

        let paired = self.items.find_item(context, paired_id).await?;
        if paired.is_none() {
            tracing::warn!(item_id = %item.id, paired_id = %paired_id, "shadow copy link points to a missing item");
        }
        Ok(paired)
    }

    /// Pair a directorio item with its institution item
    pub async fn link(&self, context: &Context, directorio: &Item, institution: &Item) -> Result<ShadowCopyLink> {
        if directorio.id == institution.id {
            return Err(WorkflowError::BadRequest(format!(
                "Item {} cannot be its own shadow copy",
                directorio.id
            )));
        }

        for item in [directorio, institution] {
            if let Some(existing) = self.links.find_shadow_copy_link(context, item.id).await? {
                return Err(WorkflowError::InvalidState(format!(
                    "Item {} is already paired ({} / {})",
                    item.id, existing.directorio_item_id, existing.institution_item_id
                )));
            }
        }

        let link = ShadowCopyLink {
            directorio_item_id: directorio.id,
            institution_item_id: institution.id,
        };
        self.links.create_shadow_copy_link(context, link).await?;

        tracing::info!(
            directorio_item_id = %directorio.id,
            institution_item_id = %institution.id,
            "shadow copy linked"
        );
        Ok(link)
    }
}
