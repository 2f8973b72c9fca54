//! Forward-reference authority rewriting
//!
//! Items submitted before the item they point at exists carry a placeholder
//! authority `REFERENCE::SHADOW::<uuid>`, where the uuid is the institution
//! item. Once the directorio item is installed, those placeholders are
//! repointed to its id.

use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::Context;
use crate::discovery::{DiscoverQuery, DiscoveryQueryRunner, FilterQuery, IndexableType};
use crate::error::{Result, WorkflowError};
use crate::models::{Item, RELATIONSHIP_TYPE};
use crate::services::ItemRepository;

/// Prefix of authorities that refer to an item not created yet
pub const REFERENCE_PREFIX: &str = "REFERENCE::";

/// Placeholder authority anticipating an item through its shadow copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowReference(pub Uuid);

impl ShadowReference {
    const PREFIX: &'static str = "REFERENCE::SHADOW::";

    pub fn parse(authority: &str) -> Option<Self> {
        authority
            .strip_prefix(Self::PREFIX)
            .and_then(|id| Uuid::parse_str(id).ok())
            .map(ShadowReference)
    }
}

impl fmt::Display for ShadowReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RewriteSummary {
    /// Items returned by the index
    pub scanned: usize,
    /// Items whose metadata actually changed
    pub updated: usize,
}

pub struct AuthorityRewriter {
    items: Arc<dyn ItemRepository>,
    discovery: Arc<dyn DiscoveryQueryRunner>,
}

impl AuthorityRewriter {
    pub fn new(items: Arc<dyn ItemRepository>, discovery: Arc<dyn DiscoveryQueryRunner>) -> Self {
        Self { items, discovery }
    }

    /// Installed items carrying `placeholder`, scoped to the relationship type of `item`
    pub fn forward_reference_query(item: &Item, placeholder: &str) -> Result<DiscoverQuery> {
        let relationship_type = item.relationship_type().ok_or_else(|| {
            WorkflowError::IllegalArgument(format!(
                "The given item has no {}: {}",
                RELATIONSHIP_TYPE, item.id
            ))
        })?;

        Ok(DiscoverQuery::new()
            .with_dso_type(IndexableType::Item)
            .with_filter(FilterQuery::Authority {
                value: placeholder.to_string(),
            })
            .with_filter(FilterQuery::Metadata {
                field: RELATIONSHIP_TYPE.to_string(),
                value: relationship_type.to_string(),
            }))
    }

    /// Replace `placeholder` with the id of `installed_item` wherever it is used.
    ///
    /// Modified items are written in one batch once the scan has finished, so a
    /// failing scan leaves every item untouched. Running it again after success
    /// changes nothing.
    pub async fn rewrite_forward_references(
        &self,
        context: &Context,
        installed_item: &Item,
        placeholder: &str,
    ) -> Result<RewriteSummary> {
        let query = Self::forward_reference_query(installed_item, placeholder)?;
        let authority = installed_item.id.to_string();

        let mut summary = RewriteSummary::default();
        let mut modified = Vec::new();
        let mut stream = self.discovery.iterate(query);

        while let Some(item_id) = stream.next().await {
            let item_id = item_id?;
            summary.scanned += 1;

            let Some(mut item) = self.items.find_item(context, item_id).await? else {
                tracing::warn!(item_id = %item_id, "indexed item no longer exists, skipping");
                continue;
            };
            if item.replace_authority(placeholder, &authority) > 0 {
                modified.push(item);
            }
        }

        summary.updated = modified.len();
        self.items.update_items(context, &modified).await?;

        tracing::info!(
            item_id = %installed_item.id,
            placeholder = %placeholder,
            scanned = summary.scanned,
            updated = summary.updated,
            "forward references rewritten"
        );
        Ok(summary)
    }
}
