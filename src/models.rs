//! Data models for items, metadata and workflow items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity type of an item, e.g. `Publication` or `OrgUnit`
pub const RELATIONSHIP_TYPE: &str = "relationship.type";

/// Review decision set by CONCYTEC
pub const CONCYTEC_FEEDBACK: &str = "perucris.concytec.feedback";

/// Free-text comment accompanying the review decision
pub const CONCYTEC_COMMENT: &str = "perucris.concytec.comment";

/// Lifecycle state of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Workspace,
    Workflow,
    Archived,
    Withdrawn,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Workspace => "workspace",
            ItemState::Workflow => "workflow",
            ItemState::Archived => "archived",
            ItemState::Withdrawn => "withdrawn",
        }
    }

    /// Installed items are visible to discovery as plain items
    pub fn is_installed(&self) -> bool {
        matches!(self, ItemState::Archived | ItemState::Withdrawn)
    }
}

impl std::str::FromStr for ItemState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workspace" => Ok(ItemState::Workspace),
            "workflow" => Ok(ItemState::Workflow),
            "archived" => Ok(ItemState::Archived),
            "withdrawn" => Ok(ItemState::Withdrawn),
            _ => Err(format!("Invalid item state: {}", s)),
        }
    }
}

/// A single metadata value of an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataValue {
    /// `schema.element` or `schema.element.qualifier`
    pub field: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: i32,
    #[serde(default)]
    pub place: i32,
}

fn default_confidence() -> i32 {
    -1
}

impl MetadataValue {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            authority: None,
            confidence: default_confidence(),
            place: 0,
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self.confidence = 600;
        self
    }
}

/// A repository item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<Uuid>,
    pub state: ItemState,
    pub metadata: Vec<MetadataValue>,
    pub last_modified: DateTime<Utc>,
}

impl Item {
    /// First value of the given field, in place order
    pub fn first_value(&self, field: &str) -> Option<&str> {
        self.metadata
            .iter()
            .filter(|m| m.field == field)
            .min_by_key(|m| m.place)
            .map(|m| m.value.as_str())
    }

    pub fn relationship_type(&self) -> Option<&str> {
        self.first_value(RELATIONSHIP_TYPE)
    }

    /// Replace every authority equal to `from` with `to`, returning the number of values changed
    pub fn replace_authority(&mut self, from: &str, to: &str) -> usize {
        let mut changed = 0;
        for value in self.metadata.iter_mut() {
            if value.authority.as_deref() == Some(from) {
                value.authority = Some(to.to_string());
                changed += 1;
            }
        }
        changed
    }
}

/// An item currently under review in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowItem {
    pub id: Uuid,
    pub item_id: Uuid,
    pub collection_id: Uuid,
    pub step_id: String,
    pub action_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pairing between a directorio item and its institution item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowCopyLink {
    pub directorio_item_id: Uuid,
    pub institution_item_id: Uuid,
}

impl ShadowCopyLink {
    /// The other end of the link, if `item_id` is one of its ends
    pub fn other(&self, item_id: Uuid) -> Option<Uuid> {
        if item_id == self.directorio_item_id {
            Some(self.institution_item_id)
        } else if item_id == self.institution_item_id {
            Some(self.directorio_item_id)
        } else {
            None
        }
    }
}

/// Request to set the review decision of an item
#[derive(Debug, Deserialize)]
pub struct SetFeedbackRequest {
    pub feedback: crate::feedback::ConcytecFeedback,
    pub comment: Option<String>,
}
