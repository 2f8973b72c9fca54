//! CONCYTEC review decisions
//!
//! The reviewing body records its decision on the directorio item. The unlock
//! action copies it, by value, onto the paired institution item.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Result, WorkflowError};
use crate::models::{Item, CONCYTEC_COMMENT, CONCYTEC_FEEDBACK};
use crate::services::MetadataRepository;

/// Review decision attached to an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConcytecFeedback {
    /// No decision recorded
    #[default]
    None,
    Approve,
    Reject,
    /// Accepted with requested corrections, described by the comment
    Correction,
}

impl ConcytecFeedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcytecFeedback::None => "NONE",
            ConcytecFeedback::Approve => "APPROVE",
            ConcytecFeedback::Reject => "REJECT",
            ConcytecFeedback::Correction => "CORRECTION",
        }
    }

    pub fn is_none(&self) -> bool {
        *self == ConcytecFeedback::None
    }
}

impl std::str::FromStr for ConcytecFeedback {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(ConcytecFeedback::None),
            "APPROVE" => Ok(ConcytecFeedback::Approve),
            "REJECT" => Ok(ConcytecFeedback::Reject),
            "CORRECTION" => Ok(ConcytecFeedback::Correction),
            _ => Err(format!("Invalid CONCYTEC feedback: {}", s)),
        }
    }
}

/// Reads and writes the review decision and comment of items
#[derive(Clone)]
pub struct FeedbackStore {
    metadata: Arc<dyn MetadataRepository>,
}

impl FeedbackStore {
    pub fn new(metadata: Arc<dyn MetadataRepository>) -> Self {
        Self { metadata }
    }

    /// Decision recorded on a loaded item; missing means [`ConcytecFeedback::None`]
    pub fn feedback(item: &Item) -> Result<ConcytecFeedback> {
        match item.first_value(CONCYTEC_FEEDBACK) {
            Some(value) => value.parse().map_err(|e| {
                WorkflowError::IllegalArgument(format!("Item {}: {}", item.id, e))
            }),
            None => Ok(ConcytecFeedback::None),
        }
    }

    pub fn comment(item: &Item) -> Option<&str> {
        item.first_value(CONCYTEC_COMMENT)
    }

    pub async fn set_feedback(
        &self,
        context: &Context,
        item_id: Uuid,
        feedback: ConcytecFeedback,
    ) -> Result<()> {
        self.metadata
            .set_value(context, item_id, CONCYTEC_FEEDBACK, feedback.as_str())
            .await
    }

    pub async fn set_comment(&self, context: &Context, item_id: Uuid, comment: &str) -> Result<()> {
        self.metadata
            .set_value(context, item_id, CONCYTEC_COMMENT, comment)
            .await
    }

    /// Record a decision with an optional comment; a blank comment clears the previous one
    pub async fn record(
        &self,
        context: &Context,
        item_id: Uuid,
        feedback: ConcytecFeedback,
        comment: Option<&str>,
    ) -> Result<()> {
        self.set_feedback(context, item_id, feedback).await?;
        match comment.map(str::trim).filter(|c| !c.is_empty()) {
            Some(comment) => self.set_comment(context, item_id, comment).await,
            None => self.metadata.clear_field(context, item_id, CONCYTEC_COMMENT).await,
        }
    }
}
