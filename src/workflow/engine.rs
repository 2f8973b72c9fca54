//! Step engine moving workflow items through their workflow

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{ActionResult, Step, Workflow, WorkflowActionConfig, WorkflowStepRunner};
use crate::context::Context;
use crate::error::{Result, WorkflowError};
use crate::models::WorkflowItem;
use crate::services::{ItemRepository, WorkflowItemRepository};

/// What processing an outcome did to a workflow item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowProgress {
    /// Moved to another action or step
    Advanced { step_id: String, action_id: String },
    /// Last step completed, the item was installed
    Archived { item_id: Uuid },
    /// Cancelled action, the workflow item stays where the action left it
    Unchanged,
    /// The action already finalized the workflow item
    Finalized,
}

pub struct WorkflowEngine {
    items: Arc<dyn ItemRepository>,
    workflow_items: Arc<dyn WorkflowItemRepository>,
}

impl WorkflowEngine {
    pub fn new(items: Arc<dyn ItemRepository>, workflow_items: Arc<dyn WorkflowItemRepository>) -> Self {
        Self {
            items,
            workflow_items,
        }
    }

    /// Start the collection's workflow for an item at its first step
    pub async fn start(
        &self,
        context: &Context,
        workflow: &Workflow,
        item_id: Uuid,
        collection_id: Uuid,
    ) -> Result<WorkflowItem> {
        let step = workflow.step(&workflow.first_step)?;
        let action = step.first_action()?;
        let workflow_item = self
            .workflow_items
            .start_workflow(context, item_id, collection_id, &step.id, &action.id)
            .await?;

        tracing::info!(
            workflow_item_id = %workflow_item.id,
            item_id = %item_id,
            workflow = %workflow.id,
            step = %step.id,
            "workflow started"
        );
        Ok(workflow_item)
    }
}

#[async_trait]
impl WorkflowStepRunner for WorkflowEngine {
    async fn process_outcome(
        &self,
        context: &Context,
        workflow: &Workflow,
        step: &Step,
        action: &WorkflowActionConfig,
        result: ActionResult,
        workflow_item: &WorkflowItem,
    ) -> Result<WorkflowProgress> {
        let outcome = match result {
            ActionResult::Cancel => {
                tracing::debug!(workflow_item_id = %workflow_item.id, "action cancelled, no transition");
                return Ok(WorkflowProgress::Unchanged);
            }
            ActionResult::Outcome(outcome) => outcome,
        };

        // Installing or deleting inside the action removes the workflow item.
        let current = match self
            .workflow_items
            .find_workflow_item(context, workflow_item.id)
            .await?
        {
            Some(current) => current,
            None => return Ok(WorkflowProgress::Finalized),
        };

        if current.step_id != step.id || current.action_id != action.id {
            return Err(WorkflowError::InvalidState(format!(
                "Workflow item {} is at {}/{}, not {}/{}",
                current.id, current.step_id, current.action_id, step.id, action.id
            )));
        }

        if outcome == super::OUTCOME_COMPLETE {
            if let Some(next_action) = step.next_action(&action.id) {
                self.workflow_items
                    .move_to(context, current.id, &step.id, &next_action.id)
                    .await?;
                return Ok(WorkflowProgress::Advanced {
                    step_id: step.id.clone(),
                    action_id: next_action.id.clone(),
                });
            }
        }

        match workflow.next_step(step, outcome)? {
            Some(next_step) => {
                let next_action = next_step.first_action()?;
                self.workflow_items
                    .move_to(context, current.id, &next_step.id, &next_action.id)
                    .await?;
                tracing::info!(
                    workflow_item_id = %current.id,
                    from = %step.id,
                    to = %next_step.id,
                    "workflow item advanced"
                );
                Ok(WorkflowProgress::Advanced {
                    step_id: next_step.id.clone(),
                    action_id: next_action.id.clone(),
                })
            }
            None => {
                let item = self.items.install_item(context, &current).await?;
                tracing::info!(workflow_item_id = %current.id, item_id = %item.id, "workflow item archived");
                Ok(WorkflowProgress::Archived { item_id: item.id })
            }
        }
    }

    async fn delete_workflow(&self, context: &Context, workflow_item: &WorkflowItem) -> Result<()> {
        // Takes the workflow item and any correction link with it
        self.items.delete_item(context, workflow_item.item_id).await?;
        tracing::info!(
            workflow_item_id = %workflow_item.id,
            item_id = %workflow_item.item_id,
            "workflow deleted"
        );
        Ok(())
    }
}
