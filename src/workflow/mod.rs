//! Workflow definitions and step execution
//!
//! A workflow is an ordered list of steps, each made of one or more actions.
//! Definitions are loaded from JSON and resolved per collection through a
//! [`WorkflowFactory`].

pub mod engine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Result, WorkflowError};
use crate::models::WorkflowItem;

pub use engine::{WorkflowEngine, WorkflowProgress};

/// Outcome code that moves a workflow item forward
pub const OUTCOME_COMPLETE: i32 = 0;

/// Step of the institution workflow that waits for the CONCYTEC decision
pub const WAIT_FOR_CONCYTEC_STEP: &str = "waitForConcytecStep";

/// Action of [`WAIT_FOR_CONCYTEC_STEP`]
pub const WAIT_FOR_CONCYTEC_ACTION: &str = "waitForConcytecAction";

/// Result of executing a processing action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "outcome", rename_all = "snake_case")]
pub enum ActionResult {
    Outcome(i32),
    Cancel,
}

impl ActionResult {
    pub fn complete() -> Self {
        ActionResult::Outcome(OUTCOME_COMPLETE)
    }

    pub fn cancel() -> Self {
        ActionResult::Cancel
    }

    pub fn is_complete(&self) -> bool {
        *self == ActionResult::Outcome(OUTCOME_COMPLETE)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionResult::Outcome(OUTCOME_COMPLETE) => "complete",
            ActionResult::Outcome(_) => "outcome",
            ActionResult::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowActionConfig {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub actions: Vec<WorkflowActionConfig>,
    /// Outcome code -> next step id
    #[serde(default)]
    pub outcomes: BTreeMap<i32, String>,
}

impl Step {
    pub fn action_config(&self, action_id: &str) -> Result<&WorkflowActionConfig> {
        self.actions
            .iter()
            .find(|a| a.id == action_id)
            .ok_or_else(|| {
                WorkflowError::Configuration(format!(
                    "Action {} is not configured in step {}",
                    action_id, self.id
                ))
            })
    }

    pub fn first_action(&self) -> Result<&WorkflowActionConfig> {
        self.actions.first().ok_or_else(|| {
            WorkflowError::Configuration(format!("Step {} has no actions", self.id))
        })
    }

    /// Action following `action_id` within this step
    pub fn next_action(&self, action_id: &str) -> Option<&WorkflowActionConfig> {
        let index = self.actions.iter().position(|a| a.id == action_id)?;
        self.actions.get(index + 1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub first_step: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn step(&self, step_id: &str) -> Result<&Step> {
        self.steps.iter().find(|s| s.id == step_id).ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "Step {} is not configured in workflow {}",
                step_id, self.id
            ))
        })
    }

    /// Step reached from `step` with `outcome`, or `None` when the workflow is done
    pub fn next_step(&self, step: &Step, outcome: i32) -> Result<Option<&Step>> {
        if let Some(target) = step.outcomes.get(&outcome) {
            return self.step(target).map(Some);
        }
        if outcome != OUTCOME_COMPLETE {
            return Err(WorkflowError::Configuration(format!(
                "Outcome {} has no target in step {}",
                outcome, step.id
            )));
        }
        let index = self
            .steps
            .iter()
            .position(|s| s.id == step.id)
            .ok_or_else(|| {
                WorkflowError::Configuration(format!(
                    "Step {} does not belong to workflow {}",
                    step.id, self.id
                ))
            })?;
        Ok(self.steps.get(index + 1))
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(WorkflowError::Configuration(format!(
                    "Duplicate step {} in workflow {}",
                    step.id, self.id
                )));
            }
            step.first_action()?;
        }
        self.step(&self.first_step)?;
        for step in &self.steps {
            for target in step.outcomes.values() {
                self.step(target)?;
            }
        }
        Ok(())
    }
}

/// Resolves the workflow governing a collection
pub trait WorkflowFactory: Send + Sync {
    fn get_workflow(&self, collection_id: Uuid) -> Result<Arc<Workflow>>;
}

/// Executes step transitions of the surrounding workflow engine
#[async_trait]
pub trait WorkflowStepRunner: Send + Sync {
    async fn process_outcome(
        &self,
        context: &Context,
        workflow: &Workflow,
        step: &Step,
        action: &WorkflowActionConfig,
        result: ActionResult,
        workflow_item: &WorkflowItem,
    ) -> Result<WorkflowProgress>;

    /// Abort the workflow, deleting the workflow item and its item
    async fn delete_workflow(&self, context: &Context, workflow_item: &WorkflowItem) -> Result<()>;
}

/// An action bound to a workflow step
#[async_trait]
pub trait ProcessingAction: Send + Sync {
    /// Called when a workflow item reaches the action
    fn activate(&self, _context: &Context, _workflow_item: &WorkflowItem) {}

    async fn execute(
        &self,
        context: &Context,
        workflow_item: &WorkflowItem,
        step: &Step,
    ) -> Result<ActionResult>;

    /// User-selectable options of the action
    fn options(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    default_workflow: String,
    #[serde(default)]
    collections: HashMap<Uuid, String>,
    workflows: Vec<Workflow>,
}

/// Workflow definitions keyed by collection
#[derive(Debug, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<Workflow>>,
    collections: HashMap<Uuid, String>,
    default_workflow: String,
}

impl WorkflowRegistry {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(json).map_err(|e| {
            WorkflowError::Configuration(format!("Invalid workflow definition: {}", e))
        })?;

        let mut workflows = HashMap::new();
        for workflow in file.workflows {
            workflow.validate()?;
            let id = workflow.id.clone();
            if workflows.insert(id.clone(), Arc::new(workflow)).is_some() {
                return Err(WorkflowError::Configuration(format!(
                    "Duplicate workflow {}",
                    id
                )));
            }
        }

        let registry = Self {
            workflows,
            collections: file.collections,
            default_workflow: file.default_workflow,
        };
        registry.workflow(&registry.default_workflow)?;
        for workflow_id in registry.collections.values() {
            registry.workflow(workflow_id)?;
        }

        tracing::info!(
            workflows = registry.workflows.len(),
            collections = registry.collections.len(),
            "loaded workflow definitions"
        );
        Ok(registry)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Bind a collection to a workflow
    pub fn assign(&mut self, collection_id: Uuid, workflow_id: &str) -> Result<()> {
        self.workflow(workflow_id)?;
        self.collections.insert(collection_id, workflow_id.to_string());
        Ok(())
    }

    pub fn workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        self.workflows.get(workflow_id).cloned().ok_or_else(|| {
            WorkflowError::Configuration(format!("Workflow {} is not defined", workflow_id))
        })
    }
}

impl WorkflowFactory for WorkflowRegistry {
    fn get_workflow(&self, collection_id: Uuid) -> Result<Arc<Workflow>> {
        let workflow_id = self
            .collections
            .get(&collection_id)
            .unwrap_or(&self.default_workflow);
        self.workflow(workflow_id)
    }
}
