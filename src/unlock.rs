//! Action unlocking the institution workflow once CONCYTEC has decided
//!
//! Runs on the directorio item. It hands the decision over to the paired
//! institution item, releases that item from its waiting step, and finalizes
//! the directorio item according to the decision.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::authority::{AuthorityRewriter, ShadowReference};
use crate::context::{Context, ContextMode};
use crate::correction::ItemCorrectionService;
use crate::error::{Result, WorkflowError};
use crate::feedback::{ConcytecFeedback, FeedbackStore};
use crate::models::{Item, WorkflowItem};
use crate::services::Services;
use crate::shadow::ShadowCopyResolver;
use crate::workflow::{
    ActionResult, ProcessingAction, Step, WorkflowEngine, WorkflowFactory, WorkflowProgress, WorkflowStepRunner,
    WAIT_FOR_CONCYTEC_ACTION, WAIT_FOR_CONCYTEC_STEP,
};

/// What one unlock transition did to the directorio workflow item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnlockOutcome {
    pub result: ActionResult,
    pub progress: WorkflowProgress,
}

pub struct UnlockInstitutionAction {
    services: Services,
    resolver: ShadowCopyResolver,
    corrections: ItemCorrectionService,
    feedback: FeedbackStore,
    rewriter: AuthorityRewriter,
    workflow_factory: Arc<dyn WorkflowFactory>,
    workflow_runner: Arc<dyn WorkflowStepRunner>,
}

impl UnlockInstitutionAction {
    pub fn new(
        services: Services,
        workflow_factory: Arc<dyn WorkflowFactory>,
        workflow_runner: Arc<dyn WorkflowStepRunner>,
    ) -> Self {
        Self {
            resolver: ShadowCopyResolver::new(services.items.clone(), services.links.clone()),
            corrections: ItemCorrectionService::new(
                services.items.clone(),
                services.links.clone(),
            ),
            feedback: FeedbackStore::new(services.metadata.clone()),
            rewriter: AuthorityRewriter::new(services.items.clone(), services.discovery.clone()),
            services,
            workflow_factory,
            workflow_runner,
        }
    }

    /// Action advancing workflows through a [`WorkflowEngine`] on the same services
    pub fn with_engine(services: Services, workflow_factory: Arc<dyn WorkflowFactory>) -> Self {
        let engine = Arc::new(WorkflowEngine::new(
            services.items.clone(),
            services.workflow_items.clone(),
        ));
        Self::new(services, workflow_factory, engine)
    }

    /// Execute the action, then let the engine process its result for `workflow_item`.
    ///
    /// Build the action on a [`UnitOfWork`](crate::store::UnitOfWork) store and
    /// commit only after this returns `Ok`. A failure then leaves both items as
    /// they were, and retrying the whole transition is safe.
    pub async fn run(&self, context: &Context, workflow_item: &WorkflowItem) -> Result<UnlockOutcome> {
        let workflow = self.workflow_factory.get_workflow(workflow_item.collection_id)?;
        let step = workflow.step(&workflow_item.step_id)?;
        let action = step.action_config(&workflow_item.action_id)?;

        let result = self.execute(context, workflow_item, step).await?;
        let progress = self
            .workflow_runner
            .process_outcome(context, &workflow, step, action, result, workflow_item)
            .await?;

        Ok(UnlockOutcome { result, progress })
    }

    async fn unlock_institution_workflow(
        &self,
        context: &Context,
        directorio_item: &Item,
        institution_item: &Item,
        feedback: ConcytecFeedback,
    ) -> Result<()> {
        let institution_workflow_item = self
            .services
            .workflow_items
            .find_by_item(context, institution_item.id)
            .await?
            .ok_or_else(|| {
                WorkflowError::InvalidState(format!(
                    "Institution item {} has no active workflow",
                    institution_item.id
                ))
            })?;

        let institution_workflow = self
            .workflow_factory
            .get_workflow(institution_workflow_item.collection_id)?;
        let wait_step = institution_workflow.step(WAIT_FOR_CONCYTEC_STEP)?;
        let wait_action = wait_step.action_config(WAIT_FOR_CONCYTEC_ACTION)?;

        if !feedback.is_none() {
            self.feedback
                .set_feedback(context, institution_item.id, feedback)
                .await?;
            if let Some(comment) = FeedbackStore::comment(directorio_item).filter(|c| !c.trim().is_empty()) {
                self.feedback
                    .set_comment(context, institution_item.id, comment)
                    .await?;
            }
            tracing::info!(
                directorio_item_id = %directorio_item.id,
                institution_item_id = %institution_item.id,
                feedback = feedback.as_str(),
                "feedback propagated to institution item"
            );
        }

        let progress = self
            .workflow_runner
            .process_outcome(
                context,
                &institution_workflow,
                wait_step,
                wait_action,
                ActionResult::complete(),
                &institution_workflow_item,
            )
            .await?;

        tracing::info!(
            institution_item_id = %institution_item.id,
            progress = ?progress,
            "institution workflow unlocked"
        );
        Ok(())
    }

    async fn finalize_item_correction(
        &self,
        context: &Context,
        workflow_item: &WorkflowItem,
        feedback: ConcytecFeedback,
    ) -> Result<ActionResult> {
        if feedback == ConcytecFeedback::Reject {
            self.workflow_runner.delete_workflow(context, workflow_item).await?;
            tracing::info!(workflow_item_id = %workflow_item.id, "correction rejected, workflow deleted");
            return Ok(ActionResult::cancel());
        }

        self.corrections
            .replace_correction_item_with_native(context, workflow_item)
            .await?;
        Ok(ActionResult::complete())
    }

    async fn finalize_item_creation(
        &self,
        context: &Context,
        workflow_item: &WorkflowItem,
        item: &Item,
        institution_item: Option<&Item>,
        feedback: ConcytecFeedback,
    ) -> Result<ActionResult> {
        if let Some(institution_item) = institution_item {
            let _batch = context.enter_mode(ContextMode::BatchEdit);
            let placeholder = ShadowReference(institution_item.id).to_string();
            self.rewriter
                .rewrite_forward_references(context, item, &placeholder)
                .await?;
        }

        if feedback == ConcytecFeedback::Reject {
            let installed = self
                .services
                .items
                .install_item(context, workflow_item)
                .await?;
            self.services.items.withdraw_item(context, installed.id).await?;
            tracing::info!(item_id = %installed.id, "rejected item installed as withdrawn");
            return Ok(ActionResult::cancel());
        }

        Ok(ActionResult::complete())
    }
}

#[async_trait]
impl ProcessingAction for UnlockInstitutionAction {
    async fn execute(
        &self,
        context: &Context,
        workflow_item: &WorkflowItem,
        step: &Step,
    ) -> Result<ActionResult> {
        let item = self
            .services
            .items
            .find_item(context, workflow_item.item_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Item {} not found", workflow_item.item_id)))?;

        let institution_item = self.resolver.find_paired_item(context, &item).await?;
        let item_to_correct = self.corrections.get_corrected_item(context, &item).await?;
        let feedback = FeedbackStore::feedback(&item)?;

        tracing::debug!(
            workflow_item_id = %workflow_item.id,
            step = %step.id,
            paired = institution_item.is_some(),
            correction = item_to_correct.is_some(),
            feedback = feedback.as_str(),
            "unlocking institution workflow"
        );

        if let Some(institution_item) = &institution_item {
            self.unlock_institution_workflow(context, &item, institution_item, feedback)
                .await?;
        }

        let result = if item_to_correct.is_some() {
            self.finalize_item_correction(context, workflow_item, feedback)
                .await?
        } else {
            self.finalize_item_creation(context, workflow_item, &item, institution_item.as_ref(), feedback)
                .await?
        };

        tracing::info!(
            workflow_item_id = %workflow_item.id,
            result = result.as_str(),
            "unlock action finished"
        );
        Ok(result)
    }
}
