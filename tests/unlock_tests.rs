//! Unlock action integration tests
//!
//! Each test pairs a directorio workflow item with an institution workflow item
//! waiting for the CONCYTEC decision, then runs the unlock action.

use async_trait::async_trait;
use concytec_workflow::authority::{AuthorityRewriter, ShadowReference};
use concytec_workflow::context::{Context, ContextMode};
use concytec_workflow::correction::ItemCorrectionService;
use concytec_workflow::discovery::{DiscoverQuery, DiscoveryQueryRunner, ItemStream};
use concytec_workflow::error::{Result, WorkflowError};
use concytec_workflow::feedback::{ConcytecFeedback, FeedbackStore};
use concytec_workflow::models::{Item, ItemState, MetadataValue, WorkflowItem, CONCYTEC_COMMENT, CONCYTEC_FEEDBACK};
use concytec_workflow::services::{ItemRepository, Services};
use concytec_workflow::shadow::ShadowCopyResolver;
use concytec_workflow::store::{run_migrations, Store};
use concytec_workflow::unlock::UnlockInstitutionAction;
use concytec_workflow::workflow::{
    ActionResult, ProcessingAction, WorkflowEngine, WorkflowFactory, WorkflowProgress, WorkflowRegistry,
    WorkflowStepRunner,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use uuid::Uuid;

const WORKFLOWS: &str = r#"{
    "default_workflow": "directorioWorkflow",
    "workflows": [
        {
            "id": "directorioWorkflow",
            "first_step": "reviewStep",
            "steps": [
                { "id": "reviewStep", "actions": [{ "id": "reviewAction" }] },
                { "id": "unlockInstitutionStep", "actions": [{ "id": "unlockInstitutionAction" }] }
            ]
        },
        {
            "id": "institutionWorkflow",
            "first_step": "waitForConcytecStep",
            "steps": [
                { "id": "waitForConcytecStep", "actions": [{ "id": "waitForConcytecAction" }] },
                { "id": "finalEditStep", "actions": [{ "id": "finalEditAction" }] }
            ]
        },
        {
            "id": "legacyWorkflow",
            "first_step": "reviewStep",
            "steps": [
                { "id": "reviewStep", "actions": [{ "id": "reviewAction" }] }
            ]
        }
    ]
}"#;

struct Harness {
    store: Store,
    services: Services,
    registry: Arc<WorkflowRegistry>,
    engine: Arc<WorkflowEngine>,
    directorio_collection: Uuid,
    institution_collection: Uuid,
}

/// A directorio item waiting to unlock its paired institution item
struct Pair {
    directorio: Item,
    directorio_wfi: WorkflowItem,
    institution: Item,
    institution_wfi: WorkflowItem,
}

async fn setup() -> Harness {
    setup_with_institution_workflow("institutionWorkflow").await
}

async fn setup_with_institution_workflow(institution_workflow: &str) -> Harness {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    run_migrations(&pool).await.expect("Failed to run migrations");

    let directorio_collection = Uuid::new_v4();
    let institution_collection = Uuid::new_v4();
    let mut registry = WorkflowRegistry::from_json_str(WORKFLOWS).unwrap();
    registry.assign(directorio_collection, "directorioWorkflow").unwrap();
    registry.assign(institution_collection, institution_workflow).unwrap();

    let store = Store::new(pool).with_page_size(2);
    let services = Services::from_store(store.clone());
    let engine = Arc::new(WorkflowEngine::new(
        services.items.clone(),
        services.workflow_items.clone(),
    ));

    Harness {
        store,
        services,
        registry: Arc::new(registry),
        engine,
        directorio_collection,
        institution_collection,
    }
}

impl Harness {
    async fn item_in_workflow(
        &self,
        context: &Context,
        metadata: Vec<MetadataValue>,
        collection: Uuid,
        step: &str,
        action: &str,
    ) -> (Item, WorkflowItem) {
        let item = self
            .services
            .items
            .create_item(context, None, metadata)
            .await
            .unwrap();
        let wfi = self
            .services
            .workflow_items
            .start_workflow(context, item.id, collection, step, action)
            .await
            .unwrap();
        (item, wfi)
    }

    async fn installed_item(&self, context: &Context, metadata: Vec<MetadataValue>) -> Item {
        let (_, wfi) = self
            .item_in_workflow(context, metadata, Uuid::new_v4(), "reviewStep", "reviewAction")
            .await;
        self.services.items.install_item(context, &wfi).await.unwrap()
    }

    async fn directorio_in_unlock_step(&self, context: &Context, metadata: Vec<MetadataValue>) -> (Item, WorkflowItem) {
        self.item_in_workflow(
            context,
            metadata,
            self.directorio_collection,
            "unlockInstitutionStep",
            "unlockInstitutionAction",
        )
        .await
    }

    async fn pair(&self, context: &Context, directorio_metadata: Vec<MetadataValue>) -> Pair {
        let (directorio, directorio_wfi) = self.directorio_in_unlock_step(context, directorio_metadata).await;
        let (institution, institution_wfi) = self
            .item_in_workflow(
                context,
                org_unit("Universidad Nacional (institution copy)"),
                self.institution_collection,
                "waitForConcytecStep",
                "waitForConcytecAction",
            )
            .await;

        ShadowCopyResolver::new(self.services.items.clone(), self.services.links.clone())
            .link(context, &directorio, &institution)
            .await
            .unwrap();

        Pair {
            directorio,
            directorio_wfi,
            institution,
            institution_wfi,
        }
    }

    async fn item(&self, context: &Context, id: Uuid) -> Option<Item> {
        self.services.items.find_item(context, id).await.unwrap()
    }

    async fn workflow_item_of(&self, context: &Context, item_id: Uuid) -> Option<WorkflowItem> {
        self.services.workflow_items.find_by_item(context, item_id).await.unwrap()
    }

    async fn run(&self, context: &Context, wfi: &WorkflowItem) -> Result<ActionResult> {
        self.run_with(context, wfi, |services| services).await
    }

    /// Run the action in its own unit of work, committed only on success
    async fn run_with(
        &self,
        context: &Context,
        wfi: &WorkflowItem,
        bind: impl FnOnce(Services) -> Services,
    ) -> Result<ActionResult> {
        let unit = self.store.begin().await?;
        let services = bind(Services::from_store(unit.store()));
        let action = UnlockInstitutionAction::with_engine(services, self.registry.clone());

        let workflow = self.registry.get_workflow(wfi.collection_id)?;
        let step = workflow.step(&wfi.step_id)?;
        let result = action.execute(context, wfi, step).await?;

        unit.commit().await?;
        Ok(result)
    }

    /// Let the engine consume the action result, as the workflow engine would
    async fn process(&self, context: &Context, wfi: &WorkflowItem, result: ActionResult) -> WorkflowProgress {
        let workflow = self.registry.get_workflow(wfi.collection_id).unwrap();
        let step = workflow.step(&wfi.step_id).unwrap();
        let action = step.action_config(&wfi.action_id).unwrap();
        self.engine
            .process_outcome(context, &workflow, step, action, result, wfi)
            .await
            .unwrap()
    }
}

fn org_unit(name: &str) -> Vec<MetadataValue> {
    vec![
        MetadataValue::new("dc.title", name),
        MetadataValue::new("relationship.type", "OrgUnit"),
    ]
}

fn with_feedback(mut metadata: Vec<MetadataValue>, feedback: &str, comment: Option<&str>) -> Vec<MetadataValue> {
    metadata.push(MetadataValue::new(CONCYTEC_FEEDBACK, feedback));
    if let Some(comment) = comment {
        metadata.push(MetadataValue::new(CONCYTEC_COMMENT, comment));
    }
    metadata
}

fn referencing_unit(name: &str, authority: &str) -> Vec<MetadataValue> {
    let mut metadata = org_unit(name);
    metadata.push(MetadataValue::new("organization.parentOrganization", "Universidad Nacional").with_authority(authority));
    metadata
}

#[tokio::test]
async fn test_none_feedback_unblocks_paired_item_without_propagation() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness.pair(&context, org_unit("Universidad Nacional")).await;

    let result = harness.run(&context, &pair.directorio_wfi).await.unwrap();
    assert_eq!(result, ActionResult::complete());

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert_eq!(FeedbackStore::feedback(&institution).unwrap(), ConcytecFeedback::None);
    assert!(institution.first_value(CONCYTEC_FEEDBACK).is_none());
    assert!(FeedbackStore::comment(&institution).is_none());

    let institution_wfi = harness.workflow_item_of(&context, pair.institution.id).await.unwrap();
    assert_eq!(institution_wfi.id, pair.institution_wfi.id);
    assert_eq!(institution_wfi.step_id, "finalEditStep");
}

#[tokio::test]
async fn test_correction_feedback_with_comment_completes_new_item() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(
            &context,
            with_feedback(org_unit("Universidad Nacional"), "CORRECTION", Some("fix table 3")),
        )
        .await;
    let placeholder = ShadowReference(pair.institution.id).to_string();
    let referencing = harness
        .installed_item(&context, referencing_unit("Facultad de Ciencias", &placeholder))
        .await;

    let result = harness.run(&context, &pair.directorio_wfi).await.unwrap();
    assert_eq!(result, ActionResult::complete());

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert_eq!(FeedbackStore::feedback(&institution).unwrap(), ConcytecFeedback::Correction);
    assert_eq!(FeedbackStore::comment(&institution), Some("fix table 3"));
    let institution_wfi = harness.workflow_item_of(&context, pair.institution.id).await.unwrap();
    assert_eq!(institution_wfi.step_id, "finalEditStep");

    let referencing = harness.item(&context, referencing.id).await.unwrap();
    let authorities: Vec<Option<&str>> = referencing
        .metadata
        .iter()
        .filter(|m| m.field == "organization.parentOrganization")
        .map(|m| m.authority.as_deref())
        .collect();
    let directorio_id = pair.directorio.id.to_string();
    assert_eq!(authorities, vec![Some(directorio_id.as_str())]);

    let progress = harness.process(&context, &pair.directorio_wfi, result).await;
    assert_eq!(progress, WorkflowProgress::Archived { item_id: pair.directorio.id });
    let directorio = harness.item(&context, pair.directorio.id).await.unwrap();
    assert_eq!(directorio.state, ItemState::Archived);
    assert_eq!(context.current_mode(), ContextMode::ReadWrite);
}

#[tokio::test]
async fn test_blank_comment_is_not_propagated() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(&context, with_feedback(org_unit("Universidad"), "APPROVE", Some("   ")))
        .await;

    harness.run(&context, &pair.directorio_wfi).await.unwrap();

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert_eq!(FeedbackStore::feedback(&institution).unwrap(), ConcytecFeedback::Approve);
    assert!(FeedbackStore::comment(&institution).is_none());
}

#[tokio::test]
async fn test_rejected_new_item_is_installed_then_withdrawn() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(&context, with_feedback(org_unit("Universidad"), "REJECT", None))
        .await;

    let result = harness.run(&context, &pair.directorio_wfi).await.unwrap();
    assert_eq!(result, ActionResult::cancel());

    let directorio = harness.item(&context, pair.directorio.id).await.unwrap();
    assert_eq!(directorio.state, ItemState::Withdrawn);
    assert!(harness.workflow_item_of(&context, pair.directorio.id).await.is_none());

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert_eq!(FeedbackStore::feedback(&institution).unwrap(), ConcytecFeedback::Reject);
    let institution_wfi = harness.workflow_item_of(&context, pair.institution.id).await.unwrap();
    assert_eq!(institution_wfi.step_id, "finalEditStep");

    let progress = harness.process(&context, &pair.directorio_wfi, result).await;
    assert_eq!(progress, WorkflowProgress::Unchanged);
}

#[tokio::test]
async fn test_rejected_correction_cancels_and_keeps_original() {
    let harness = setup().await;
    let context = Context::new(None);
    let original = harness.installed_item(&context, org_unit("Original name")).await;
    let pair = harness
        .pair(&context, with_feedback(org_unit("Corrected name"), "REJECT", None))
        .await;
    ItemCorrectionService::new(
        harness.services.items.clone(),
        harness.services.links.clone(),
    )
    .create_correction(&context, &pair.directorio, &original)
    .await
    .unwrap();

    let result = harness.run(&context, &pair.directorio_wfi).await.unwrap();
    assert_eq!(result, ActionResult::cancel());

    // Paired item still receives the decision and is unblocked
    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert_eq!(FeedbackStore::feedback(&institution).unwrap(), ConcytecFeedback::Reject);
    let institution_wfi = harness.workflow_item_of(&context, pair.institution.id).await.unwrap();
    assert_eq!(institution_wfi.step_id, "finalEditStep");

    assert!(harness.item(&context, pair.directorio.id).await.is_none());
    assert!(harness.workflow_item_of(&context, pair.directorio.id).await.is_none());
    assert!(harness
        .services
        .links
        .find_corrected_item_id(&context, pair.directorio.id)
        .await
        .unwrap()
        .is_none());

    let untouched = harness.item(&context, original.id).await.unwrap();
    assert_eq!(untouched.first_value("dc.title"), Some("Original name"));
    assert_eq!(untouched.state, ItemState::Archived);
}

#[tokio::test]
async fn test_accepted_correction_replaces_original() {
    let harness = setup().await;
    let context = Context::new(None);
    let original = harness.installed_item(&context, org_unit("Original name")).await;
    let (correction, correction_wfi) = harness
        .directorio_in_unlock_step(&context, with_feedback(org_unit("Corrected name"), "APPROVE", Some("ok")))
        .await;
    harness
        .services
        .links
        .create_correction_link(&context, correction.id, original.id)
        .await
        .unwrap();

    let result = harness.run(&context, &correction_wfi).await.unwrap();
    assert_eq!(result, ActionResult::complete());

    let replaced = harness.item(&context, original.id).await.unwrap();
    assert_eq!(replaced.first_value("dc.title"), Some("Corrected name"));
    assert_eq!(replaced.state, ItemState::Archived);
    assert!(replaced.first_value(CONCYTEC_FEEDBACK).is_none());
    assert!(replaced.first_value(CONCYTEC_COMMENT).is_none());

    assert!(harness.item(&context, correction.id).await.is_none());
    assert!(harness
        .services
        .links
        .find_corrected_item_id(&context, correction.id)
        .await
        .unwrap()
        .is_none());

    let progress = harness.process(&context, &correction_wfi, result).await;
    assert_eq!(progress, WorkflowProgress::Finalized);
}

#[tokio::test]
async fn test_correction_of_item_without_relationship_type_fails_fast() {
    let harness = setup().await;
    let context = Context::new(None);
    let original = harness
        .installed_item(&context, vec![MetadataValue::new("dc.title", "Untyped")])
        .await;
    let (correction, correction_wfi) = harness.directorio_in_unlock_step(&context, org_unit("Typed")).await;
    harness
        .services
        .links
        .create_correction_link(&context, correction.id, original.id)
        .await
        .unwrap();

    let result = harness.run(&context, &correction_wfi).await;
    assert!(matches!(result, Err(WorkflowError::IllegalArgument(_))));

    let untouched = harness.item(&context, original.id).await.unwrap();
    assert_eq!(untouched.first_value("dc.title"), Some("Untyped"));
    assert!(harness.item(&context, correction.id).await.is_some());
}

#[tokio::test]
async fn test_unpaired_item_completes_without_side_effects() {
    let harness = setup().await;
    let context = Context::new(None);
    let placeholder = ShadowReference(Uuid::new_v4()).to_string();
    let bystander = harness
        .installed_item(&context, referencing_unit("Bystander", &placeholder))
        .await;
    let (item, wfi) = harness
        .directorio_in_unlock_step(&context, with_feedback(org_unit("Solo"), "REJECT", None))
        .await;

    // Rejection of an unpaired new item still installs and withdraws it
    let result = harness.run(&context, &wfi).await.unwrap();
    assert_eq!(result, ActionResult::cancel());
    assert_eq!(harness.item(&context, item.id).await.unwrap().state, ItemState::Withdrawn);

    let bystander_after = harness.item(&context, bystander.id).await.unwrap();
    assert_eq!(bystander_after.last_modified, bystander.last_modified);
}

#[tokio::test]
async fn test_unpaired_item_without_relationship_type_completes() {
    let harness = setup().await;
    let context = Context::new(None);
    let (_, wfi) = harness
        .directorio_in_unlock_step(&context, vec![MetadataValue::new("dc.title", "Untyped")])
        .await;

    let result = harness.run(&context, &wfi).await.unwrap();
    assert_eq!(result, ActionResult::complete());
}

#[tokio::test]
async fn test_paired_new_item_without_relationship_type_fails_and_restores_mode() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(
            &context,
            with_feedback(vec![MetadataValue::new("dc.title", "Untyped")], "APPROVE", Some("ok")),
        )
        .await;

    let result = harness.run(&context, &pair.directorio_wfi).await;
    assert!(matches!(result, Err(WorkflowError::IllegalArgument(_))));
    assert!(!result.unwrap_err().is_retryable());
    assert_eq!(context.current_mode(), ContextMode::ReadWrite);
    assert_eq!(
        harness.item(&context, pair.directorio.id).await.unwrap().state,
        ItemState::Workflow
    );

    // The decision handed over before the failure is rolled back with it
    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert!(institution.first_value(CONCYTEC_FEEDBACK).is_none());
    assert!(institution.first_value(CONCYTEC_COMMENT).is_none());
    let institution_wfi = harness.workflow_item_of(&context, pair.institution.id).await.unwrap();
    assert_eq!(institution_wfi.step_id, "waitForConcytecStep");
    assert_eq!(institution_wfi.action_id, "waitForConcytecAction");
}

#[tokio::test]
async fn test_paired_item_without_workflow_is_invalid_state() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(&context, with_feedback(org_unit("Universidad"), "APPROVE", None))
        .await;
    harness
        .services
        .items
        .install_item(&context, &pair.institution_wfi)
        .await
        .unwrap();

    let result = harness.run(&context, &pair.directorio_wfi).await;
    assert!(matches!(result, Err(WorkflowError::InvalidState(_))));

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert!(institution.first_value(CONCYTEC_FEEDBACK).is_none());
}

#[tokio::test]
async fn test_missing_wait_step_is_configuration_error_before_any_change() {
    let harness = setup_with_institution_workflow("legacyWorkflow").await;
    let context = Context::new(None);
    let pair = harness
        .pair(&context, with_feedback(org_unit("Universidad"), "REJECT", None))
        .await;

    let result = harness.run(&context, &pair.directorio_wfi).await;
    assert!(matches!(result, Err(WorkflowError::Configuration(_))));

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert!(institution.first_value(CONCYTEC_FEEDBACK).is_none());
    let directorio = harness.item(&context, pair.directorio.id).await.unwrap();
    assert_eq!(directorio.state, ItemState::Workflow);
}

#[tokio::test]
async fn test_propagated_feedback_is_a_copy() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(&context, with_feedback(org_unit("Universidad"), "CORRECTION", Some("fix table 3")))
        .await;

    harness.run(&context, &pair.directorio_wfi).await.unwrap();

    let feedback = FeedbackStore::new(harness.services.metadata.clone());
    feedback
        .record(&context, pair.directorio.id, ConcytecFeedback::Approve, Some("never mind"))
        .await
        .unwrap();

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert_eq!(FeedbackStore::feedback(&institution).unwrap(), ConcytecFeedback::Correction);
    assert_eq!(FeedbackStore::comment(&institution), Some("fix table 3"));
}

#[tokio::test]
async fn test_shadow_copy_resolution_is_symmetric() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness.pair(&context, org_unit("Universidad")).await;
    let resolver = ShadowCopyResolver::new(harness.services.items.clone(), harness.services.links.clone());

    let from_directorio = resolver
        .find_paired_item(&context, &pair.directorio)
        .await
        .unwrap()
        .unwrap();
    let from_institution = resolver
        .find_paired_item(&context, &pair.institution)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(from_directorio.id, pair.institution.id);
    assert_eq!(from_institution.id, pair.directorio.id);

    let (loner, _) = harness.directorio_in_unlock_step(&context, org_unit("Loner")).await;
    assert!(resolver.find_paired_item(&context, &loner).await.unwrap().is_none());
    assert!(matches!(
        resolver.link(&context, &loner, &loner).await,
        Err(WorkflowError::BadRequest(_))
    ));
}

#[tokio::test]
async fn test_paired_item_cannot_be_linked_again_in_either_role() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness.pair(&context, org_unit("Universidad")).await;
    let (other, _) = harness.directorio_in_unlock_step(&context, org_unit("Otra")).await;
    let resolver = ShadowCopyResolver::new(harness.services.items.clone(), harness.services.links.clone());

    // The directorio item of one pair offered as the institution end of another
    assert!(matches!(
        resolver.link(&context, &other, &pair.directorio).await,
        Err(WorkflowError::InvalidState(_))
    ));
    assert!(matches!(
        resolver.link(&context, &pair.institution, &other).await,
        Err(WorkflowError::InvalidState(_))
    ));

    assert!(resolver.find_paired_item(&context, &other).await.unwrap().is_none());
    let still_paired = resolver
        .find_paired_item(&context, &pair.directorio)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_paired.id, pair.institution.id);
}

#[tokio::test]
async fn test_rewrite_is_idempotent() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness.pair(&context, org_unit("Universidad")).await;
    let placeholder = ShadowReference(pair.institution.id).to_string();

    let mut referencing = Vec::new();
    for name in ["Facultad A", "Facultad B", "Facultad C"] {
        referencing.push(harness.installed_item(&context, referencing_unit(name, &placeholder)).await);
    }
    // Different relationship type, out of scope
    let mut person = vec![
        MetadataValue::new("dc.title", "Quispe, Ana"),
        MetadataValue::new("relationship.type", "Person"),
    ];
    person.push(MetadataValue::new("person.affiliation.name", "Universidad").with_authority(&placeholder));
    let person = harness.installed_item(&context, person).await;

    let rewriter = AuthorityRewriter::new(harness.services.items.clone(), harness.services.discovery.clone());

    let first = rewriter
        .rewrite_forward_references(&context, &pair.directorio, &placeholder)
        .await
        .unwrap();
    assert_eq!(first.scanned, 3);
    assert_eq!(first.updated, 3);

    let snapshot: Vec<Item> = {
        let mut items = Vec::new();
        for r in &referencing {
            items.push(harness.item(&context, r.id).await.unwrap());
        }
        items
    };

    let second = rewriter
        .rewrite_forward_references(&context, &pair.directorio, &placeholder)
        .await
        .unwrap();
    assert_eq!(second.updated, 0);

    for before in &snapshot {
        let after = harness.item(&context, before.id).await.unwrap();
        assert_eq!(after.last_modified, before.last_modified);
        assert_eq!(after.metadata, before.metadata);
    }

    let person = harness.item(&context, person.id).await.unwrap();
    assert!(person
        .metadata
        .iter()
        .any(|m| m.authority.as_deref() == Some(placeholder.as_str())));
}

/// Index that fails after returning one hit
struct FlakyDiscovery {
    first_hit: Uuid,
}

impl DiscoveryQueryRunner for FlakyDiscovery {
    fn iterate(&self, _query: DiscoverQuery) -> ItemStream<'static> {
        Box::pin(futures::stream::iter(vec![
            Ok(self.first_hit),
            Err(WorkflowError::Search("index unavailable".to_string())),
        ]))
    }
}

#[tokio::test]
async fn test_scan_failure_persists_nothing_and_restores_mode() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(&context, with_feedback(org_unit("Universidad"), "APPROVE", None))
        .await;
    let placeholder = ShadowReference(pair.institution.id).to_string();
    let referencing = harness
        .installed_item(&context, referencing_unit("Facultad", &placeholder))
        .await;

    let flaky: Arc<dyn DiscoveryQueryRunner> = Arc::new(FlakyDiscovery { first_hit: referencing.id });
    let result = harness
        .run_with(&context, &pair.directorio_wfi, |services| services.with_discovery(flaky))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, WorkflowError::Search(_)));
    assert!(err.is_retryable());
    assert_eq!(context.current_mode(), ContextMode::ReadWrite);

    let untouched = harness.item(&context, referencing.id).await.unwrap();
    assert_eq!(untouched.last_modified, referencing.last_modified);
    assert!(untouched
        .metadata
        .iter()
        .any(|m| m.authority.as_deref() == Some(placeholder.as_str())));
    assert_eq!(
        harness.item(&context, pair.directorio.id).await.unwrap().state,
        ItemState::Workflow
    );

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert!(institution.first_value(CONCYTEC_FEEDBACK).is_none());
    let institution_wfi = harness.workflow_item_of(&context, pair.institution.id).await.unwrap();
    assert_eq!(institution_wfi.step_id, "waitForConcytecStep");
}

#[tokio::test]
async fn test_transition_succeeds_on_retry_after_scan_failure() {
    let harness = setup().await;
    let context = Context::new(None);
    let pair = harness
        .pair(&context, with_feedback(org_unit("Universidad"), "APPROVE", None))
        .await;
    let placeholder = ShadowReference(pair.institution.id).to_string();
    let referencing = harness
        .installed_item(&context, referencing_unit("Facultad", &placeholder))
        .await;

    let flaky: Arc<dyn DiscoveryQueryRunner> = Arc::new(FlakyDiscovery { first_hit: referencing.id });
    let first = harness
        .run_with(&context, &pair.directorio_wfi, |services| services.with_discovery(flaky))
        .await;
    assert!(first.unwrap_err().is_retryable());

    let retry = harness.run(&context, &pair.directorio_wfi).await.unwrap();
    assert_eq!(retry, ActionResult::complete());

    let institution = harness.item(&context, pair.institution.id).await.unwrap();
    assert_eq!(FeedbackStore::feedback(&institution).unwrap(), ConcytecFeedback::Approve);
    let institution_wfi = harness.workflow_item_of(&context, pair.institution.id).await.unwrap();
    assert_eq!(institution_wfi.step_id, "finalEditStep");

    let referencing = harness.item(&context, referencing.id).await.unwrap();
    let directorio_id = pair.directorio.id.to_string();
    assert!(referencing
        .metadata
        .iter()
        .any(|m| m.authority.as_deref() == Some(directorio_id.as_str())));
}

/// Item repository whose deletes fail, delegating everything else
struct FailingDeletes {
    inner: Arc<dyn ItemRepository>,
}

#[async_trait]
impl ItemRepository for FailingDeletes {
    async fn find_item(&self, context: &Context, id: Uuid) -> Result<Option<Item>> {
        self.inner.find_item(context, id).await
    }

    async fn create_item(
        &self,
        context: &Context,
        collection_id: Option<Uuid>,
        metadata: Vec<MetadataValue>,
    ) -> Result<Item> {
        self.inner.create_item(context, collection_id, metadata).await
    }

    async fn update_items(&self, context: &Context, items: &[Item]) -> Result<()> {
        self.inner.update_items(context, items).await
    }

    async fn install_item(&self, context: &Context, workflow_item: &WorkflowItem) -> Result<Item> {
        self.inner.install_item(context, workflow_item).await
    }

    async fn withdraw_item(&self, context: &Context, id: Uuid) -> Result<Item> {
        self.inner.withdraw_item(context, id).await
    }

    async fn delete_item(&self, _context: &Context, _id: Uuid) -> Result<()> {
        Err(WorkflowError::Database(sqlx::Error::PoolTimedOut))
    }
}

#[tokio::test]
async fn test_failed_correction_replacement_leaves_original_and_correction() {
    let harness = setup().await;
    let context = Context::new(None);
    let original = harness.installed_item(&context, org_unit("Original name")).await;
    let (correction, correction_wfi) = harness
        .directorio_in_unlock_step(&context, with_feedback(org_unit("Corrected name"), "APPROVE", None))
        .await;
    harness
        .services
        .links
        .create_correction_link(&context, correction.id, original.id)
        .await
        .unwrap();

    let result = harness
        .run_with(&context, &correction_wfi, |services| {
            let failing = Arc::new(FailingDeletes {
                inner: services.items.clone(),
            });
            services.with_items(failing)
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, WorkflowError::Database(_)));
    assert!(err.is_retryable());

    let untouched = harness.item(&context, original.id).await.unwrap();
    assert_eq!(untouched.first_value("dc.title"), Some("Original name"));
    assert!(harness.item(&context, correction.id).await.is_some());
    assert!(harness.workflow_item_of(&context, correction.id).await.is_some());
    assert_eq!(
        harness
            .services
            .links
            .find_corrected_item_id(&context, correction.id)
            .await
            .unwrap(),
        Some(original.id)
    );

    let retry = harness.run(&context, &correction_wfi).await.unwrap();
    assert_eq!(retry, ActionResult::complete());
    let replaced = harness.item(&context, original.id).await.unwrap();
    assert_eq!(replaced.first_value("dc.title"), Some("Corrected name"));
    assert!(harness.item(&context, correction.id).await.is_none());
}

#[tokio::test]
async fn test_batch_mode_is_restored_to_previous_non_default_mode() {
    let harness = setup().await;
    let context = Context::with_mode(None, ContextMode::BatchEdit);
    let pair = harness.pair(&context, org_unit("Universidad")).await;

    harness.run(&context, &pair.directorio_wfi).await.unwrap();
    assert_eq!(context.current_mode(), ContextMode::BatchEdit);

    context.set_mode(ContextMode::ReadWrite);
    assert_eq!(context.current_mode(), ContextMode::ReadWrite);
}
