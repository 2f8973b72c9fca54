//! HTTP routes for the workflow engine and reviewers

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{Result, WorkflowError};
use crate::feedback::FeedbackStore;
use crate::models::{Item, SetFeedbackRequest};
use crate::services::Services;
use crate::shadow::ShadowCopyResolver;
use crate::unlock::{UnlockInstitutionAction, UnlockOutcome};
use crate::AppState;

/// Action id the unlock route is allowed to run
pub const UNLOCK_INSTITUTION_ACTION: &str = "unlockInstitutionAction";

/// Header carrying the acting user
pub const USER_HEADER: &str = "x-user-id";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/items/:id", get(get_item))
        .route("/items/:id/shadow-copy", get(get_shadow_copy))
        .route("/items/:id/feedback", put(set_feedback))
        .route("/workflow-items/:id/unlock", post(unlock))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn context_from_headers(headers: &HeaderMap) -> Result<Context> {
    let user = headers
        .get(USER_HEADER)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|v| Uuid::parse_str(v).ok())
                .ok_or_else(|| WorkflowError::BadRequest(format!("Invalid {} header", USER_HEADER)))
        })
        .transpose()?;
    Ok(Context::new(user))
}

async fn load_item(state: &AppState, context: &Context, id: Uuid) -> Result<Item> {
    state
        .services
        .items
        .find_item(context, id)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("Item {} not found", id)))
}

async fn get_item(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Item>> {
    let context = context_from_headers(&headers)?;
    load_item(&state, &context, id).await.map(Json)
}

async fn get_shadow_copy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Item>> {
    let context = context_from_headers(&headers)?;
    let item = load_item(&state, &context, id).await?;

    let resolver = ShadowCopyResolver::new(state.services.items.clone(), state.services.links.clone());
    resolver
        .find_paired_item(&context, &item)
        .await?
        .map(Json)
        .ok_or_else(|| WorkflowError::NotFound(format!("Item {} has no shadow copy", id)))
}

async fn set_feedback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<SetFeedbackRequest>,
) -> Result<StatusCode> {
    let context = context_from_headers(&headers)?;
    load_item(&state, &context, id).await?;

    let unit = state.store.begin().await?;
    FeedbackStore::new(Services::from_store(unit.store()).metadata)
        .record(&context, id, request.feedback, request.comment.as_deref())
        .await?;
    unit.commit().await?;

    tracing::info!(item_id = %id, feedback = request.feedback.as_str(), "feedback recorded");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct UnlockResponse {
    pub workflow_item_id: Uuid,
    #[serde(flatten)]
    pub outcome: UnlockOutcome,
}

/// Run the unlock transition in one unit of work, committed only on success
async fn unlock(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<UnlockResponse>> {
    let context = context_from_headers(&headers)?;
    let unit = state.store.begin().await?;
    let services = Services::from_store(unit.store());

    let workflow_item = services
        .workflow_items
        .find_workflow_item(&context, id)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("Workflow item {} not found", id)))?;

    if workflow_item.action_id != UNLOCK_INSTITUTION_ACTION {
        return Err(WorkflowError::InvalidState(format!(
            "Workflow item {} is waiting on {}, not {}",
            id, workflow_item.action_id, UNLOCK_INSTITUTION_ACTION
        )));
    }

    let outcome = UnlockInstitutionAction::with_engine(services, state.registry.clone())
        .run(&context, &workflow_item)
        .await?;
    unit.commit().await?;

    tracing::info!(workflow_item_id = %id, result = outcome.result.as_str(), "unlock committed");
    Ok(Json(UnlockResponse {
        workflow_item_id: id,
        outcome,
    }))
}
