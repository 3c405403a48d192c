use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use log::error;
use serde::{Deserialize, Serialize};

use crate::domain::{
    error::{ReconcileError, ReconcileFailure},
    model::{AppResource, ApplicationSpec},
    read_application, reconcile, Event, ReconciliationService,
};

pub fn router(reconciliation: ReconciliationService) -> Router {
    Router::new()
        .route("/reconcile", post(reconcile_application))
        .route("/read", post(read))
        .with_state(Arc::new(reconciliation))
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub desired: Option<ApplicationSpec>,
    pub observed: Option<AppResource>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceBody {
    pub resource: Option<AppResource>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    /// Resource to persist despite the failure.
    pub state: Option<AppResource>,
}

fn status_of(error: &ReconcileError) -> StatusCode {
    match error {
        ReconcileError::ConflictingBinding { .. } => StatusCode::CONFLICT,
        ReconcileError::InvalidConfig(_) => StatusCode::UNPROCESSABLE_ENTITY,
        ReconcileError::TimeoutExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        ReconcileError::NotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure_response(operation: &str, failure: ReconcileFailure) -> (StatusCode, Json<ErrorBody>) {
    error!("Error during {} {:?}", operation, failure.error);
    (
        status_of(&failure.error),
        Json(ErrorBody {
            error: failure.error.to_string(),
            state: failure.state.map(|state| *state),
        }),
    )
}

async fn reconcile_application(
    State(service): State<Arc<ReconciliationService>>,
    Json(payload): Json<ReconcileRequest>,
) -> impl IntoResponse {
    let Some(event) = Event::plan(payload.desired, payload.observed) else {
        return Ok(Json(ResourceBody { resource: None }));
    };
    reconcile(event, service.as_ref())
        .await
        .map(|resource| Json(ResourceBody { resource }))
        .map_err(|failure| failure_response("reconcile_application", failure))
}

async fn read(
    State(service): State<Arc<ReconciliationService>>,
    Json(resource): Json<AppResource>,
) -> impl IntoResponse {
    read_application(resource, service.as_ref())
        .await
        .map(|resource| Json(ResourceBody { resource }))
        .map_err(|failure| failure_response("read", failure))
}
