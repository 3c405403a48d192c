use std::time::Duration;

use thiserror::Error;

use super::model::{AppResource, ServiceBinding};

/// Failure reported by a control-plane collaborator.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("{kind} {id} not found (status code: 404)")]
    NotFound { kind: &'static str, id: String },

    #[error("application {app_id} did not start within {timeout:?}")]
    Timeout { app_id: String, timeout: Duration },

    #[error("request rejected by the platform: {0}")]
    Rejected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlatformError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        PlatformError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("route with id {route_id} is already mapped to application {app_id}. routes can only be mapped to one application")]
    ConflictingBinding { route_id: String, app_id: String },

    #[error("service binding failed after {} binding(s) were created", .bound.len())]
    PartialBindingFailure {
        bound: Vec<ServiceBinding>,
        #[source]
        source: PlatformError,
    },

    #[error("application upload failed")]
    UploadFailure(#[source] PlatformError),

    #[error("application {app_id} did not reach started state within {timeout:?}")]
    TimeoutExceeded { app_id: String, timeout: Duration },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("can't retrieve application bits: {0:#}")]
    Artifact(anyhow::Error),

    #[error(transparent)]
    Platform(PlatformError),
}

impl From<PlatformError> for ReconcileError {
    fn from(error: PlatformError) -> Self {
        match error {
            PlatformError::NotFound { kind, id } => ReconcileError::NotFound { kind, id },
            PlatformError::Timeout { app_id, timeout } => {
                ReconcileError::TimeoutExceeded { app_id, timeout }
            }
            other => ReconcileError::Platform(other),
        }
    }
}

/// A failed reconciliation, together with the resource record the caller must
/// persist so the next pass can pick up where this one stopped.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ReconcileFailure {
    pub error: ReconcileError,
    pub state: Option<Box<AppResource>>,
}

impl ReconcileFailure {
    pub fn with_state(error: ReconcileError, state: AppResource) -> Self {
        Self {
            error,
            state: Some(Box::new(state)),
        }
    }
}

impl From<ReconcileError> for ReconcileFailure {
    fn from(error: ReconcileError) -> Self {
        Self { error, state: None }
    }
}

impl From<PlatformError> for ReconcileFailure {
    fn from(error: PlatformError) -> Self {
        ReconcileError::from(error).into()
    }
}
