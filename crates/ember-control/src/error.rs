use ember_core::ValidationErrors;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("invalid configuration: {0}")]
    Validation(ValidationErrors),

    #[error("cannot reach {host}: {message}")]
    Connectivity { host: String, message: String },

    #[error("command on {host} timed out after {timeout_ms} ms")]
    Timeout { host: String, timeout_ms: u64 },

    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    #[error("no free ports on machine {machine_id} after {attempts} probes")]
    NoPortsAvailable { machine_id: Uuid, attempts: u32 },

    #[error("{step} failed with exit code {exit_code}: {stderr}")]
    RemoteExecution {
        step: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("render failed: {0}")]
    Render(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),
}

impl ProvisionError {
    /// Remote unreachable or slow. Callers may retry these with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProvisionError::Connectivity { .. } | ProvisionError::Timeout { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ProvisionError::ResourceConflict(_) | ProvisionError::NoPortsAvailable { .. }
        )
    }

    /// Stable machine-readable code for API payloads.
    pub fn code(&self) -> &'static str {
        match self {
            ProvisionError::Validation(_) => "validation_failed",
            ProvisionError::Connectivity { .. } => "connectivity",
            ProvisionError::Timeout { .. } => "timeout",
            ProvisionError::ResourceConflict(_) => "resource_conflict",
            ProvisionError::NoPortsAvailable { .. } => "no_ports_available",
            ProvisionError::RemoteExecution { .. } => "remote_execution",
            ProvisionError::NotFound { .. } => "not_found",
            ProvisionError::InvalidTransition { .. } => "invalid_transition",
            ProvisionError::Render(_) => "render_failed",
            ProvisionError::Cancelled => "cancelled",
            ProvisionError::Store(_) => "internal",
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ProvisionError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn remote(step: impl Into<String>, exit_code: i32, stderr: impl AsRef<str>) -> Self {
        ProvisionError::RemoteExecution {
            step: step.into(),
            exit_code,
            stderr: tail(stderr.as_ref(), 2048),
        }
    }
}

impl From<ValidationErrors> for ProvisionError {
    fn from(errs: ValidationErrors) -> Self {
        ProvisionError::Validation(errs)
    }
}

impl From<StoreError> for ProvisionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => ProvisionError::NotFound { entity, id },
            StoreError::Conflict(msg) => ProvisionError::ResourceConflict(msg),
            StoreError::InvalidTransition { entity, from, to } => {
                ProvisionError::InvalidTransition { entity, from, to }
            }
            other => ProvisionError::Store(other.to_string()),
        }
    }
}

/// A best-effort cleanup step that failed. Logged, never fatal under the
/// default cleanup policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialCleanupWarning {
    pub step: String,
    pub message: String,
}

impl std::fmt::Display for PartialCleanupWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cleanup step '{}' failed: {}", self.step, self.message)
    }
}

/// Keeps the last `max_bytes` of `s` on a char boundary; remote stderr is
/// usually most useful at the end.
pub(crate) fn tail(s: &str, max_bytes: usize) -> String {
    let s = s.trim();
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &s[start..])
}
