// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DrSyncError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to parse kubeconfig: {0}")]
    KubeconfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No available node: {0}")]
    NoAvailableNode(String),

    #[error("Timed out after {elapsed:?} waiting for {operation}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Remote command failed after {attempts} attempt(s): {message}")]
    ExecFailed {
        attempts: u32,
        retryable: bool,
        message: String,
    },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("SSH key error: {0}")]
    KeyError(String),

    #[error("Namespace creation failed: {0}")]
    NamespaceError(String),

    #[error("Pod {0} failed: {1}")]
    PodFailed(String, String),

    #[error("Informer cache sync failed: {0}")]
    CacheSync(String),

    #[error("Resource sync failed: {0}")]
    SyncError(String),

    #[error("Finalizer error: {0}")]
    Finalizer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DrSyncError>;

impl DrSyncError {
    /// Whether this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            DrSyncError::NotFound(_) => true,
            DrSyncError::KubeError(e) => is_not_found(e),
            _ => false,
        }
    }

    /// Whether the failed operation may succeed when repeated
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DrSyncError::ExecFailed {
                retryable: true,
                ..
            }
        )
    }
}

/// Check whether a kube error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

/// Check whether a kube error is a 422, e.g. a write to an immutable field
pub fn is_invalid(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 422)
}

/// Check whether a kube error is a 409 (already exists / update conflict)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}
