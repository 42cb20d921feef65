use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    Kube(#[source] kube::Error),

    #[error("Error parsing Kubeconfig: {0}")]
    Kubeconfig(#[source] kube::config::KubeconfigError),

    #[error("Rancher API error: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Rancher API call '{operation}' failed: {message}")]
    Platform { operation: String, message: String },

    #[error("Authentication against Rancher failed: {0}")]
    Auth(String),

    #[error("Cluster '{0}' is not registered in Rancher")]
    ClusterNotFound(String),

    #[error("Could not create project '{0}'")]
    ProjectCreationFailed(String),

    #[error("Namespace '{0}' is already claimed by another Project CR and cannot be moved.")]
    NamespaceConflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Finalizer Error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("InternalError: {0}")]
    Internal(String),
}

impl Error {
    /// Label used on the error counter metric.
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::ClusterNotFound(_) => "cluster_not_found",
            Error::ProjectCreationFailed(_) => "project_creation_failed",
            Error::NamespaceConflict(_) => "namespace_conflict",
            _ => "reconciliation_failed",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
