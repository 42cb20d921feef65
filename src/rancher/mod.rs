pub mod client;
pub mod token;

#[cfg(test)]
pub mod fake;

use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Marker written on every project (annotation) and namespace (annotation and
/// label) the operator creates. Destructive calls are refused when it is
/// missing.
pub const MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "rancher-devops-operator";

/// Annotation Rancher sets on downstream namespaces that belong to a project
pub const PROJECT_ID_ANNOTATION: &str = "field.cattle.io/projectId";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RancherProject {
    /// `<clusterId>:<projectId>`
    pub id: String,
    pub cluster_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl RancherProject {
    pub fn is_managed_by_us(&self) -> bool {
        self.annotations.get(MANAGED_BY_KEY).map(String::as_str) == Some(MANAGED_BY_VALUE)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RancherNamespace {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl RancherNamespace {
    /// The owning project, with Rancher's "assigned to no project" forms
    /// (missing field, empty string) collapsed to `None`
    pub fn assigned_project(&self) -> Option<&str> {
        match self.project_id.as_deref() {
            Some("") | None => None,
            other => other,
        }
    }

    /// Namespaces carry the marker as a label, not an annotation
    pub fn is_managed_by_us(&self) -> bool {
        self.labels.get(MANAGED_BY_KEY).map(String::as_str) == Some(MANAGED_BY_VALUE)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RancherMember {
    pub id: String,
    pub project_id: String,
    pub role_template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_principal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_principal_id: Option<String>,
}

impl RancherMember {
    pub fn principal_id(&self) -> Option<&str> {
        self.user_principal_id
            .as_deref()
            .or(self.group_principal_id.as_deref())
    }
}

/// The annotation set the operator stamps on projects it creates
pub fn managed_by_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string())])
}

/// Rancher convention: user principal IDs look like `local://user-abc123` or
/// `activedirectory_user://…`, group principals carry `group` instead. The
/// substring test mirrors that convention
pub fn is_user_principal(principal_id: &str) -> bool {
    principal_id.contains("user")
}

/// Capability set the reconcilers consume. Semantics of the Rancher side are
/// a black box; the guarantees that matter are documented per method.
#[async_trait]
pub trait Rancher: Send + Sync {
    /// `None` when no cluster with that name is registered
    async fn cluster_id_by_name(&self, name: &str) -> Result<Option<String>>;

    /// Case-sensitive name match within the cluster
    async fn project_by_name(&self, cluster_id: &str, name: &str)
        -> Result<Option<RancherProject>>;

    async fn create_project(
        &self,
        cluster_id: &str,
        name: &str,
        description: Option<&str>,
        annotations: BTreeMap<String, String>,
        resource_quota: Option<&serde_json::Value>,
    ) -> Result<RancherProject>;

    /// Refuses (returns `false`) when the project does not carry the
    /// managed-by annotation
    async fn delete_project(&self, project_id: &str) -> Result<bool>;

    async fn namespace(&self, cluster_id: &str, name: &str) -> Result<Option<RancherNamespace>>;

    /// The caller passes the name lowercased; the namespace is created with
    /// the managed-by label and annotation
    async fn create_namespace(&self, project_id: &str, name: &str) -> Result<RancherNamespace>;

    /// Moves the namespace into `new_project_id`, preserving existing labels
    /// and stamping the managed-by marker when missing
    async fn update_namespace_project(
        &self,
        cluster_id: &str,
        name: &str,
        new_project_id: &str,
    ) -> Result<()>;

    /// Clears the namespace's project binding, keeping the namespace itself.
    /// Refuses (returns `false`) when the managed-by label is missing
    async fn remove_namespace_from_project(&self, cluster_id: &str, name: &str) -> Result<bool>;

    /// Refuses (returns `false`) when the managed-by label is missing
    async fn delete_namespace(&self, cluster_id: &str, name: &str) -> Result<bool>;

    async fn project_namespaces(&self, project_id: &str) -> Result<Vec<RancherNamespace>>;

    async fn project_members(&self, project_id: &str) -> Result<Vec<RancherMember>>;

    async fn create_project_member(
        &self,
        project_id: &str,
        principal_id: &str,
        role: &str,
    ) -> Result<RancherMember>;

    /// Case-insensitive name match over Rancher's principal search
    async fn principal_id_by_name(&self, name: &str) -> Result<Option<String>>;

    /// Kubeconfig granting access to the downstream cluster, used by the
    /// observe loop
    async fn cluster_kubeconfig(&self, cluster_id: &str) -> Result<Option<String>>;
}
