use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "Project",
    group = "rancher.devops.io",
    version = "v1",
    status = "ProjectStatus",
    shortname = "rdp",
    printcolumn = r#"{"name":"Cluster", "jsonPath":".spec.clusterName", "type":"string"}"#,
    printcolumn = r#"{"name":"Phase", "jsonPath":".status.phase", "type":"string"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Name (not ID) of the downstream cluster registered in Rancher
    pub cluster_name: String,

    /// Name of the Rancher project. Falls back to the metadata name when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Namespaces that belong to the project. Compared case-insensitively,
    /// written to Rancher lowercased
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Role bindings to ensure on the project
    #[serde(default)]
    pub members: Vec<ProjectMember>,

    /// Passed to Rancher as-is, never interpreted by the operator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_quota: Option<serde_json::Value>,

    /// Project-level permissions: Create, Delete, Observe. Empty means Create
    #[serde(default)]
    pub management_policies: Vec<String>,

    /// Namespace-level permissions: Create, Update, Delete. Empty means
    /// Create and Update
    #[serde(default)]
    pub namespace_management_policies: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectMember {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,

    /// Resolved through Rancher's principal search when `principalId` is unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_name: Option<String>,

    /// Rancher role template, e.g. `project-owner` or `project-member`
    pub role: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ProjectPhase {
    #[default]
    Pending,
    Active,
    Error,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    /// Rancher project ID, of the form `<clusterId>:<projectId>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    #[serde(default)]
    pub phase: ProjectPhase,

    /// Namespaces this operator itself created over the CR's lifetime.
    /// Audit trail consulted on CR deletion, not the desired set
    #[serde(default)]
    pub created_namespaces: Vec<String>,

    /// Spec namespaces seen attached to the project in any earlier pass.
    /// A name leaving this set without leaving the spec marks an
    /// out-of-band removal
    #[serde(default)]
    pub observed_namespaces: Vec<String>,

    /// Tombstones: names still in spec that were removed from the project
    /// out-of-band. Never recreated while present here
    #[serde(default)]
    pub manually_removed_namespaces: Vec<String>,

    /// `principalId:role` pairs observed after a successful member pass
    #[serde(default)]
    pub configured_members: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Project {
    /// Name of the Rancher project backing this CR
    pub fn project_name(&self) -> String {
        match &self.spec.display_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => kube::ResourceExt::name_any(self),
        }
    }

    /// Spec namespaces, lowercased. Rancher only ever sees these forms
    pub fn desired_namespaces(&self) -> Vec<String> {
        self.spec.namespaces.iter().map(|n| n.to_lowercase()).collect()
    }

    pub fn wants_namespace(&self, name: &str) -> bool {
        self.spec
            .namespaces
            .iter()
            .any(|n| n.eq_ignore_ascii_case(name))
    }

    pub fn status_mut(&mut self) -> &mut ProjectStatus {
        self.status.get_or_insert_with(ProjectStatus::default)
    }
}

impl std::fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectPhase::Pending => write!(f, "Pending"),
            ProjectPhase::Active => write!(f, "Active"),
            ProjectPhase::Error => write!(f, "Error"),
        }
    }
}
