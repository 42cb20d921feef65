//! In-memory Rancher used by the reconciler tests. Mirrors the documented
//! guarantees of the real client (managed-by refusals, marker stamping) and
//! records every call so tests can assert on what was, and was not, issued.

use crate::errors::{Error, Result};
use crate::rancher::{
    is_user_principal, Rancher, RancherMember, RancherNamespace, RancherProject, MANAGED_BY_KEY,
    MANAGED_BY_VALUE,
};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct FakeState {
    clusters: BTreeMap<String, String>,
    projects: Vec<RancherProject>,
    namespaces: BTreeMap<String, RancherNamespace>,
    members: Vec<RancherMember>,
    principals: BTreeMap<String, String>,
    kubeconfigs: BTreeMap<String, String>,
    calls: Vec<String>,
    failing_operations: HashSet<String>,
    next_id: u32,
}

#[derive(Default)]
pub struct FakeRancher {
    state: Mutex<FakeState>,
}

impl FakeRancher {
    pub fn new() -> Self {
        FakeRancher::default()
    }

    pub fn with_cluster(name: &str, id: &str) -> Self {
        let fake = FakeRancher::new();
        fake.add_cluster(name, id);
        fake
    }

    pub fn add_cluster(&self, name: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.clusters.insert(name.to_string(), id.to_string());
    }

    pub fn add_principal(&self, name: &str, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.principals.insert(name.to_string(), id.to_string());
    }

    pub fn add_kubeconfig(&self, cluster_id: &str, config: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .kubeconfigs
            .insert(cluster_id.to_string(), config.to_string());
    }

    pub fn seed_project(&self, cluster_id: &str, name: &str, managed_by_us: bool) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("{}:p-{}", cluster_id, state.next_id);
        let mut annotations = BTreeMap::new();
        if managed_by_us {
            annotations.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());
        }
        state.projects.push(RancherProject {
            id: id.clone(),
            cluster_id: cluster_id.to_string(),
            name: name.to_string(),
            description: None,
            annotations,
        });
        id
    }

    pub fn seed_namespace(&self, name: &str, project_id: Option<&str>, managed_by_us: bool) {
        let mut state = self.state.lock().unwrap();
        let mut labels = BTreeMap::new();
        let mut annotations = BTreeMap::new();
        if managed_by_us {
            labels.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());
            annotations.insert(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string());
        }
        state.namespaces.insert(
            name.to_string(),
            RancherNamespace {
                name: name.to_string(),
                project_id: project_id.map(|p| p.to_string()),
                annotations,
                labels,
            },
        );
    }

    pub fn seed_member(&self, project_id: &str, principal_id: &str, role: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let (user, group) = if is_user_principal(principal_id) {
            (Some(principal_id.to_string()), None)
        } else {
            (None, Some(principal_id.to_string()))
        };
        let id = format!("prtb-{}", state.next_id);
        state.members.push(RancherMember {
            id,
            project_id: project_id.to_string(),
            role_template_id: role.to_string(),
            user_principal_id: user,
            group_principal_id: group,
        });
    }

    /// Make the named operation return an error on every call
    pub fn fail_operation(&self, operation: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_operations.insert(operation.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn issued(&self, call_prefix: &str) -> bool {
        self.calls().iter().any(|c| c.starts_with(call_prefix))
    }

    pub fn project_named(&self, name: &str) -> Option<RancherProject> {
        self.state
            .lock()
            .unwrap()
            .projects
            .iter()
            .find(|p| p.name == name)
            .cloned()
    }

    pub fn namespace_named(&self, name: &str) -> Option<RancherNamespace> {
        self.state.lock().unwrap().namespaces.get(name).cloned()
    }

    pub fn members(&self) -> Vec<RancherMember> {
        self.state.lock().unwrap().members.clone()
    }

    fn record(&self, call: String, operation: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.failing_operations.contains(operation) {
            return Err(Error::Platform {
                operation: operation.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Rancher for FakeRancher {
    async fn cluster_id_by_name(&self, name: &str) -> Result<Option<String>> {
        self.record(format!("GetClusterIdByName {name}"), "GetClusterIdByName")?;
        Ok(self.state.lock().unwrap().clusters.get(name).cloned())
    }

    async fn project_by_name(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<RancherProject>> {
        self.record(
            format!("GetProjectByName {cluster_id} {name}"),
            "GetProjectByName",
        )?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .projects
            .iter()
            .find(|p| p.cluster_id == cluster_id && p.name == name)
            .cloned())
    }

    async fn create_project(
        &self,
        cluster_id: &str,
        name: &str,
        description: Option<&str>,
        annotations: BTreeMap<String, String>,
        _resource_quota: Option<&serde_json::Value>,
    ) -> Result<RancherProject> {
        self.record(format!("CreateProject {cluster_id} {name}"), "CreateProject")?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let project = RancherProject {
            id: format!("{}:p-{}", cluster_id, state.next_id),
            cluster_id: cluster_id.to_string(),
            name: name.to_string(),
            description: description.map(|d| d.to_string()),
            annotations,
        };
        state.projects.push(project.clone());
        Ok(project)
    }

    async fn delete_project(&self, project_id: &str) -> Result<bool> {
        self.record(format!("DeleteProject {project_id}"), "DeleteProject")?;
        let mut state = self.state.lock().unwrap();
        let managed = state
            .projects
            .iter()
            .find(|p| p.id == project_id)
            .map(|p| p.is_managed_by_us());
        match managed {
            Some(true) => {
                state.projects.retain(|p| p.id != project_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn namespace(&self, _cluster_id: &str, name: &str) -> Result<Option<RancherNamespace>> {
        self.record(format!("GetNamespace {name}"), "GetNamespace")?;
        Ok(self.state.lock().unwrap().namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, project_id: &str, name: &str) -> Result<RancherNamespace> {
        self.record(format!("CreateNamespace {name}"), "CreateNamespace")?;
        let namespace = RancherNamespace {
            name: name.to_string(),
            project_id: Some(project_id.to_string()),
            annotations: BTreeMap::from([(
                MANAGED_BY_KEY.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )]),
            labels: BTreeMap::from([(
                MANAGED_BY_KEY.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )]),
        };
        self.state
            .lock()
            .unwrap()
            .namespaces
            .insert(name.to_string(), namespace.clone());
        Ok(namespace)
    }

    async fn update_namespace_project(
        &self,
        _cluster_id: &str,
        name: &str,
        new_project_id: &str,
    ) -> Result<()> {
        self.record(
            format!("UpdateNamespaceProject {name} {new_project_id}"),
            "UpdateNamespaceProject",
        )?;
        let mut state = self.state.lock().unwrap();
        let namespace = state.namespaces.get_mut(name).ok_or_else(|| Error::Platform {
            operation: "UpdateNamespaceProject".to_string(),
            message: format!("namespace '{name}' not found"),
        })?;
        namespace.project_id = Some(new_project_id.to_string());
        namespace
            .labels
            .entry(MANAGED_BY_KEY.to_string())
            .or_insert_with(|| MANAGED_BY_VALUE.to_string());
        namespace
            .annotations
            .entry(MANAGED_BY_KEY.to_string())
            .or_insert_with(|| MANAGED_BY_VALUE.to_string());
        Ok(())
    }

    async fn remove_namespace_from_project(&self, _cluster_id: &str, name: &str) -> Result<bool> {
        self.record(
            format!("RemoveNamespaceFromProject {name}"),
            "RemoveNamespaceFromProject",
        )?;
        let mut state = self.state.lock().unwrap();
        match state.namespaces.get_mut(name) {
            Some(namespace) if namespace.is_managed_by_us() => {
                namespace.project_id = Some(String::new());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_namespace(&self, _cluster_id: &str, name: &str) -> Result<bool> {
        self.record(format!("DeleteNamespace {name}"), "DeleteNamespace")?;
        let mut state = self.state.lock().unwrap();
        match state.namespaces.get(name) {
            Some(namespace) if namespace.is_managed_by_us() => {
                state.namespaces.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn project_namespaces(&self, project_id: &str) -> Result<Vec<RancherNamespace>> {
        self.record(
            format!("GetProjectNamespaces {project_id}"),
            "GetProjectNamespaces",
        )?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .namespaces
            .values()
            .filter(|ns| ns.assigned_project() == Some(project_id))
            .cloned()
            .collect())
    }

    async fn project_members(&self, project_id: &str) -> Result<Vec<RancherMember>> {
        self.record(format!("GetProjectMembers {project_id}"), "GetProjectMembers")?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .members
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create_project_member(
        &self,
        project_id: &str,
        principal_id: &str,
        role: &str,
    ) -> Result<RancherMember> {
        self.record(
            format!("CreateProjectMember {project_id} {principal_id} {role}"),
            "CreateProjectMember",
        )?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let (user, group) = if is_user_principal(principal_id) {
            (Some(principal_id.to_string()), None)
        } else {
            (None, Some(principal_id.to_string()))
        };
        let member = RancherMember {
            id: format!("prtb-{}", state.next_id),
            project_id: project_id.to_string(),
            role_template_id: role.to_string(),
            user_principal_id: user,
            group_principal_id: group,
        };
        state.members.push(member.clone());
        Ok(member)
    }

    async fn principal_id_by_name(&self, name: &str) -> Result<Option<String>> {
        self.record(
            format!("GetPrincipalIdByName {name}"),
            "GetPrincipalIdByName",
        )?;
        let state = self.state.lock().unwrap();
        Ok(state
            .principals
            .iter()
            .find(|(known, _)| known.eq_ignore_ascii_case(name))
            .map(|(_, id)| id.clone()))
    }

    async fn cluster_kubeconfig(&self, cluster_id: &str) -> Result<Option<String>> {
        self.record(
            format!("GetClusterKubeconfig {cluster_id}"),
            "GetClusterKubeconfig",
        )?;
        Ok(self.state.lock().unwrap().kubeconfigs.get(cluster_id).cloned())
    }
}
