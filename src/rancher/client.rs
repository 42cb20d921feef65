use crate::errors::{Error, Result};
use crate::rancher::token::TokenCache;
use crate::rancher::{
    is_user_principal, managed_by_annotations, Rancher, RancherMember, RancherNamespace,
    RancherProject, MANAGED_BY_KEY, MANAGED_BY_VALUE,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Norman collection envelope: every Rancher list response wraps its items
/// in a `data` array
#[derive(Deserialize)]
struct Collection<T> {
    #[serde(default)]
    data: Vec<T>,
}

#[derive(Deserialize, Default)]
struct ClusterSummary {
    id: String,
}

#[derive(Deserialize, Default)]
struct Principal {
    id: String,
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateProjectRequest<'a> {
    cluster_id: &'a str,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    annotations: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_quota: Option<&'a serde_json::Value>,
}

pub enum RancherAuth {
    /// Long-lived API token configured directly
    Token(String),
    /// (username, password) exchanged for a cached, auto-refreshed token
    UsernamePassword { username: String, password: String },
}

enum AuthState {
    Bearer(String),
    Cached(TokenCache),
}

/// Rancher v3 REST client
pub struct HttpRancher {
    base_url: String,
    http: reqwest::Client,
    auth: AuthState,
}

impl HttpRancher {
    pub fn new(url: &str, auth: RancherAuth, allow_insecure_ssl: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if allow_insecure_ssl {
            warn!("TLS certificate verification towards Rancher is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().map_err(Error::Http)?;

        let base_url = url.trim_end_matches('/').to_string();
        let auth = match auth {
            RancherAuth::Token(token) => AuthState::Bearer(token),
            RancherAuth::UsernamePassword { username, password } => AuthState::Cached(
                TokenCache::new(&base_url, username, password, http.clone()),
            ),
        };

        Ok(HttpRancher {
            base_url,
            http,
            auth,
        })
    }

    async fn bearer(&self) -> Result<String> {
        match &self.auth {
            AuthState::Bearer(token) => Ok(token.clone()),
            AuthState::Cached(cache) => cache.bearer().await,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let response = request
            .bearer_auth(self.bearer().await?)
            .send()
            .await
            .map_err(Error::Http)?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        Err(Error::Platform {
            operation: operation.to_string(),
            message: format!("{status}: {message}"),
        })
    }

    /// GET that treats 404 as `None` instead of an error
    async fn get_opt<T: serde::de::DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
    ) -> Result<Option<T>> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(self.bearer().await?)
            .send()
            .await
            .map_err(Error::Http)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Platform {
                operation: operation.to_string(),
                message: format!("{status}: {message}"),
            });
        }
        response.json().await.map(Some).map_err(Error::Http)
    }

    async fn get_namespace_raw(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<RancherNamespace>> {
        self.get_opt(
            "GetNamespace",
            &format!("/v3/clusters/{cluster_id}/namespaces/{name}"),
        )
        .await
    }

    async fn put_namespace(&self, cluster_id: &str, namespace: &RancherNamespace) -> Result<()> {
        self.send(
            "UpdateNamespace",
            self.http
                .put(self.url(&format!(
                    "/v3/clusters/{}/namespaces/{}",
                    cluster_id, namespace.name
                )))
                .json(namespace),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Rancher for HttpRancher {
    async fn cluster_id_by_name(&self, name: &str) -> Result<Option<String>> {
        let clusters: Collection<ClusterSummary> = self
            .send(
                "GetClusterIdByName",
                self.http
                    .get(self.url("/v3/clusters"))
                    .query(&[("name", name)]),
            )
            .await?
            .json()
            .await
            .map_err(Error::Http)?;
        Ok(clusters.data.into_iter().next().map(|c| c.id))
    }

    async fn project_by_name(
        &self,
        cluster_id: &str,
        name: &str,
    ) -> Result<Option<RancherProject>> {
        let projects: Collection<RancherProject> = self
            .send(
                "GetProjectByName",
                self.http
                    .get(self.url("/v3/projects"))
                    .query(&[("clusterId", cluster_id), ("name", name)]),
            )
            .await?
            .json()
            .await
            .map_err(Error::Http)?;
        // the Norman filter is not guaranteed to be exact, the name match is
        Ok(projects.data.into_iter().find(|p| p.name == name))
    }

    async fn create_project(
        &self,
        cluster_id: &str,
        name: &str,
        description: Option<&str>,
        annotations: BTreeMap<String, String>,
        resource_quota: Option<&serde_json::Value>,
    ) -> Result<RancherProject> {
        self.send(
            "CreateProject",
            self.http
                .post(self.url("/v3/projects"))
                .json(&CreateProjectRequest {
                    cluster_id,
                    name,
                    description,
                    annotations: &annotations,
                    resource_quota,
                }),
        )
        .await?
        .json()
        .await
        .map_err(Error::Http)
    }

    async fn delete_project(&self, project_id: &str) -> Result<bool> {
        let project: Option<RancherProject> = self
            .get_opt("DeleteProject", &format!("/v3/projects/{project_id}"))
            .await?;
        let project = match project {
            Some(project) => project,
            None => return Ok(false),
        };
        if !project.is_managed_by_us() {
            warn!(
                project_id,
                "refusing to delete project not managed by this operator"
            );
            return Ok(false);
        }
        self.send(
            "DeleteProject",
            self.http.delete(self.url(&format!("/v3/projects/{project_id}"))),
        )
        .await?;
        Ok(true)
    }

    async fn namespace(&self, cluster_id: &str, name: &str) -> Result<Option<RancherNamespace>> {
        self.get_namespace_raw(cluster_id, name).await
    }

    async fn create_namespace(&self, project_id: &str, name: &str) -> Result<RancherNamespace> {
        let cluster_id = project_id.split(':').next().ok_or_else(|| {
            Error::Internal(format!("malformed project id '{project_id}'"))
        })?;

        let namespace = RancherNamespace {
            name: name.to_string(),
            project_id: Some(project_id.to_string()),
            annotations: managed_by_annotations(),
            labels: BTreeMap::from([(MANAGED_BY_KEY.to_string(), MANAGED_BY_VALUE.to_string())]),
        };
        self.send(
            "CreateNamespace",
            self.http
                .post(self.url(&format!("/v3/clusters/{cluster_id}/namespaces")))
                .json(&namespace),
        )
        .await?
        .json()
        .await
        .map_err(Error::Http)
    }

    async fn update_namespace_project(
        &self,
        cluster_id: &str,
        name: &str,
        new_project_id: &str,
    ) -> Result<()> {
        let mut namespace = self
            .get_namespace_raw(cluster_id, name)
            .await?
            .ok_or_else(|| Error::Platform {
                operation: "UpdateNamespaceProject".to_string(),
                message: format!("namespace '{name}' not found in cluster '{cluster_id}'"),
            })?;

        namespace.project_id = Some(new_project_id.to_string());
        // existing labels are preserved, the marker is added when missing
        namespace
            .labels
            .entry(MANAGED_BY_KEY.to_string())
            .or_insert_with(|| MANAGED_BY_VALUE.to_string());
        namespace
            .annotations
            .entry(MANAGED_BY_KEY.to_string())
            .or_insert_with(|| MANAGED_BY_VALUE.to_string());

        self.put_namespace(cluster_id, &namespace).await
    }

    async fn remove_namespace_from_project(&self, cluster_id: &str, name: &str) -> Result<bool> {
        let mut namespace = match self.get_namespace_raw(cluster_id, name).await? {
            Some(namespace) => namespace,
            None => return Ok(false),
        };
        if !namespace.is_managed_by_us() {
            warn!(
                namespace = name,
                "refusing to detach namespace not managed by this operator"
            );
            return Ok(false);
        }
        namespace.project_id = Some(String::new());
        self.put_namespace(cluster_id, &namespace).await?;
        Ok(true)
    }

    async fn delete_namespace(&self, cluster_id: &str, name: &str) -> Result<bool> {
        let namespace = match self.get_namespace_raw(cluster_id, name).await? {
            Some(namespace) => namespace,
            None => return Ok(false),
        };
        if !namespace.is_managed_by_us() {
            warn!(
                namespace = name,
                "refusing to delete namespace not managed by this operator"
            );
            return Ok(false);
        }
        self.send(
            "DeleteNamespace",
            self.http.delete(self.url(&format!(
                "/v3/clusters/{cluster_id}/namespaces/{name}"
            ))),
        )
        .await?;
        debug!(namespace = name, cluster_id, "namespace deleted");
        Ok(true)
    }

    async fn project_namespaces(&self, project_id: &str) -> Result<Vec<RancherNamespace>> {
        let cluster_id = project_id.split(':').next().ok_or_else(|| {
            Error::Internal(format!("malformed project id '{project_id}'"))
        })?;
        let namespaces: Collection<RancherNamespace> = self
            .send(
                "GetProjectNamespaces",
                self.http
                    .get(self.url(&format!("/v3/clusters/{cluster_id}/namespaces")))
                    .query(&[("projectId", project_id)]),
            )
            .await?
            .json()
            .await
            .map_err(Error::Http)?;
        Ok(namespaces
            .data
            .into_iter()
            .filter(|ns| ns.assigned_project() == Some(project_id))
            .collect())
    }

    async fn project_members(&self, project_id: &str) -> Result<Vec<RancherMember>> {
        let members: Collection<RancherMember> = self
            .send(
                "GetProjectMembers",
                self.http
                    .get(self.url("/v3/projectroletemplatebindings"))
                    .query(&[("projectId", project_id)]),
            )
            .await?
            .json()
            .await
            .map_err(Error::Http)?;
        Ok(members.data)
    }

    async fn create_project_member(
        &self,
        project_id: &str,
        principal_id: &str,
        role: &str,
    ) -> Result<RancherMember> {
        let body = if is_user_principal(principal_id) {
            json!({
                "projectId": project_id,
                "roleTemplateId": role,
                "userPrincipalId": principal_id,
            })
        } else {
            json!({
                "projectId": project_id,
                "roleTemplateId": role,
                "groupPrincipalId": principal_id,
            })
        };
        self.send(
            "CreateProjectMember",
            self.http
                .post(self.url("/v3/projectroletemplatebindings"))
                .json(&body),
        )
        .await?
        .json()
        .await
        .map_err(Error::Http)
    }

    async fn principal_id_by_name(&self, name: &str) -> Result<Option<String>> {
        let principals: Collection<Principal> = self
            .send(
                "GetPrincipalIdByName",
                self.http
                    .post(self.url("/v3/principals?action=search"))
                    .json(&json!({ "name": name })),
            )
            .await?
            .json()
            .await
            .map_err(Error::Http)?;
        Ok(principals
            .data
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.id))
    }

    async fn cluster_kubeconfig(&self, cluster_id: &str) -> Result<Option<String>> {
        #[derive(Deserialize)]
        struct GenerateKubeconfigResponse {
            config: String,
        }

        let response = self
            .http
            .post(self.url(&format!(
                "/v3/clusters/{cluster_id}?action=generateKubeconfig"
            )))
            .bearer_auth(self.bearer().await?)
            .send()
            .await
            .map_err(Error::Http)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Platform {
                operation: "GetClusterKubeconfig".to_string(),
                message: format!("{status}: {message}"),
            });
        }
        let kubeconfig: GenerateKubeconfigResponse =
            response.json().await.map_err(Error::Http)?;
        Ok(Some(kubeconfig.config))
    }
}
