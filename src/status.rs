use crate::errors::{Error, Result};
use crate::project::Project;

use async_trait::async_trait;
use kube::api::{Api, PostParams, ResourceExt};
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::debug;

const CONFLICT_ATTEMPTS: u32 = 3;

/// Seam through which the reconciler persists a spec it grew mid-pass (the
/// observe import), so the write lands before the namespace and member
/// steps run on it.
#[async_trait]
pub trait SpecWriter: Send + Sync {
    /// Persist `project.spec` with conflict retry, returning the stored
    /// object
    async fn write_spec(&self, project: &Project) -> Result<Project>;
}

#[async_trait]
impl SpecWriter for Api<Project> {
    async fn write_spec(&self, project: &Project) -> Result<Project> {
        update_spec(self, project).await
    }
}

/// Test double: records every written spec and echoes the object back
#[cfg(test)]
#[derive(Default)]
pub struct RecordingSpecWriter {
    writes: std::sync::Mutex<Vec<crate::project::ProjectSpec>>,
}

#[cfg(test)]
impl RecordingSpecWriter {
    pub fn written_specs(&self) -> Vec<crate::project::ProjectSpec> {
        self.writes.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl SpecWriter for RecordingSpecWriter {
    async fn write_spec(&self, project: &Project) -> Result<Project> {
        self.writes.lock().unwrap().push(project.spec.clone());
        Ok(project.clone())
    }
}

fn is_conflict(error: &Error) -> bool {
    matches!(error, Error::Kube(kube::Error::Api(response)) if response.code == 409)
}

/// Runs `attempt_fn` up to three times, retrying on resource-version
/// conflicts with a `100 * attempt` ms pause in between. The attempt number
/// (1-based) is passed in so callers can refetch-and-merge on retries.
pub async fn with_conflict_retry<T, F, Fut>(operation: &str, mut attempt_fn: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) && attempt < CONFLICT_ATTEMPTS => {
                debug!(operation, attempt, "conflict on write, retrying");
                sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write `project.status` through the status subresource. On conflict the CR
/// is refetched and the in-memory status carried onto the fresh resource
/// version.
pub async fn update_status(api: &Api<Project>, project: &Project) -> Result<Project> {
    let name = project.name_any();
    with_conflict_retry("status update", |attempt| {
        let api = api.clone();
        let name = name.clone();
        let project = project.clone();
        async move {
            let latest = if attempt == 1 {
                project
            } else {
                let mut refetched = api.get(&name).await.map_err(Error::Kube)?;
                refetched.status = project.status;
                refetched
            };
            let data = serde_json::to_vec(&latest).map_err(Error::Serialization)?;
            api.replace_status(&name, &PostParams::default(), data)
                .await
                .map_err(Error::Kube)
        }
    })
    .await
}

/// Write `project.spec` with the same refetch-and-merge discipline. Used by
/// the observe import and never shrinks anything: the in-memory spec is
/// authoritative for this write.
pub async fn update_spec(api: &Api<Project>, project: &Project) -> Result<Project> {
    let name = project.name_any();
    with_conflict_retry("spec update", |attempt| {
        let api = api.clone();
        let name = name.clone();
        let project = project.clone();
        async move {
            let latest = if attempt == 1 {
                project
            } else {
                let mut refetched = api.get(&name).await.map_err(Error::Kube)?;
                refetched.spec = project.spec;
                refetched
            };
            api.replace(&name, &PostParams::default(), &latest)
                .await
                .map_err(Error::Kube)
        }
    })
    .await
}
