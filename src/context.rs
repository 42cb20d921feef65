use crate::metrics::Metrics;
use crate::observe::ObserveMethod;
use crate::project::Project;
use crate::rancher::Rancher;

use chrono::{DateTime, Utc};
use kube::runtime::events::{Recorder, Reporter};
use kube::{client::Client, Api, Resource};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Operator-level configuration shared by the reconcilers and the observe
/// loop
#[derive(Clone, Debug)]
pub struct Settings {
    /// Arms namespace deletion under the Delete policy. Off by default:
    /// namespaces are detached, never destroyed
    pub cleanup_namespaces: bool,
    pub observe_method: ObserveMethod,
    /// How often the observe loop refreshes the set of watched clusters
    pub cluster_check_interval: Duration,
    /// Namespace sweep cadence in poll mode
    pub polling_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cleanup_namespaces: false,
            observe_method: ObserveMethod::Watch,
            cluster_check_interval: Duration::from_secs(5 * 60),
            polling_interval: Duration::from_secs(2 * 60),
        }
    }
}

/// Diagnostics read by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "rancher-devops-operator".into(),
        }
    }
}

impl Diagnostics {
    pub fn recorder(&self, client: Client, project: &Project) -> Recorder {
        Recorder::new(client, self.reporter.clone(), project.object_ref(&()))
    }
}

/// Context for the reconcilers and the observe loop
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client for the cluster hosting the Project CRs
    client: Client,
    /// Typed client towards Rancher
    pub rancher: Arc<dyn Rancher>,
    pub settings: Settings,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
}

impl Context {
    pub fn new(client: Client, rancher: Arc<dyn Rancher>, settings: Settings) -> Self {
        Context {
            client,
            rancher,
            settings,
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Metrics::default(),
        }
    }

    /// `kube::Api` for the cluster-scoped Project CRs
    pub fn projects_api(&self) -> Api<Project> {
        Api::all(self.client.clone())
    }

    pub async fn recorder(&self, project: &Project) -> Recorder {
        self.diagnostics
            .read()
            .await
            .recorder(self.client.clone(), project)
    }

    /// Prometheus exposition text for the `/metrics` endpoint
    pub fn render_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.metrics.registry)?;
        Ok(buffer)
    }
}
