use crate::context::Context;
use crate::errors::{Error, Result};
use crate::events::{EventSink, Reason};
use crate::policy::PolicyVector;
use crate::rancher::PROJECT_ID_ANNOTATION;
use crate::status;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::watcher,
};
use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

lazy_static! {
    static ref WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(5);
}

/// How the observe loop follows downstream clusters
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ObserveMethod {
    /// Streaming namespace watch per cluster, reconnecting on termination
    Watch,
    /// Periodic full namespace listing per cluster
    Poll,
    /// Observe loop idles
    None,
}

struct WatchHandle {
    task: JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Follow the downstream clusters referenced by Observe-enabled CRs and fold
/// namespaces discovered there back into the CR specs.
///
/// Namespaces that vanish are not handled here: the reconciler's
/// manual-removal pass turns those into tombstones.
pub async fn run(ctx: Arc<Context>) {
    if ctx.settings.observe_method == ObserveMethod::None {
        info!("observe loop disabled");
        return;
    }

    let mut watches: HashMap<String, WatchHandle> = HashMap::new();

    loop {
        refresh_watches(&ctx, &mut watches).await;

        tokio::select! {
            _ = sleep(ctx.settings.cluster_check_interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("observe loop shutting down");
                // dropping the handles aborts the per-cluster tasks
                watches.clear();
                return;
            }
        }
    }
}

/// Bring the set of watched clusters in line with the clusters referenced by
/// Observe-enabled CRs
async fn refresh_watches(ctx: &Arc<Context>, watches: &mut HashMap<String, WatchHandle>) {
    let clusters = match observed_clusters(ctx).await {
        Ok(clusters) => clusters,
        Err(e) => {
            warn!(error = ?e, "cannot determine clusters to observe");
            return;
        }
    };

    watches.retain(|cluster, _| {
        let keep = clusters.contains(cluster);
        if !keep {
            info!(cluster, "no CR observes this cluster anymore, stopping");
        }
        keep
    });

    for cluster in clusters {
        if watches.contains_key(&cluster) {
            continue;
        }
        info!(
            cluster = cluster.as_str(),
            method = ?ctx.settings.observe_method,
            "observing namespaces of downstream cluster"
        );
        let task = match ctx.settings.observe_method {
            ObserveMethod::Watch => tokio::spawn(watch_cluster(ctx.clone(), cluster.clone())),
            ObserveMethod::Poll => tokio::spawn(poll_cluster(ctx.clone(), cluster.clone())),
            ObserveMethod::None => continue,
        };
        watches.insert(cluster, WatchHandle { task });
    }
}

/// Distinct cluster names referenced by CRs carrying the Observe policy
async fn observed_clusters(ctx: &Arc<Context>) -> Result<HashSet<String>> {
    let projects = ctx
        .projects_api()
        .list(&ListParams::default())
        .await
        .map_err(Error::Kube)?;
    Ok(projects
        .items
        .iter()
        .filter(|cr| PolicyVector::evaluate(&cr.spec).allow_observe)
        .map(|cr| cr.spec.cluster_name.clone())
        .collect())
}

async fn watch_cluster(ctx: Arc<Context>, cluster_name: String) {
    loop {
        let client = match downstream_client(&ctx, &cluster_name).await {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    cluster = cluster_name.as_str(),
                    error = ?e,
                    "cannot connect to downstream cluster"
                );
                sleep(*WATCH_RECONNECT_DELAY).await;
                continue;
            }
        };

        let namespaces: Api<Namespace> = Api::all(client);
        let mut stream = watcher(namespaces, watcher::Config::default()).boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(watcher::Event::Applied(ns)) => {
                    process_namespace(&ctx, &cluster_name, &ns).await;
                }
                Ok(watcher::Event::Restarted(namespaces)) => {
                    for ns in &namespaces {
                        process_namespace(&ctx, &cluster_name, ns).await;
                    }
                }
                Ok(watcher::Event::Deleted(_)) => {}
                Err(e) => {
                    warn!(cluster = cluster_name.as_str(), error = ?e, "namespace watch error");
                    break;
                }
            }
        }

        warn!(
            cluster = cluster_name.as_str(),
            "namespace watch terminated, reconnecting"
        );
        sleep(*WATCH_RECONNECT_DELAY).await;
    }
}

async fn poll_cluster(ctx: Arc<Context>, cluster_name: String) {
    loop {
        match downstream_client(&ctx, &cluster_name).await {
            Ok(client) => {
                let namespaces: Api<Namespace> = Api::all(client);
                match namespaces.list(&ListParams::default()).await {
                    Ok(list) => {
                        for ns in &list.items {
                            process_namespace(&ctx, &cluster_name, ns).await;
                        }
                    }
                    Err(e) => {
                        warn!(cluster = cluster_name.as_str(), error = ?e, "cannot list namespaces");
                    }
                }
            }
            Err(e) => {
                warn!(
                    cluster = cluster_name.as_str(),
                    error = ?e,
                    "cannot connect to downstream cluster"
                );
            }
        }
        sleep(ctx.settings.polling_interval).await;
    }
}

/// Build a `kube::Client` for the downstream cluster out of the kubeconfig
/// Rancher generates for it
async fn downstream_client(ctx: &Arc<Context>, cluster_name: &str) -> Result<Client> {
    let cluster_id = ctx
        .rancher
        .cluster_id_by_name(cluster_name)
        .await?
        .ok_or_else(|| Error::ClusterNotFound(cluster_name.to_string()))?;
    let kubeconfig_yaml = ctx
        .rancher
        .cluster_kubeconfig(&cluster_id)
        .await?
        .ok_or_else(|| {
            Error::Internal(format!("Rancher has no kubeconfig for cluster '{cluster_id}'"))
        })?;

    let kubeconfig: Kubeconfig = serde_yaml::from_str(&kubeconfig_yaml)
        .map_err(|e| Error::Internal(format!("cannot parse generated kubeconfig: {e}")))?;
    let client_config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(Error::Kubeconfig)?;
    Client::try_from(client_config).map_err(Error::Kube)
}

/// Fold one downstream namespace into the spec of the first Observe-enabled
/// CR that owns its project and does not list it yet
async fn process_namespace(ctx: &Arc<Context>, cluster_name: &str, namespace: &Namespace) {
    let project_id = match namespace.annotations().get(PROJECT_ID_ANNOTATION) {
        Some(project_id) => project_id.clone(),
        None => return,
    };
    let ns_name = namespace.name_any().to_lowercase();

    let projects_api = ctx.projects_api();
    let projects = match projects_api.list(&ListParams::default()).await {
        Ok(projects) => projects,
        Err(e) => {
            warn!(error = ?e, "cannot list Project CRs");
            return;
        }
    };

    let candidate = projects.items.into_iter().find(|cr| {
        PolicyVector::evaluate(&cr.spec).allow_observe
            && cr.spec.cluster_name == cluster_name
            && cr.status.as_ref().and_then(|s| s.project_id.as_deref())
                == Some(project_id.as_str())
            && !cr.wants_namespace(&ns_name)
    });
    let mut cr = match candidate {
        Some(cr) => cr,
        None => {
            debug!(
                namespace = ns_name.as_str(),
                project_id = project_id.as_str(),
                "namespace does not belong to an observed project"
            );
            return;
        }
    };

    cr.spec.namespaces.push(ns_name.clone());
    match status::update_spec(&projects_api, &cr).await {
        Ok(_) => {
            info!(
                namespace = ns_name.as_str(),
                project = cr.name_any(),
                "discovered namespace added to spec"
            );
            EventSink::new(ctx.recorder(&cr).await)
                .publish(
                    Reason::NamespaceDiscovered,
                    format!("Discovered namespace '{ns_name}' in cluster '{cluster_name}'"),
                )
                .await;
        }
        Err(e) => {
            warn!(
                namespace = ns_name.as_str(),
                project = cr.name_any(),
                error = ?e,
                "cannot record discovered namespace"
            );
        }
    }
}
