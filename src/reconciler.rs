use crate::context::Settings;
use crate::errors::{Error, Result};
use crate::events::{EventSink, Reason};
use crate::members::reconcile_members;
use crate::metrics::Metrics;
use crate::namespaces::reconcile_namespaces;
use crate::ownership::OwnershipGuard;
use crate::policy::PolicyVector;
use crate::project::{Project, ProjectMember, ProjectPhase};
use crate::rancher::{managed_by_annotations, Rancher, RancherNamespace};
use crate::status::SpecWriter;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, warn};

/// One reconcile pass for a Project CR. A spec grown by the observe import
/// is persisted through `spec_writer` mid-pass, before the namespace and
/// member steps run on it; the caller persists the status afterwards.
///
/// On failure the CR's status already reflects the error (phase, message,
/// reconcile time) and the error counter was incremented; the caller only
/// needs to write the status out and requeue.
pub async fn run_reconcile(
    cr: &mut Project,
    platform: &dyn Rancher,
    guard: &OwnershipGuard,
    spec_writer: &dyn SpecWriter,
    settings: &Settings,
    sink: &EventSink,
    metrics: &Metrics,
) -> Result<()> {
    match reconcile_inner(cr, platform, guard, spec_writer, settings, sink, metrics).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let message = e.to_string();
            let status = cr.status_mut();
            status.phase = ProjectPhase::Error;
            status.error_message = Some(message.clone());
            status.last_reconcile_time = Some(Utc::now());
            metrics.error(e.metric_label());
            sink.publish(Reason::ReconcileFailed, message).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_inner(
    cr: &mut Project,
    platform: &dyn Rancher,
    guard: &OwnershipGuard,
    spec_writer: &dyn SpecWriter,
    settings: &Settings,
    sink: &EventSink,
    metrics: &Metrics,
) -> Result<()> {
    let policies = PolicyVector::evaluate(&cr.spec);
    sink.publish(
        Reason::ReconcileStarted,
        format!("Reconciling project '{}'", cr.project_name()),
    )
    .await;

    // recover from a previous failed pass; this pass re-derives the phase
    let status = cr.status_mut();
    if status.phase == ProjectPhase::Error {
        status.phase = ProjectPhase::Pending;
    }
    status.error_message = None;

    let cluster_name = cr.spec.cluster_name.clone();
    let cluster_id = platform
        .cluster_id_by_name(&cluster_name)
        .await?
        .filter(|id| !id.is_empty());
    let cluster_id = match cluster_id {
        Some(cluster_id) => cluster_id,
        None => {
            sink.publish(
                Reason::ClusterNotFound,
                format!("Cluster '{cluster_name}' is not registered in Rancher"),
            )
            .await;
            return Err(Error::ClusterNotFound(cluster_name));
        }
    };
    cr.status_mut().cluster_id = Some(cluster_id.clone());
    sink.publish(
        Reason::ClusterResolved,
        format!("Cluster '{cluster_name}' resolved to '{cluster_id}'"),
    )
    .await;

    let project_name = cr.project_name();

    match platform.project_by_name(&cluster_id, &project_name).await? {
        None => {
            if !policies.allow_create {
                info!(
                    project = project_name,
                    "project does not exist and creation is not permitted"
                );
                cr.status_mut().phase = ProjectPhase::Pending;
                finalize(cr, policies);
                return Ok(());
            }

            sink.publish(
                Reason::CreatingProject,
                format!("Creating project '{project_name}' in cluster '{cluster_id}'"),
            )
            .await;
            let created = match platform
                .create_project(
                    &cluster_id,
                    &project_name,
                    cr.spec.description.as_deref(),
                    managed_by_annotations(),
                    cr.spec.resource_quota.as_ref(),
                )
                .await
            {
                Ok(created) => created,
                Err(e) => {
                    warn!(project = project_name, error = ?e, "project creation failed");
                    sink.publish(Reason::ProjectCreationFailed, e.to_string()).await;
                    return Err(Error::ProjectCreationFailed(project_name));
                }
            };
            cr.status_mut().project_id = Some(created.id.clone());
            sink.publish(
                Reason::ProjectCreated,
                format!("Created project '{}' ({})", project_name, created.id),
            )
            .await;
        }
        Some(existing) => {
            // a pre-existing project with the right name is taken over, never
            // treated as an error
            let first_bind = cr
                .status
                .as_ref()
                .and_then(|s| s.project_id.as_ref())
                .is_none();
            cr.status_mut().project_id = Some(existing.id.clone());
            if first_bind {
                sink.publish(
                    Reason::ProjectTakenOver,
                    format!("Bound to existing project '{}' ({})", project_name, existing.id),
                )
                .await;
            } else {
                sink.publish(
                    Reason::ProjectObserved,
                    format!("Project '{}' ({})", project_name, existing.id),
                )
                .await;
            }

            if policies.allow_observe {
                let namespaces = platform.project_namespaces(&existing.id).await?;
                if observe_import(cr, platform, &namespaces, &existing.id, sink).await? {
                    // the grown spec is persisted before anything acts on it
                    let in_memory_status = cr.status.clone();
                    *cr = spec_writer.write_spec(cr).await?;
                    cr.status = in_memory_status;
                }
                tag_discovered_namespaces(platform, &cluster_id, &existing.id, &namespaces)
                    .await?;
            }
        }
    }

    reconcile_namespaces(cr, platform, guard, policies, settings, sink, metrics).await?;
    reconcile_members(cr, platform, policies, sink, metrics).await?;

    finalize(cr, policies);
    sink.publish(
        Reason::ReconcileCompleted,
        format!("Project '{project_name}' reconciled"),
    )
    .await;
    Ok(())
}

/// One-shot import of out-of-band state into empty spec fields. A non-empty
/// field is authoritative and never touched.
async fn observe_import(
    cr: &mut Project,
    platform: &dyn Rancher,
    namespaces: &[RancherNamespace],
    project_id: &str,
    sink: &EventSink,
) -> Result<bool> {
    let mut changed = false;

    if cr.spec.namespaces.is_empty() && !namespaces.is_empty() {
        cr.spec.namespaces = namespaces.iter().map(|ns| ns.name.to_lowercase()).collect();
        changed = true;
        info!(
            project = project_id,
            namespaces = ?cr.spec.namespaces,
            "imported namespaces from existing project"
        );
    }

    if cr.spec.members.is_empty() {
        let members = platform.project_members(project_id).await?;
        for member in members {
            if let Some(principal_id) = member.principal_id() {
                cr.spec.members.push(ProjectMember {
                    principal_id: Some(principal_id.to_string()),
                    principal_name: None,
                    role: member.role_template_id.clone(),
                });
                changed = true;
            }
        }
    }

    if changed {
        sink.publish(
            Reason::ProjectObserved,
            format!(
                "Imported {} namespaces and {} members from project '{}'",
                cr.spec.namespaces.len(),
                cr.spec.members.len(),
                project_id
            ),
        )
        .await;
    }

    Ok(changed)
}

/// Discovered namespaces become manageable: stamp the managed-by marker
/// where missing
async fn tag_discovered_namespaces(
    platform: &dyn Rancher,
    cluster_id: &str,
    project_id: &str,
    namespaces: &[RancherNamespace],
) -> Result<()> {
    for ns in namespaces {
        if !ns.is_managed_by_us() {
            platform
                .update_namespace_project(cluster_id, &ns.name, project_id)
                .await?;
            debug!(namespace = ns.name, "tagged namespace with managed-by marker");
        }
    }
    Ok(())
}

fn finalize(cr: &mut Project, policies: PolicyVector) {
    let now = Utc::now();
    let status = cr.status_mut();
    status.last_reconcile_time = Some(now);
    if status.created_timestamp.is_none() && status.project_id.is_some() {
        status.created_timestamp = Some(now);
    }
    status.last_updated_timestamp = Some(now);
    // isolated per-namespace failures already set the Error phase; a clean
    // pass with Create permission means the project is live
    if status.phase != ProjectPhase::Error {
        if status.project_id.is_some() && policies.allow_create {
            status.phase = ProjectPhase::Active;
        }
        status.error_message = None;
    }
}

/// Cleanup on CR deletion. Without the Delete policy the platform project is
/// abandoned by design and nothing is touched.
pub async fn run_cleanup(
    cr: &Project,
    platform: &dyn Rancher,
    settings: &Settings,
    sink: &EventSink,
    metrics: &Metrics,
) -> Result<()> {
    let policies = PolicyVector::evaluate(&cr.spec);
    if !policies.allow_delete {
        info!(
            project = cr.name_any(),
            "Delete policy absent, leaving the Rancher project in place"
        );
        return Ok(());
    }

    let status = match cr.status.as_ref() {
        Some(status) => status,
        None => {
            warn!(project = cr.name_any(), "no status recorded, nothing to clean up");
            return Ok(());
        }
    };
    let project_id = match status.project_id.as_deref() {
        Some(project_id) => project_id,
        None => {
            warn!(project = cr.name_any(), "no project bound, nothing to clean up");
            return Ok(());
        }
    };
    // the cluster prefix of the project id is authoritative even when the
    // status field is missing
    let cluster_id = status
        .cluster_id
        .clone()
        .or_else(|| project_id.split(':').next().map(|c| c.to_string()))
        .ok_or_else(|| Error::Internal(format!("malformed project id '{project_id}'")))?;

    sink.publish(
        Reason::DeletionStarted,
        format!("Cleaning up project '{project_id}'"),
    )
    .await;

    for name in &status.created_namespaces {
        let name = name.to_lowercase();
        if let Err(e) =
            cleanup_namespace(&name, &cluster_id, platform, policies, settings, sink).await
        {
            warn!(namespace = name.as_str(), error = ?e, "namespace cleanup failed");
            metrics.error("deletion_failed");
            sink.publish(Reason::DeletionFailed, format!("Namespace '{name}': {e}"))
                .await;
        }
    }

    match platform.delete_project(project_id).await {
        Ok(true) => {
            sink.publish(
                Reason::ProjectDeleted,
                format!("Deleted project '{project_id}'"),
            )
            .await;
            Ok(())
        }
        Ok(false) => {
            warn!(
                project_id,
                "project preserved, it is not managed by this operator"
            );
            Ok(())
        }
        Err(e) => {
            metrics.error("deletion_failed");
            sink.publish(Reason::DeletionFailed, e.to_string()).await;
            Err(e)
        }
    }
}

async fn cleanup_namespace(
    name: &str,
    cluster_id: &str,
    platform: &dyn Rancher,
    policies: PolicyVector,
    settings: &Settings,
    sink: &EventSink,
) -> Result<()> {
    let namespace = match platform.namespace(cluster_id, name).await? {
        Some(namespace) => namespace,
        None => return Ok(()),
    };

    if policies.allow_ns_delete && settings.cleanup_namespaces {
        if !namespace.is_managed_by_us() {
            warn!(namespace = name, "not deleting namespace without the managed-by marker");
            return Ok(());
        }
        if platform.delete_namespace(cluster_id, name).await? {
            sink.publish(
                Reason::NamespaceDeleted,
                format!("Deleted namespace '{name}'"),
            )
            .await;
        }
    } else if policies.allow_ns_update {
        if !namespace.is_managed_by_us() {
            warn!(namespace = name, "not detaching namespace without the managed-by marker");
            return Ok(());
        }
        if platform.remove_namespace_from_project(cluster_id, name).await? {
            sink.publish(
                Reason::NamespaceRemoved,
                format!("Detached namespace '{name}' from its project"),
            )
            .await;
        }
    }
    Ok(())
}
