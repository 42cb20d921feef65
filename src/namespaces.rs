use crate::context::Settings;
use crate::errors::{Error, Result};
use crate::events::{EventSink, Reason};
use crate::metrics::Metrics;
use crate::ownership::OwnershipGuard;
use crate::policy::PolicyVector;
use crate::project::{Project, ProjectPhase};
use crate::rancher::Rancher;

use kube::ResourceExt;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

/// Drive every namespace in the CR's spec to its desired state, then sweep
/// project namespaces that are no longer desired.
///
/// Ordering within one pass:
/// 1. tombstone maintenance: entries no longer in spec are dropped, manual
///    removals are detected against the platform's current view
/// 2. per-namespace upsert loop, skipping tombstoned names
/// 3. sweep of project namespaces absent from spec
///
/// An ownership conflict aborts the pass immediately; any other
/// per-namespace failure is isolated and the loop continues.
pub async fn reconcile_namespaces(
    cr: &mut Project,
    platform: &dyn Rancher,
    guard: &OwnershipGuard,
    policies: PolicyVector,
    settings: &Settings,
    sink: &EventSink,
    metrics: &Metrics,
) -> Result<()> {
    let (cluster_id, project_id) = match cr.status.as_ref() {
        Some(status) => match (status.cluster_id.clone(), status.project_id.clone()) {
            (Some(cluster_id), Some(project_id)) => (cluster_id, project_id),
            _ => return Ok(()),
        },
        None => return Ok(()),
    };

    let desired = deduplicate(cr.desired_namespaces());

    record_manual_removals(cr, platform, &desired, &project_id, sink).await?;

    // the audit trail records this pass's creations only
    cr.status_mut().created_namespaces.clear();

    let mut attached_now: Vec<String> = Vec::new();
    for name in &desired {
        if cr
            .status_mut()
            .manually_removed_namespaces
            .contains(name)
        {
            debug!(namespace = name.as_str(), "skipping tombstoned namespace");
            continue;
        }

        match reconcile_one(
            cr,
            platform,
            name,
            &cluster_id,
            &project_id,
            guard,
            policies,
            sink,
            metrics,
        )
        .await
        {
            Ok(true) => attached_now.push(name.clone()),
            Ok(false) => {}
            Err(e @ Error::NamespaceConflict(_)) => return Err(e),
            Err(e) => {
                error!(
                    namespace = name.as_str(),
                    error = ?e,
                    "namespace processing failed"
                );
                metrics.error("namespace_processing_failed");
                sink.publish(
                    Reason::NamespaceProcessingFailed,
                    format!("Namespace '{name}': {e}"),
                )
                .await;
                let status = cr.status_mut();
                status.phase = ProjectPhase::Error;
                status.error_message = Some(e.to_string());
            }
        }
    }

    update_observed_namespaces(cr, &desired, attached_now);

    sweep_undesired(
        platform, &desired, &cluster_id, &project_id, policies, settings, sink, metrics,
    )
    .await;

    Ok(())
}

/// Fold this pass's attachments into the long-lived record of names the CR
/// has seen in the project. Names drop out only when they leave the spec or
/// become tombstones, so a transient per-namespace error does not erase the
/// history the manual-removal check relies on.
fn update_observed_namespaces(cr: &mut Project, desired: &[String], attached_now: Vec<String>) {
    let status = cr.status_mut();
    let tombstones = status.manually_removed_namespaces.clone();
    let mut observed: Vec<String> = status
        .observed_namespaces
        .iter()
        .map(|name| name.to_lowercase())
        .filter(|name| desired.contains(name) && !tombstones.contains(name))
        .collect();
    for name in attached_now {
        if !observed.contains(&name) {
            observed.push(name);
        }
    }
    status.observed_namespaces = observed;
}

/// Move spec names that were attached to the project in an earlier pass,
/// but which have since disappeared from it, onto the tombstone list.
/// Tombstoned names are skipped by the upsert loop, so a user-deleted
/// namespace is never recreated behind the user's back. Eligibility comes
/// from `status.observedNamespaces` — a name never seen attached (cold
/// create, failed creation, missing permission) is not a removal.
async fn record_manual_removals(
    cr: &mut Project,
    platform: &dyn Rancher,
    desired: &[String],
    project_id: &str,
    sink: &EventSink,
) -> Result<()> {
    // a tombstone only matters while its name is still desired
    cr.status_mut()
        .manually_removed_namespaces
        .retain(|name| desired.contains(name));

    let current: HashSet<String> = platform
        .project_namespaces(project_id)
        .await?
        .into_iter()
        .map(|ns| ns.name.to_lowercase())
        .collect();

    let previously_attached: Vec<String> = cr
        .status_mut()
        .observed_namespaces
        .iter()
        .map(|name| name.to_lowercase())
        .collect();

    for name in desired {
        let removed_out_of_band = previously_attached.contains(name)
            && !current.contains(name)
            && !cr.status_mut().manually_removed_namespaces.contains(name);
        if removed_out_of_band {
            warn!(
                namespace = name.as_str(),
                "namespace was removed from the project out-of-band, will not recreate"
            );
            cr.status_mut()
                .manually_removed_namespaces
                .push(name.clone());
            sink.publish(
                Reason::NamespaceManuallyRemoved,
                format!("Namespace '{name}' was manually removed and will not be recreated"),
            )
            .await;
        }
    }

    Ok(())
}

/// Returns `true` when the namespace ends the step attached to the project
#[allow(clippy::too_many_arguments)]
async fn reconcile_one(
    cr: &mut Project,
    platform: &dyn Rancher,
    name: &str,
    cluster_id: &str,
    project_id: &str,
    guard: &OwnershipGuard,
    policies: PolicyVector,
    sink: &EventSink,
    metrics: &Metrics,
) -> Result<bool> {
    let namespace = platform.namespace(cluster_id, name).await?;

    match namespace {
        None => {
            if !policies.allow_ns_create {
                info!(
                    namespace = name,
                    "namespace is missing but namespace creation is not permitted"
                );
                return Ok(false);
            }
            match platform.create_namespace(project_id, name).await {
                Ok(_) => {
                    cr.status_mut().created_namespaces.push(name.to_string());
                    metrics.namespaces_created.inc();
                    sink.publish(
                        Reason::NamespaceCreated,
                        format!("Created namespace '{name}' in project '{project_id}'"),
                    )
                    .await;
                    Ok(true)
                }
                Err(e) => {
                    metrics.error("namespace_creation_failed");
                    Err(e)
                }
            }
        }
        Some(ns) => match ns.assigned_project() {
            Some(current) if current == project_id => {
                debug!(namespace = name, "namespace already in the project");
                Ok(true)
            }
            Some(other) => {
                if guard.is_claimed_by_another(name, &cr.name_any()) {
                    sink.publish(
                        Reason::NamespaceConflict,
                        format!("Namespace '{name}' is claimed by another Project CR"),
                    )
                    .await;
                    return Err(Error::NamespaceConflict(name.to_string()));
                }
                if !policies.allow_ns_update {
                    info!(
                        namespace = name,
                        current_project = other,
                        "namespace belongs to another project and moving is not permitted"
                    );
                    return Ok(false);
                }
                platform
                    .update_namespace_project(cluster_id, name, project_id)
                    .await?;
                sink.publish(
                    Reason::NamespaceMoved,
                    format!("Moved namespace '{name}' from project '{other}' to '{project_id}'"),
                )
                .await;
                Ok(true)
            }
            None => {
                if !policies.allow_ns_update {
                    info!(
                        namespace = name,
                        "namespace is unassigned and assigning is not permitted"
                    );
                    return Ok(false);
                }
                platform
                    .update_namespace_project(cluster_id, name, project_id)
                    .await?;
                sink.publish(
                    Reason::NamespaceAssigned,
                    format!("Assigned namespace '{name}' to project '{project_id}'"),
                )
                .await;
                Ok(true)
            }
        },
    }
}

/// Handle project namespaces that are no longer in the spec: delete them
/// when the Delete policy and the operator config both allow it, otherwise
/// detach them from the project, otherwise leave them alone. Both
/// destructive paths are gated on the managed-by marker.
#[allow(clippy::too_many_arguments)]
async fn sweep_undesired(
    platform: &dyn Rancher,
    desired: &[String],
    cluster_id: &str,
    project_id: &str,
    policies: PolicyVector,
    settings: &Settings,
    sink: &EventSink,
    metrics: &Metrics,
) {
    let observed = match platform.project_namespaces(project_id).await {
        Ok(namespaces) => namespaces,
        Err(e) => {
            warn!(error = ?e, "cannot list project namespaces, skipping sweep");
            return;
        }
    };

    for ns in observed {
        let name = ns.name.to_lowercase();
        if desired.contains(&name) {
            continue;
        }

        let result = if policies.allow_ns_delete && settings.cleanup_namespaces {
            if !ns.is_managed_by_us() {
                warn!(
                    namespace = name.as_str(),
                    "not deleting namespace without the managed-by marker"
                );
                continue;
            }
            platform
                .delete_namespace(cluster_id, &name)
                .await
                .map(|deleted| (deleted, Reason::NamespaceDeleted, "Deleted"))
        } else if policies.allow_ns_update {
            if !ns.is_managed_by_us() {
                warn!(
                    namespace = name.as_str(),
                    "not detaching namespace without the managed-by marker"
                );
                continue;
            }
            platform
                .remove_namespace_from_project(cluster_id, &name)
                .await
                .map(|removed| (removed, Reason::NamespaceRemoved, "Removed"))
        } else {
            debug!(
                namespace = name.as_str(),
                "namespace left in project, no permission to remove it"
            );
            continue;
        };

        match result {
            Ok((true, reason, verb)) => {
                info!(namespace = name.as_str(), "{}", verb.to_lowercase());
                sink.publish(
                    reason,
                    format!("{verb} namespace '{name}' no longer present in spec"),
                )
                .await;
            }
            Ok((false, _, _)) => {
                warn!(
                    namespace = name.as_str(),
                    "platform refused to remove namespace"
                );
            }
            Err(e) => {
                error!(namespace = name.as_str(), error = ?e, "namespace removal failed");
                metrics.error("namespace_removal_failed");
                sink.publish(
                    Reason::NamespaceRemovalFailed,
                    format!("Namespace '{name}': {e}"),
                )
                .await;
            }
        }
    }
}

fn deduplicate(namespaces: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    namespaces
        .into_iter()
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ProjectSpec, ProjectStatus};
    use crate::rancher::fake::FakeRancher;

    fn project(name: &str, namespaces: &[&str]) -> Project {
        let mut project = Project::new(name, ProjectSpec::default());
        project.spec.namespaces = namespaces.iter().map(|n| n.to_string()).collect();
        project.status = Some(ProjectStatus {
            cluster_id: Some("c-1".to_string()),
            project_id: Some("c-1:p-1".to_string()),
            ..ProjectStatus::default()
        });
        project
    }

    fn default_policies() -> PolicyVector {
        PolicyVector::evaluate(&ProjectSpec::default())
    }

    async fn run(
        cr: &mut Project,
        platform: &FakeRancher,
        guard: &OwnershipGuard,
        policies: PolicyVector,
        settings: &Settings,
        sink: &EventSink,
    ) -> Result<()> {
        reconcile_namespaces(
            cr,
            platform,
            guard,
            policies,
            settings,
            sink,
            &Metrics::default(),
        )
        .await
    }

    #[tokio::test]
    async fn test_missing_namespaces_are_created_lowercased() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        let mut cr = project("p1", &["Ns-A", "ns-b"]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert!(platform.namespace_named("ns-a").is_some());
        assert!(platform.namespace_named("ns-b").is_some());
        assert!(platform.namespace_named("Ns-A").is_none());
        assert_eq!(
            cr.status.unwrap().created_namespaces,
            vec!["ns-a", "ns-b"]
        );
        assert!(sink.has_reason(Reason::NamespaceCreated));
    }

    #[tokio::test]
    async fn test_created_namespaces_carry_the_managed_by_marker() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        let mut cr = project("p1", &["ns-a"]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert!(platform.namespace_named("ns-a").unwrap().is_managed_by_us());
    }

    #[tokio::test]
    async fn test_tombstoned_namespace_is_never_recreated() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        let mut cr = project("p1", &["ns-a"]);
        cr.status_mut()
            .manually_removed_namespaces
            .push("ns-a".to_string());
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert!(!platform.issued("CreateNamespace"));
        assert_eq!(
            cr.status.unwrap().manually_removed_namespaces,
            vec!["ns-a"]
        );
    }

    #[tokio::test]
    async fn test_out_of_band_removal_is_tombstoned_not_recreated() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        // previous pass created ns-a, the admin since deleted it
        let mut cr = project("p1", &["ns-a"]);
        cr.status_mut().created_namespaces.push("ns-a".to_string());
        cr.status_mut().observed_namespaces.push("ns-a".to_string());
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert!(!platform.issued("CreateNamespace"));
        assert!(sink.has_reason(Reason::NamespaceManuallyRemoved));
        let status = cr.status.unwrap();
        assert_eq!(status.manually_removed_namespaces, vec!["ns-a"]);
        assert!(status.created_namespaces.is_empty());
        // the tombstone replaces the attachment record
        assert!(status.observed_namespaces.is_empty());
    }

    #[tokio::test]
    async fn test_removal_after_namespace_stabilized_is_still_tombstoned() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        let mut cr = project("p1", &["ns-a"]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();
        let settings = Settings::default();

        // pass 1 creates ns-a, pass 2 finds it satisfied
        run(&mut cr, &platform, &guard, default_policies(), &settings, &sink)
            .await
            .unwrap();
        run(&mut cr, &platform, &guard, default_policies(), &settings, &sink)
            .await
            .unwrap();
        let status = cr.status.as_ref().unwrap();
        assert!(status.created_namespaces.is_empty());
        assert_eq!(status.observed_namespaces, vec!["ns-a"]);

        // the admin detaches ns-a out-of-band between passes
        platform.seed_namespace("ns-a", None, true);
        run(&mut cr, &platform, &guard, default_policies(), &settings, &sink)
            .await
            .unwrap();

        assert!(sink.has_reason(Reason::NamespaceManuallyRemoved));
        assert!(!platform.issued("UpdateNamespaceProject ns-a"));
        assert_eq!(
            platform.namespace_named("ns-a").unwrap().assigned_project(),
            None
        );
        let status = cr.status.unwrap();
        assert_eq!(status.manually_removed_namespaces, vec!["ns-a"]);
    }

    #[tokio::test]
    async fn test_dropping_the_name_from_spec_clears_the_tombstone() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        let mut cr = project("p1", &["ns-b"]);
        cr.status_mut()
            .manually_removed_namespaces
            .push("ns-a".to_string());
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert!(cr.status.unwrap().manually_removed_namespaces.is_empty());
    }

    #[tokio::test]
    async fn test_namespace_claimed_by_another_cr_aborts_the_pass() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        platform.seed_namespace("ns-shared", Some("c-1:p-9"), true);
        let mut cr = project("p2", &["ns-shared", "ns-later"]);
        let other = project("p1", &["ns-shared"]);
        let guard = OwnershipGuard::from_projects([other].iter());
        let sink = EventSink::buffered();

        let result = run(
            &mut cr,
            &platform,
            &guard,
            default_policies(),
            &Settings::default(),
            &sink,
        )
        .await;

        assert!(matches!(result, Err(Error::NamespaceConflict(_))));
        assert!(sink.has_reason(Reason::NamespaceConflict));
        // the conflict aborts before ns-later is processed
        assert!(!platform.issued("CreateNamespace ns-later"));
        assert!(!platform.issued("UpdateNamespaceProject ns-shared"));
    }

    #[tokio::test]
    async fn test_unclaimed_foreign_namespace_is_moved() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        platform.seed_namespace("ns-a", Some("c-1:p-9"), false);
        let mut cr = project("p1", &["ns-a"]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert_eq!(
            platform.namespace_named("ns-a").unwrap().assigned_project(),
            Some("c-1:p-1")
        );
        assert!(sink.has_reason(Reason::NamespaceMoved));
        // a move is not a creation
        assert!(cr.status.unwrap().created_namespaces.is_empty());
    }

    #[tokio::test]
    async fn test_unassigned_namespace_is_assigned() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        platform.seed_namespace("ns-a", None, false);
        let mut cr = project("p1", &["ns-a"]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert_eq!(
            platform.namespace_named("ns-a").unwrap().assigned_project(),
            Some("c-1:p-1")
        );
        assert!(sink.has_reason(Reason::NamespaceAssigned));
    }

    #[tokio::test]
    async fn test_without_update_permission_foreign_namespaces_are_left_alone() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        platform.seed_namespace("ns-a", Some("c-1:p-9"), false);
        let mut cr = project("p1", &["ns-a"]);
        cr.spec.namespace_management_policies = vec!["Create".to_string()];
        let policies = PolicyVector::evaluate(&cr.spec);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, policies, &Settings::default(), &sink)
            .await
            .unwrap();

        assert!(!platform.issued("UpdateNamespaceProject"));
    }

    #[tokio::test]
    async fn test_sweep_detaches_undesired_namespaces() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        platform.seed_namespace("ns-gone", Some("c-1:p-1"), true);
        let mut cr = project("p1", &[]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert_eq!(
            platform.namespace_named("ns-gone").unwrap().assigned_project(),
            None
        );
        assert!(platform.namespace_named("ns-gone").is_some());
        assert!(sink.has_reason(Reason::NamespaceRemoved));
    }

    #[tokio::test]
    async fn test_sweep_deletes_when_policy_and_config_allow() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        platform.seed_namespace("ns-gone", Some("c-1:p-1"), true);
        let mut cr = project("p1", &[]);
        cr.spec.namespace_management_policies =
            vec!["Create".to_string(), "Update".to_string(), "Delete".to_string()];
        let policies = PolicyVector::evaluate(&cr.spec);
        let settings = Settings {
            cleanup_namespaces: true,
            ..Settings::default()
        };
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, policies, &settings, &sink)
            .await
            .unwrap();

        assert!(platform.namespace_named("ns-gone").is_none());
        assert!(sink.has_reason(Reason::NamespaceDeleted));
    }

    #[tokio::test]
    async fn test_sweep_never_touches_foreign_namespaces() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        // in the project but not created by us: no marker
        platform.seed_namespace("ns-foreign", Some("c-1:p-1"), false);
        let mut cr = project("p1", &[]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        assert!(!platform.issued("RemoveNamespaceFromProject"));
        assert!(!platform.issued("DeleteNamespace"));
        assert_eq!(
            platform
                .namespace_named("ns-foreign")
                .unwrap()
                .assigned_project(),
            Some("c-1:p-1")
        );
    }

    #[tokio::test]
    async fn test_one_failing_namespace_does_not_stop_the_others() {
        let platform = FakeRancher::with_cluster("alpha", "c-1");
        platform.fail_operation("CreateNamespace");
        platform.seed_namespace("ns-b", Some("c-1:p-1"), true);
        let mut cr = project("p1", &["ns-a", "ns-b"]);
        let guard = OwnershipGuard::from_projects(std::iter::empty());
        let sink = EventSink::buffered();

        run(&mut cr, &platform, &guard, default_policies(), &Settings::default(), &sink)
            .await
            .unwrap();

        // ns-a failed but ns-b was still processed
        assert!(platform.issued("GetNamespace ns-b"));
        assert!(sink.has_reason(Reason::NamespaceProcessingFailed));
        let status = cr.status.unwrap();
        assert_eq!(status.phase, ProjectPhase::Error);
        assert!(status.error_message.is_some());
    }
}
