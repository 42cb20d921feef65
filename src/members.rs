use crate::errors::{Error, Result};
use crate::events::{EventSink, Reason};
use crate::metrics::Metrics;
use crate::policy::PolicyVector;
use crate::project::{Project, ProjectMember};
use crate::rancher::Rancher;

use tracing::{debug, error, info};

/// Ensure every member in the CR's spec has a role binding on the project.
///
/// Failures are isolated per member; bindings that disappear from the spec
/// are not removed.
pub async fn reconcile_members(
    cr: &mut Project,
    platform: &dyn Rancher,
    policies: PolicyVector,
    sink: &EventSink,
    metrics: &Metrics,
) -> Result<()> {
    let project_id = match cr.status.as_ref().and_then(|s| s.project_id.clone()) {
        Some(project_id) => project_id,
        None => return Ok(()),
    };

    cr.status_mut().configured_members.clear();

    for member in cr.spec.members.clone() {
        match reconcile_member(&member, &project_id, platform, policies, sink).await {
            Ok(Some(principal_id)) => {
                cr.status_mut()
                    .configured_members
                    .push(format!("{}:{}", principal_id, member.role));
            }
            Ok(None) => {}
            Err(e) => {
                error!(
                    member = ?member.principal_id.as_deref().or(member.principal_name.as_deref()),
                    role = member.role,
                    error = ?e,
                    "cannot configure project member"
                );
                metrics.error("member_add_failed");
                sink.publish(
                    Reason::MemberAddFailed,
                    format!("Member '{}': {e}", member_display(&member)),
                )
                .await;
            }
        }
    }

    Ok(())
}

/// Returns the resolved principal ID when the binding exists or was created,
/// `None` when creation was skipped for lack of permission.
async fn reconcile_member(
    member: &ProjectMember,
    project_id: &str,
    platform: &dyn Rancher,
    policies: PolicyVector,
    sink: &EventSink,
) -> Result<Option<String>> {
    let principal_id = resolve_principal(member, platform).await?;

    let existing = platform.project_members(project_id).await?;
    let already_bound = existing.iter().any(|binding| {
        binding.principal_id() == Some(principal_id.as_str())
            && binding.role_template_id == member.role
    });

    if already_bound {
        debug!(
            principal = principal_id,
            role = member.role,
            "member binding already present"
        );
        return Ok(Some(principal_id));
    }

    if !policies.allow_create {
        info!(
            principal = principal_id,
            role = member.role,
            "member binding is missing but creation is not permitted"
        );
        return Ok(None);
    }

    platform
        .create_project_member(project_id, &principal_id, &member.role)
        .await?;
    sink.publish(
        Reason::MemberAdded,
        format!(
            "Added member '{}' with role '{}' to project '{}'",
            principal_id, member.role, project_id
        ),
    )
    .await;
    Ok(Some(principal_id))
}

async fn resolve_principal(member: &ProjectMember, platform: &dyn Rancher) -> Result<String> {
    if let Some(id) = member.principal_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    let name = member
        .principal_name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::Internal("member has neither principalId nor principalName".to_string())
        })?;

    platform
        .principal_id_by_name(name)
        .await?
        .ok_or_else(|| Error::Internal(format!("principal '{name}' not found in Rancher")))
}

fn member_display(member: &ProjectMember) -> &str {
    member
        .principal_id
        .as_deref()
        .or(member.principal_name.as_deref())
        .unwrap_or("<unnamed>")
}
