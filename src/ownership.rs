use crate::project::Project;

use kube::api::{Api, ListParams, ResourceExt};
use tracing::warn;

struct Claim {
    cr_name: String,
    /// lowercased namespace names from the CR's spec
    namespaces: Vec<String>,
}

/// Snapshot of which CR claims which namespaces, taken once per reconcile.
///
/// The source of truth is the operator's own CR list, so a failed list does
/// not block reconciliation: the guard loads empty ("not claimed") and the
/// failure surfaces as a warning.
pub struct OwnershipGuard {
    claims: Vec<Claim>,
}

impl OwnershipGuard {
    pub async fn load(api: &Api<Project>) -> Self {
        match api.list(&ListParams::default()).await {
            Ok(projects) => Self::from_projects(projects.items.iter()),
            Err(e) => {
                warn!(
                    error = ?e,
                    "cannot list Project CRs, treating namespaces as unclaimed"
                );
                OwnershipGuard { claims: Vec::new() }
            }
        }
    }

    pub fn from_projects<'a>(projects: impl Iterator<Item = &'a Project>) -> Self {
        let claims = projects
            .map(|project| Claim {
                cr_name: project.name_any(),
                namespaces: project.desired_namespaces(),
            })
            .collect();
        OwnershipGuard { claims }
    }

    /// Whether `namespace` appears in the spec of any CR other than
    /// `current_cr`. Comparison is case-insensitive
    pub fn is_claimed_by_another(&self, namespace: &str, current_cr: &str) -> bool {
        let needle = namespace.to_lowercase();
        self.claims
            .iter()
            .any(|claim| claim.cr_name != current_cr && claim.namespaces.contains(&needle))
    }
}
