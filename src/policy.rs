use crate::project::ProjectSpec;
use tracing::warn;

/// Project-level permissions derived from `spec.managementPolicies` and
/// `spec.namespaceManagementPolicies`. Matching on the policy strings is
/// case-insensitive; unknown entries are ignored with a warning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolicyVector {
    /// May create the Rancher project, members and (with `allow_ns_create`)
    /// namespaces
    pub allow_create: bool,
    /// May delete the project on CR deletion. Namespace deletion additionally
    /// requires `allow_ns_delete` and the `cleanup_namespaces` setting
    pub allow_delete: bool,
    /// Authorizes the observe loop to import discovered state into the spec
    pub allow_observe: bool,
    pub allow_ns_create: bool,
    /// May move an existing namespace into or out of the project
    pub allow_ns_update: bool,
    pub allow_ns_delete: bool,
}

impl PolicyVector {
    pub fn evaluate(spec: &ProjectSpec) -> Self {
        let (allow_create, allow_delete, allow_observe) = if spec.management_policies.is_empty() {
            // empty list defaults to Create only
            (true, false, false)
        } else {
            let mut create = false;
            let mut delete = false;
            let mut observe = false;
            for policy in &spec.management_policies {
                match policy.to_lowercase().as_str() {
                    "create" => create = true,
                    "delete" => delete = true,
                    "observe" => observe = true,
                    other => warn!(policy = other, "ignoring unknown management policy"),
                }
            }
            (create, delete, observe)
        };

        let (allow_ns_create, allow_ns_update, allow_ns_delete) =
            if spec.namespace_management_policies.is_empty() {
                // empty list defaults to Create and Update
                (true, true, false)
            } else {
                let mut create = false;
                let mut update = false;
                let mut delete = false;
                for policy in &spec.namespace_management_policies {
                    match policy.to_lowercase().as_str() {
                        "create" => create = true,
                        "update" => update = true,
                        "delete" => delete = true,
                        other => {
                            warn!(policy = other, "ignoring unknown namespace management policy")
                        }
                    }
                }
                (create, update, delete)
            };

        PolicyVector {
            allow_create,
            allow_delete,
            allow_observe,
            allow_ns_create,
            allow_ns_update,
            allow_ns_delete,
        }
    }
}
