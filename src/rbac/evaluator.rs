// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Effective Key Vault data permissions of one user on one vault object.

use serde::Serialize;

use crate::keyvault::KeyVaultObjectType;
use crate::rbac::ast::{DenyAssignment, RoleAssignment};
use crate::rbac::capabilities::{Capability, CapabilitySet};
use crate::rbac::classifier::{RoleBucket, RoleBuckets};
use crate::rbac::matcher::any_matches;

/// Outcome of a permission evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PermissionEvaluation {
    /// Capabilities the vault object type needs.
    pub required: CapabilitySet,
    /// Capabilities not blocked by any deny.
    pub possible: CapabilitySet,
    /// Capabilities granted by the user's role assignments; a subset of `possible`.
    pub effective: CapabilitySet,
    pub sufficient: bool,
}

impl PermissionEvaluation {
    pub fn possible_bits(&self) -> u32 {
        self.possible.bits()
    }

    pub fn effective_bits(&self) -> u32 {
        self.effective.bits()
    }

    pub fn possible_display_name(&self) -> String {
        self.possible.display_name()
    }

    pub fn effective_display_name(&self) -> String {
        self.effective.display_name()
    }
}

/// Remove every capability a deny assignment blocks.
///
/// A block denies a capability when one of its `dataActions` matches and none
/// of its `notDataActions` carve it back out. Only ever shrinks `possible`.
pub fn apply_deny_assignments(
    mut possible: CapabilitySet,
    deny_assignments: &[DenyAssignment],
) -> CapabilitySet {
    for deny in deny_assignments {
        for permission in &deny.permissions {
            for capability in Capability::ALL {
                let action = capability.data_action();
                if any_matches(&permission.data_actions, action)
                    && !any_matches(&permission.not_data_actions, action)
                {
                    possible.remove(capability);
                }
            }
        }
    }
    possible
}

/// Whether role assignments could still make the object accessible.
pub fn is_attainable(required: CapabilitySet, possible: CapabilitySet) -> bool {
    !required.is_empty() && possible.superset_of(required)
}

/// Evaluate the user's effective permissions on a vault object.
///
/// `buckets` must hold every role definition applicable at the object scope.
/// Role assignments whose definition was never classified grant nothing.
pub fn evaluate(
    object_type: KeyVaultObjectType,
    deny_assignments: &[DenyAssignment],
    role_assignments: &[RoleAssignment],
    buckets: &RoleBuckets,
) -> PermissionEvaluation {
    let required = object_type.required_capabilities();
    let mut possible = apply_deny_assignments(CapabilitySet::all(), deny_assignments);
    let mut effective = CapabilitySet::empty();

    if !is_attainable(required, possible) {
        tracing::debug!(%possible, %required, "vault object denied before role evaluation");
        return PermissionEvaluation {
            required,
            possible,
            effective,
            sufficient: false,
        };
    }

    for assignment in role_assignments {
        for capability in required.iter() {
            if buckets.contains(RoleBucket::deny(capability), &assignment.role_definition_id) {
                possible.remove(capability);
            }
        }
    }

    for assignment in role_assignments {
        for capability in required.iter() {
            if possible.contains(capability)
                && buckets.contains(RoleBucket::allow(capability), &assignment.role_definition_id)
            {
                effective.insert(capability);
            }
        }
    }

    let sufficient = is_attainable(required, effective);
    tracing::debug!(%possible, %effective, sufficient, "evaluated vault object permissions");

    PermissionEvaluation {
        required,
        possible,
        effective,
        sufficient,
    }
}
