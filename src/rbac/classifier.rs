// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-role classification of Key Vault data actions.
//!
//! Each role definition is sorted into allow and deny buckets, one per
//! [`Capability`]. The buckets are later consulted by the evaluator for the
//! role definitions the user is actually assigned.

use std::collections::BTreeMap;

use crate::rbac::ast::{RoleDefinition, RoleSummary};
use crate::rbac::capabilities::{Capability, CapabilitySet};
use crate::rbac::matcher::any_matches;
use crate::record::Record;
use crate::resource_id::ResourceId;

/// Named output bucket of classified role definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoleBucket {
    AllowGetSecretValue,
    AllowReadCertificate,
    AllowSignWithKey,
    DenyGetSecretValue,
    DenyReadCertificate,
    DenySignWithKey,
}

impl RoleBucket {
    pub const ALL: [RoleBucket; 6] = [
        RoleBucket::AllowGetSecretValue,
        RoleBucket::AllowReadCertificate,
        RoleBucket::AllowSignWithKey,
        RoleBucket::DenyGetSecretValue,
        RoleBucket::DenyReadCertificate,
        RoleBucket::DenySignWithKey,
    ];

    pub const fn allow(capability: Capability) -> Self {
        match capability {
            Capability::GetSecret => RoleBucket::AllowGetSecretValue,
            Capability::ReadCertificateProperties => RoleBucket::AllowReadCertificate,
            Capability::SignWithKey => RoleBucket::AllowSignWithKey,
        }
    }

    pub const fn deny(capability: Capability) -> Self {
        match capability {
            Capability::GetSecret => RoleBucket::DenyGetSecretValue,
            Capability::ReadCertificateProperties => RoleBucket::DenyReadCertificate,
            Capability::SignWithKey => RoleBucket::DenySignWithKey,
        }
    }

    /// Output parameter name of the bucket.
    pub const fn name(self) -> &'static str {
        match self {
            RoleBucket::AllowGetSecretValue => "RolesAllowGetSecretValue",
            RoleBucket::AllowReadCertificate => "RolesAllowReadCertificate",
            RoleBucket::AllowSignWithKey => "RolesAllowSignWithKey",
            RoleBucket::DenyGetSecretValue => "RolesDenyGetSecretValue",
            RoleBucket::DenyReadCertificate => "RolesDenyReadCertificate",
            RoleBucket::DenySignWithKey => "RolesDenySignWithKey",
        }
    }
}

/// Capabilities a single role definition allows and denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleClassification {
    pub allowed: CapabilitySet,
    pub denied: CapabilitySet,
}

/// Classify one role definition without recording it anywhere.
///
/// Within a permission block, `notDataActions` are checked first. When any
/// capability is denied by the block, its `dataActions` are not considered.
/// A capability denied by any block is never reported as allowed.
pub fn classify_role(role: &RoleDefinition) -> RoleClassification {
    let mut allowed = CapabilitySet::empty();
    let mut denied = CapabilitySet::empty();

    for permission in &role.permissions {
        let block_denied: CapabilitySet = Capability::ALL
            .into_iter()
            .filter(|c| any_matches(&permission.not_data_actions, c.data_action()))
            .collect();

        if block_denied.is_empty() {
            allowed = allowed.union(
                Capability::ALL
                    .into_iter()
                    .filter(|c| any_matches(&permission.data_actions, c.data_action()))
                    .collect(),
            );
        }
        denied = denied.union(block_denied);
    }

    RoleClassification {
        allowed: allowed.without_all(denied),
        denied,
    }
}

/// The six role buckets of one evaluation.
///
/// Buckets are created on first insertion and keep insertion order. Nothing is
/// de-duplicated: classifying the same role twice registers it twice.
#[derive(Debug, Clone, Default)]
pub struct RoleBuckets {
    buckets: BTreeMap<RoleBucket, Vec<RoleSummary>>,
}

impl RoleBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `role` and register it in the matching buckets.
    pub fn classify(&mut self, role: &RoleDefinition) -> RoleClassification {
        let classification = classify_role(role);

        for capability in classification.denied.iter() {
            self.register(RoleBucket::deny(capability), role);
        }
        for capability in classification.allowed.iter() {
            self.register(RoleBucket::allow(capability), role);
        }

        if !classification.allowed.is_empty() || !classification.denied.is_empty() {
            tracing::debug!(
                role = %role.name,
                allowed = %classification.allowed,
                denied = %classification.denied,
                "classified role definition"
            );
        }
        classification
    }

    fn register(&mut self, bucket: RoleBucket, role: &RoleDefinition) {
        self.buckets
            .entry(bucket)
            .or_default()
            .push(RoleSummary::from(role));
    }

    /// Roles in `bucket`, `None` when the bucket was never created.
    pub fn get(&self, bucket: RoleBucket) -> Option<&[RoleSummary]> {
        self.buckets.get(&bucket).map(|roles| roles.as_slice())
    }

    /// Whether `bucket` holds the role definition with the given resource id.
    pub fn contains(&self, bucket: RoleBucket, role_definition_id: &str) -> bool {
        let wanted = ResourceId::parse(role_definition_id).ok();
        self.get(bucket).is_some_and(|roles| {
            roles.iter().any(|role| match (&wanted, ResourceId::parse(&role.resource_id)) {
                (Some(wanted), Ok(id)) => *wanted == id,
                _ => role.resource_id.eq_ignore_ascii_case(role_definition_id),
            })
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (RoleBucket, &[RoleSummary])> {
        self.buckets
            .iter()
            .map(|(bucket, roles)| (*bucket, roles.as_slice()))
    }

    /// Bucket contents as records, the shape in which they are published.
    pub fn records(&self, bucket: RoleBucket) -> Option<Vec<Record>> {
        self.get(bucket)
            .map(|roles| roles.iter().map(role_record).collect())
    }
}

fn role_record(role: &RoleSummary) -> Record {
    let mut record = Record::new("roledefinition")
        .with("ResourceIdentifier", role.resource_id.as_str())
        .with("RoleName", role.name.as_str())
        .with("RoleType", role.role_type.as_str());
    if let Some(description) = &role.description {
        record.set("Description", description.as_str());
    }
    record
}
