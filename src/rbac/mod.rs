// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Azure RBAC evaluation for Key Vault data access.
//!
//! - **Role definitions** are sorted into allow and deny buckets per capability
//!   ([`classifier`]), using Azure's action template matching ([`matcher`]).
//! - **Deny assignments** bound what is possible at all.
//! - **Role assignments** of the user select which classified roles apply
//!   ([`evaluator`]).
//!
//! [`KeyVaultPermissionCheck`] drives the whole evaluation against ARM for one
//! Key Vault object and publishes the results on the execution context.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dataverse_token_broker::rbac::KeyVaultPermissionCheck;
//!
//! let check = KeyVaultPermissionCheck::new(arm, &options);
//! let evaluation = check.run(&mut ctx, &secret_id, KeyVaultObjectType::Secret)?;
//! assert!(evaluation.sufficient);
//! ```

pub mod ast;
pub mod capabilities;
pub mod classifier;
pub mod evaluator;
pub mod matcher;
pub mod parser;

pub use capabilities::{Capability, CapabilitySet};
pub use classifier::{RoleBucket, RoleBuckets};
pub use evaluator::PermissionEvaluation;
pub use matcher::action_matches;
pub use parser::{RbacParseError, RbacParser};

use uuid::Uuid;

use crate::context::{output, ExecutionContext, ParameterValue};
use crate::error::Result;
use crate::keyvault::KeyVaultObjectType;
use crate::options::BrokerOptions;
use crate::resource_id::ResourceId;
use crate::services::{drain, ArmQueryService};

/// ARM filter selecting assignments of one principal that apply at a scope.
pub fn assigned_to_filter(principal_object_id: Uuid) -> String {
    format!("atScope() and assignedTo('{principal_object_id}')")
}

/// Permission evaluation of one user on one Key Vault object, fed from ARM.
pub struct KeyVaultPermissionCheck<'a> {
    arm: &'a dyn ArmQueryService,
    role_definition_filters: &'a [String],
}

impl<'a> KeyVaultPermissionCheck<'a> {
    pub fn new(arm: &'a dyn ArmQueryService, options: &'a BrokerOptions) -> Self {
        Self {
            arm,
            role_definition_filters: &options.role_definition_filters,
        }
    }

    /// Classify every role definition applicable at `scope`, one filter at a time.
    pub fn role_buckets(&self, scope: &ResourceId) -> Result<RoleBuckets> {
        let mut buckets = RoleBuckets::new();
        for filter in self.role_definition_filters {
            let definitions =
                drain(|token| self.arm.list_role_definitions(scope, filter, token))?;
            for definition in &definitions {
                buckets.classify(definition);
            }
        }
        Ok(buckets)
    }

    /// Evaluate without publishing anything.
    ///
    /// Role assignments are not listed when deny assignments already make the
    /// object inaccessible.
    pub fn evaluate(
        &self,
        scope: &ResourceId,
        object_type: KeyVaultObjectType,
        user_object_id: Uuid,
    ) -> Result<(PermissionEvaluation, RoleBuckets)> {
        let buckets = self.role_buckets(scope)?;
        let filter = assigned_to_filter(user_object_id);

        let denies = drain(|token| self.arm.list_deny_assignments(scope, &filter, token))?;
        let possible =
            evaluator::apply_deny_assignments(CapabilitySet::all(), &denies);
        let assignments = if evaluator::is_attainable(object_type.required_capabilities(), possible) {
            drain(|token| self.arm.list_role_assignments(scope, &filter, token))?
        } else {
            Vec::new()
        };

        let evaluation = evaluator::evaluate(object_type, &denies, &assignments, &buckets);
        Ok((evaluation, buckets))
    }

    /// Evaluate the caller's permissions on `scope` and publish the result.
    pub fn run(
        &self,
        ctx: &mut ExecutionContext,
        scope: &ResourceId,
        object_type: KeyVaultObjectType,
    ) -> Result<PermissionEvaluation> {
        let (evaluation, buckets) = self.evaluate(scope, object_type, ctx.user_aad_object_id)?;
        publish(ctx, &evaluation, &buckets);
        ctx.trace(&format!(
            "User {} has {} on {} ({}).",
            ctx.user_aad_object_id,
            evaluation.effective,
            scope,
            if evaluation.sufficient { "sufficient" } else { "insufficient" }
        ));
        Ok(evaluation)
    }
}

/// Write the evaluation and every created bucket as output parameters.
pub fn publish(ctx: &mut ExecutionContext, evaluation: &PermissionEvaluation, buckets: &RoleBuckets) {
    for bucket in RoleBucket::ALL {
        if let Some(records) = buckets.records(bucket) {
            ctx.set_output(bucket.name(), ParameterValue::Records(records));
        }
    }
    ctx.set_output(
        output::USER_POSSIBLE_PERMISSIONS,
        ParameterValue::Int(evaluation.possible_bits().into()),
    );
    ctx.set_output(
        output::USER_POSSIBLE_PERMISSIONS_DISPLAY_NAME,
        ParameterValue::String(evaluation.possible_display_name()),
    );
    ctx.set_output(
        output::USER_EFFECTIVE_PERMISSIONS,
        ParameterValue::Int(evaluation.effective_bits().into()),
    );
    ctx.set_output(
        output::USER_EFFECTIVE_PERMISSIONS_DISPLAY_NAME,
        ParameterValue::String(evaluation.effective_display_name()),
    );
    ctx.set_output(
        output::USER_HAS_SUFFICIENT_PERMISSIONS,
        ParameterValue::Bool(evaluation.sufficient),
    );
}
