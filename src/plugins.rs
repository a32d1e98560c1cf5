// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Plugin entry points.
//!
//! Each plugin reads its inputs from the [`ExecutionContext`], does one job and
//! publishes outputs. [`execute_plugin`] is the error boundary the host calls.

use crate::context::{input, output, ExecutionContext, ParameterValue};
use crate::error::{BrokerError, Result};
use crate::identity::IdentityResolver;
use crate::keyvault::KeyVaultReferenceResolver;
use crate::rbac::KeyVaultPermissionCheck;
use crate::selector::CredentialSourceSelector;
use crate::token::DecodedJwt;
use crate::trace::trace_error;
use crate::TokenBroker;

/// A unit of work the plugin host can run.
pub trait Plugin {
    fn name(&self) -> &'static str;

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()>;
}

/// Run `plugin`, keeping unexpected failures inside the boundary.
///
/// Classified errors pass through unchanged. A [`BrokerError::Failure`] is
/// traced with its full chain, innermost first, and replaced by a generic
/// internal server error.
pub fn execute_plugin(
    plugin: &dyn Plugin,
    broker: &TokenBroker,
    ctx: &mut ExecutionContext,
) -> Result<()> {
    let span = tracing::debug_span!("plugin", name = plugin.name());
    let _entered = span.enter();

    match plugin.execute(broker, ctx) {
        Ok(()) => Ok(()),
        Err(err @ BrokerError::Failure(_)) => {
            trace_error(ctx.trace_sink(), plugin.name(), &err);
            tracing::error!(error = %err, "plugin failed");
            Err(BrokerError::InternalServerError(
                "An unexpected error occurred during plugin execution.".to_string(),
            ))
        }
        Err(err) => {
            tracing::debug!(status = err.status_code(), error = %err, "plugin rejected request");
            Err(err)
        }
    }
}

/// Publish `AccessToken` and, when it decodes, `JsonWebToken`.
fn publish_access_token(ctx: &mut ExecutionContext, token: String) {
    match DecodedJwt::decode(&token) {
        Ok(jwt) => ctx.set_output(output::JSON_WEB_TOKEN, ParameterValue::Json(jwt.to_json())),
        Err(e) => ctx.trace(&format!("Access token is not a readable JWT: {e}")),
    }
    ctx.set_output(output::ACCESS_TOKEN, ParameterValue::String(token));
}

fn required_scopes(ctx: &ExecutionContext) -> Result<Vec<String>> {
    let scopes = ctx.input_strings(input::SCOPES);
    if scopes.is_empty() {
        return Err(BrokerError::bad_request(format!(
            "Input parameter '{}' was not specified.",
            input::SCOPES
        )));
    }
    Ok(scopes)
}

/// Token from the platform managed identity, or from the bound `managedidentity` record.
pub struct ManagedIdentityTokenPlugin;

impl Plugin for ManagedIdentityTokenPlugin {
    fn name(&self) -> &'static str {
        "ManagedIdentityTokenPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        let scopes = required_scopes(ctx)?;
        let service = broker.services().managed_identity()?;
        let token = match ctx.primary_entity_of(crate::record::managed_identity::ENTITY) {
            Some(id) => service.acquire_token_for(id, &scopes)?,
            None => service.acquire_token(&scopes)?,
        };
        publish_access_token(ctx, token);
        Ok(())
    }
}

/// Token on behalf of the calling user.
pub struct OnBehalfOfTokenPlugin;

impl Plugin for OnBehalfOfTokenPlugin {
    fn name(&self) -> &'static str {
        "OnBehalfOfTokenPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        let scopes = required_scopes(ctx)?;
        let token = broker.services().on_behalf_of()?.acquire_token(&scopes)?;
        publish_access_token(ctx, token);
        Ok(())
    }
}

/// Token from the host-internal managed identity API, for hosts that offer it.
pub struct InternalManagedIdentityTokenPlugin;

impl Plugin for InternalManagedIdentityTokenPlugin {
    fn name(&self) -> &'static str {
        "InternalManagedIdentityTokenPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        let service = broker
            .services()
            .internal_managed_identity()
            .ok_or_else(|| BrokerError::unavailable("InternalManagedIdentityService"))?;
        let scopes = required_scopes(ctx)?;
        let tenant = match ctx.input(input::TENANT_ID) {
            Some(ParameterValue::String(tenant)) if !tenant.is_empty() => tenant.clone(),
            Some(ParameterValue::Guid(tenant)) if !tenant.is_nil() => tenant.to_string(),
            _ => ctx.tenant_id.to_string(),
        };
        let token = service.acquire_token_from_tenant(&scopes, &tenant)?;
        publish_access_token(ctx, token);
        Ok(())
    }
}

/// Token for any application identity the caller may act as.
pub struct FederatedIdentityTokenPlugin;

impl Plugin for FederatedIdentityTokenPlugin {
    fn name(&self) -> &'static str {
        "FederatedIdentityTokenPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        let identities = IdentityResolver::new(broker.services(), broker.options());
        let resolved = identities.resolve(ctx)?;
        identities.authorize(ctx, &resolved)?;

        let scopes = resolved.default_scopes();
        let token = CredentialSourceSelector::new(broker).acquire_token(ctx, &resolved, &scopes)?;
        publish_access_token(ctx, token.token);
        Ok(())
    }
}

/// Effective Key Vault data permissions of the caller on the referenced object.
pub struct EvaluateKeyVaultPermissionsPlugin;

impl Plugin for EvaluateKeyVaultPermissionsPlugin {
    fn name(&self) -> &'static str {
        "EvaluateKeyVaultPermissionsPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        let key_vault = KeyVaultReferenceResolver::new(broker.services(), broker.options());
        key_vault.ensure_key_vault_reference(ctx)?;

        let not_found = || BrokerError::not_found("Key Vault reference could not be resolved.");
        let reference = key_vault.key_vault_reference(ctx).ok_or_else(not_found)?;
        let scope = key_vault.content_resource_id(ctx)?.ok_or_else(not_found)?;

        KeyVaultPermissionCheck::new(broker.services().arm()?, broker.options())
            .run(ctx, &scope, reference.object_type)?;
        Ok(())
    }
}

pub struct ResolveKeyVaultReferencePlugin;

impl Plugin for ResolveKeyVaultReferencePlugin {
    fn name(&self) -> &'static str {
        "ResolveKeyVaultReferencePlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        KeyVaultReferenceResolver::new(broker.services(), broker.options()).resolve(ctx)?;
        Ok(())
    }
}

pub struct RetrieveRequestedManagedIdentityPlugin;

impl Plugin for RetrieveRequestedManagedIdentityPlugin {
    fn name(&self) -> &'static str {
        "RetrieveRequestedManagedIdentityPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        IdentityResolver::new(broker.services(), broker.options()).requested_managed_identity(ctx)?;
        Ok(())
    }
}

pub struct RetrieveContextManagedIdentityPlugin;

impl Plugin for RetrieveContextManagedIdentityPlugin {
    fn name(&self) -> &'static str {
        "RetrieveContextManagedIdentityPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        IdentityResolver::new(broker.services(), broker.options()).hosting_identity(ctx)?;
        Ok(())
    }
}

pub struct ResolveUserApplicationIdPlugin;

impl Plugin for ResolveUserApplicationIdPlugin {
    fn name(&self) -> &'static str {
        "ResolveUserApplicationIdPlugin"
    }

    fn execute(&self, broker: &TokenBroker, ctx: &mut ExecutionContext) -> Result<()> {
        IdentityResolver::new(broker.services(), broker.options()).user_application_id(ctx)?;
        Ok(())
    }
}
