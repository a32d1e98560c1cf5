// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

mod mock;

use dataverse_token_broker::context::{input, CLIENT_ASSERTION_VARIABLE};
use dataverse_token_broker::record::managed_identity as mi;
use dataverse_token_broker::*;

use mock::{key_vault_sourced, ClientBehavior, Host, MockArm, MockClient, VAULT_ID};

use std::sync::atomic::Ordering;

use anyhow::Result;
use uuid::Uuid;

const ISSUED: &str = "opaque-client-token";

/// A caller asking for an application other than their own, with impersonation
/// granted in their business unit.
fn impersonating(host: Host) -> (Host, ExecutionContext) {
    let ctx = host.context();
    let host = host.with_privileges(vec![Host::impersonation_grant(ctx.business_unit_id)]);
    (host, ctx)
}

fn secret_inputs(ctx: ExecutionContext, application_id: Uuid) -> ExecutionContext {
    ctx.with_input(input::APPLICATION_ID, ParameterValue::Guid(application_id))
        .with_input(
            input::RESOURCE_ID,
            ParameterValue::String("https://graph.microsoft.com".to_string()),
        )
        .with_input(
            input::KEY_VAULT_RESOURCE_IDENTIFIER,
            ParameterValue::String(format!("{VAULT_ID}/secrets/app-secret")),
        )
}

#[test]
fn self_request_skips_privilege_lookup() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let own_app = Uuid::new_v4();
    let mut ctx = host.context().with_application_user(true);
    host.register_application_user(ctx.user_id, own_app);

    let broker = host.broker();
    let identities = IdentityResolver::new(broker.services(), broker.options());
    let resolved = identities.resolve(&mut ctx)?;
    assert_eq!(resolved.application_id, own_app);
    assert_eq!(resolved.tenant_id, ctx.tenant_id);

    identities.authorize(&mut ctx, &resolved)?;
    assert_eq!(host.privileges.calls.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.output_guid(output::USER_APPLICATION_ID), Some(own_app));
    Ok(())
}

#[test]
fn explicit_inputs_win_over_bound_identity() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let (bound_app, bound_tenant) = (Uuid::new_v4(), Uuid::new_v4());
    let bound = host.store.insert(
        Record::new(mi::ENTITY)
            .with(mi::APPLICATION_ID, bound_app)
            .with(mi::TENANT_ID, bound_tenant),
    );
    let broker = host.broker();
    let identities = IdentityResolver::new(broker.services(), broker.options());
    let bound_ctx = || host.context().with_primary_entity(EntityReference::new(mi::ENTITY, bound));

    let input_app = Uuid::new_v4();
    let mut ctx = bound_ctx().with_input(input::APPLICATION_ID, ParameterValue::Guid(input_app));
    let resolved = identities.resolve(&mut ctx)?;
    assert_eq!(resolved.application_id, input_app);
    assert_eq!(resolved.tenant_id, ctx.tenant_id);

    let input_tenant = Uuid::new_v4();
    let mut ctx = bound_ctx()
        .with_input(input::APPLICATION_ID, ParameterValue::String(input_app.to_string()))
        .with_input(input::TENANT_ID, ParameterValue::Guid(input_tenant));
    let resolved = identities.resolve(&mut ctx)?;
    assert_eq!(resolved.application_id, input_app);
    assert_eq!(resolved.tenant_id, input_tenant);

    // Nil inputs name nothing, so the bound record still applies.
    let mut ctx = bound_ctx()
        .with_input(input::APPLICATION_ID, ParameterValue::Guid(Uuid::nil()))
        .with_input(input::TENANT_ID, ParameterValue::String(String::new()));
    let resolved = identities.resolve(&mut ctx)?;
    assert_eq!(resolved.application_id, bound_app);
    assert_eq!(resolved.tenant_id, bound_tenant);
    Ok(())
}

#[test]
fn impersonation_needs_privilege_in_own_business_unit() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED))
        .with_privileges(vec![Host::impersonation_grant(Uuid::new_v4())]);
    let broker = host.broker();
    let mut ctx = host
        .context()
        .with_input(input::APPLICATION_ID, ParameterValue::Guid(Uuid::new_v4()));

    let err = execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.status_code(), 403);
    assert_eq!(
        err.to_string(),
        format!(
            "Forbidden: Entra Object ID {} is missing privilege prvActOnBehalfOfAnotherUser.",
            ctx.user_aad_object_id
        )
    );
    assert_eq!(host.privileges.calls.load(Ordering::SeqCst), 1);
    assert!(host.client.requests().is_empty());
    Ok(())
}

#[test]
fn missing_application_id_is_bad_request() {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let mut ctx = host.context();

    let err = execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(err
        .to_string()
        .contains("User is not an application user, and input parameter 'ApplicationId' was not specified."));
}

#[test]
fn hosting_identity_serves_its_own_application() -> Result<()> {
    let host = Host::new(MockArm::granting_secrets(), MockClient::issuing(ISSUED));
    host.register_plugin(false);
    let broker = host.broker();

    for _ in 0..2 {
        let mut ctx = host.context().with_application_user(true);
        host.register_application_user(ctx.user_id, host.host_application_id);

        execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx)?;
        assert!(ctx.output_str(output::ACCESS_TOKEN).is_some());
        assert!(ctx.output(output::JSON_WEB_TOKEN).is_some());
        assert!(ctx.output_record(output::PLUGIN_ASSEMBLY_MANAGED_IDENTITY).is_some());
        assert!(ctx.output(output::KEY_VAULT_REFERENCE).is_none());
    }

    // Second run is answered from the token cache.
    assert_eq!(
        host.managed_identity.requests(),
        vec![vec![format!("{}/.default", host.host_application_id)]]
    );
    assert_eq!(broker.token_cache().len(), 1);
    assert_eq!(host.arm.calls.load(Ordering::SeqCst), 0);
    assert_eq!(host.privileges.calls.load(Ordering::SeqCst), 0);
    assert!(host.client.requests().is_empty());
    Ok(())
}

#[test]
fn hosting_identity_through_package() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let identity = host.register_plugin(true);
    let broker = host.broker();
    let mut ctx = host.context();

    execute_plugin(&RetrieveContextManagedIdentityPlugin, &broker, &mut ctx)?;
    let record = ctx
        .output_record(output::PLUGIN_ASSEMBLY_MANAGED_IDENTITY)
        .map(ManagedIdentityRecord::from_record);
    assert_eq!(record.as_ref().and_then(|r| r.id), Some(identity));
    assert_eq!(
        record.and_then(|r| r.application_id),
        Some(host.host_application_id)
    );
    Ok(())
}

#[test]
fn unregistered_step_has_no_hosting_identity() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let mut ctx = host.context();

    execute_plugin(&RetrieveContextManagedIdentityPlugin, &broker, &mut ctx)?;
    assert!(ctx.output(output::PLUGIN_ASSEMBLY_MANAGED_IDENTITY).is_none());
    Ok(())
}

#[test]
fn secondary_identity_uses_client_assertion() -> Result<()> {
    let (host, ctx) = impersonating(Host::new(
        MockArm::granting_secrets(),
        MockClient::issuing(ISSUED),
    ));
    host.register_plugin(false);
    let broker = host.broker();
    let other_app = Uuid::new_v4();
    let mut ctx = secret_inputs(ctx, other_app);

    execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx)?;

    assert_eq!(ctx.output_str(output::ACCESS_TOKEN), Some(ISSUED));
    assert!(ctx.output(output::JSON_WEB_TOKEN).is_none());
    assert_eq!(
        ctx.output(output::USER_HAS_SUFFICIENT_PERMISSIONS),
        Some(&ParameterValue::Bool(true))
    );
    assert_eq!(
        host.managed_identity.requests(),
        vec![vec!["api://AzureADTokenExchange/.default".to_string()]]
    );
    assert_eq!(host.client.credentials(), vec!["assertion".to_string()]);
    assert_eq!(
        host.client.requests(),
        vec![(
            ctx.tenant_id,
            other_app,
            vec!["https://graph.microsoft.com/.default".to_string()]
        )]
    );

    let assertion = ctx.shared_str(CLIENT_ASSERTION_VARIABLE).unwrap_or_default();
    let jwt = DecodedJwt::decode(assertion)?;
    assert_eq!(jwt.subject(), Some("host-identity-object"));
    assert_eq!(host.material.reads.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn rejected_assertion_names_issuer_and_subject() -> Result<()> {
    let (host, ctx) = impersonating(Host::new(
        MockArm::granting_secrets(),
        MockClient::new(ClientBehavior::Reject {
            error_type: "invalid_client".to_string(),
            message: "AADSTS70021: No matching federated identity record found for presented assertion."
                .to_string(),
            additional_data: vec![("CorrelationId".to_string(), "c0ffee".to_string())],
        }),
    ));
    host.register_plugin(false);
    let broker = host.broker();
    let mut ctx = secret_inputs(ctx, Uuid::new_v4());

    let err = execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.status_code(), 403);
    assert_eq!(
        err.to_string(),
        "Forbidden: Assertion: {issuer: https://login.microsoftonline.com/host-tenant/v2.0, subject: host-identity-object}. \
         AADSTS70021: No matching federated identity record found for presented assertion."
    );
    let details = err.details().cloned().unwrap_or_default();
    assert_eq!(details.get("Type").map(|s| s.as_str()), Some("invalid_client"));
    assert_eq!(details.get("CorrelationId").map(|s| s.as_str()), Some("c0ffee"));
    assert!(ctx.shared_str(CLIENT_ASSERTION_VARIABLE).is_some());
    assert!(ctx.output(output::ACCESS_TOKEN).is_none());
    Ok(())
}

#[test]
fn insufficient_permissions_stop_before_client() -> Result<()> {
    let (host, ctx) = impersonating(Host::new(
        MockArm::granting_secrets().without_assignments(),
        MockClient::issuing(ISSUED),
    ));
    host.register_plugin(false);
    let broker = host.broker();
    let mut ctx = secret_inputs(ctx, Uuid::new_v4());

    let err = execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.status_code(), 403);
    assert_eq!(
        ctx.output(output::USER_HAS_SUFFICIENT_PERMISSIONS),
        Some(&ParameterValue::Bool(false))
    );
    assert!(host.client.requests().is_empty());
    assert!(host.managed_identity.requests().is_empty());
    Ok(())
}

#[test]
fn secondary_identity_without_key_vault_reference_is_rejected() -> Result<()> {
    let (host, ctx) = impersonating(Host::new(
        MockArm::granting_secrets(),
        MockClient::issuing(ISSUED),
    ));
    let broker = host.broker();
    let mut ctx = ctx.with_input(input::APPLICATION_ID, ParameterValue::Guid(Uuid::new_v4()));

    let err = execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    assert!(err
        .to_string()
        .contains("Unable to resolve Key Vault Resource without Key Vault URI."));
    assert!(host.client.requests().is_empty());
    Ok(())
}

#[test]
fn key_vault_sourced_identity_uses_secret() -> Result<()> {
    let (host, ctx) = impersonating(Host::new(
        MockArm::granting_secrets(),
        MockClient::issuing(ISSUED),
    ));
    host.register_plugin(false);
    let reference = host.register_key_vault_reference("app-secret", 0);
    let other_app = Uuid::new_v4();
    let requested = host.store.insert(key_vault_sourced(
        Record::new(mi::ENTITY)
            .with(mi::APPLICATION_ID, other_app)
            .with(mi::TENANT_ID, host.tenant_id),
        reference,
    ));
    let broker = host.broker();
    let mut ctx = ctx.with_primary_entity(EntityReference::new(mi::ENTITY, requested));

    execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx)?;

    assert_eq!(ctx.output_str(output::ACCESS_TOKEN), Some(ISSUED));
    assert_eq!(host.client.credentials(), vec!["secret:app-secret-value".to_string()]);
    assert_eq!(host.material.reads.load(Ordering::SeqCst), 1);
    assert!(ctx.shared_str(CLIENT_ASSERTION_VARIABLE).is_none());
    assert_eq!(
        ctx.output_str(output::KEY_VAULT_RESOURCE_IDENTIFIER),
        Some(format!("{VAULT_ID}/secrets/app-secret").as_str())
    );
    assert_eq!(host.arm.subscription_listings.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn inactive_requested_identity_is_rejected() {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let requested = host.store.insert(
        Record::new(mi::ENTITY)
            .with(mi::APPLICATION_ID, Uuid::new_v4())
            .with(mi::STATECODE, AttributeValue::OptionSet(1)),
    );
    let broker = host.broker();
    let mut ctx = host
        .context()
        .with_primary_entity(EntityReference::new(mi::ENTITY, requested));

    let err = execute_plugin(&RetrieveRequestedManagedIdentityPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.status_code(), 400);

    let mut ctx = host
        .context()
        .with_primary_entity(EntityReference::new(mi::ENTITY, Uuid::new_v4()));
    let err = execute_plugin(&RetrieveRequestedManagedIdentityPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[test]
fn tenant_domain_is_resolved() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let app = Uuid::new_v4();
    let mut ctx = host
        .context()
        .with_input(input::TENANT_ID, ParameterValue::String("contoso.onmicrosoft.com".to_string()))
        .with_input(input::APPLICATION_ID, ParameterValue::String(app.to_string()))
        .with_input(input::NAME, ParameterValue::String("reporting".to_string()));

    execute_plugin(&RetrieveRequestedManagedIdentityPlugin, &broker, &mut ctx)?;
    let record = ctx
        .output_record(output::REQUESTED_MANAGED_IDENTITY)
        .cloned()
        .unwrap_or_default();
    assert_eq!(record.get_guid(mi::TENANT_ID), Some(host.directory_tenant_id));
    assert_eq!(record.get_str(mi::TENANT_DOMAIN_NAME), Some("contoso.onmicrosoft.com"));
    assert_eq!(record.get_guid(mi::APPLICATION_ID), Some(app));
    assert_eq!(record.get_str(mi::NAME), Some("reporting"));
    Ok(())
}

#[test]
fn key_vault_reference_from_uri() -> Result<()> {
    let host = Host::new(MockArm::granting_secrets(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let mut ctx = host
        .context()
        .with_input(input::KEY_VAULT_URI, ParameterValue::String("https://KV1.vault.azure.net/".to_string()))
        .with_input(input::KEY_VAULT_OBJECT_NAME, ParameterValue::String("app-secret".to_string()))
        .with_input(input::KEY_VAULT_OBJECT_VERSION, ParameterValue::String("v1".to_string()))
        .with_input(input::KEY_VAULT_OBJECT_TYPE, ParameterValue::String("Secret".to_string()));

    execute_plugin(&ResolveKeyVaultReferencePlugin, &broker, &mut ctx)?;
    assert_eq!(
        ctx.output_str(output::KEY_VAULT_RESOURCE_IDENTIFIER),
        Some(format!("{VAULT_ID}/secrets/app-secret/versions/v1").as_str())
    );
    let reference = ctx
        .output_record(output::KEY_VAULT_REFERENCE)
        .map(CredentialReference::from_record);
    assert_eq!(
        reference.map(|r| (r.object_name, r.object_version, r.object_type)),
        Some(("app-secret".to_string(), Some("v1".to_string()), KeyVaultObjectType::Secret))
    );
    Ok(())
}

#[test]
fn key_vault_reference_backfilled_from_resource_id() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let mut ctx = host.context().with_input(
        input::KEY_VAULT_RESOURCE_IDENTIFIER,
        ParameterValue::String(format!("{VAULT_ID}/certificates/signing")),
    );

    execute_plugin(&ResolveKeyVaultReferencePlugin, &broker, &mut ctx)?;
    let reference = ctx
        .output_record(output::KEY_VAULT_REFERENCE)
        .map(CredentialReference::from_record)
        .ok_or_else(|| anyhow::anyhow!("no reference published"))?;
    assert_eq!(reference.vault_uri, "https://kv1.vault.azure.net");
    assert_eq!(reference.object_name, "signing");
    assert_eq!(reference.object_type, KeyVaultObjectType::Certificate);
    assert_eq!(host.arm.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn unknown_vault_is_not_found() {
    let host = Host::new(MockArm::granting_secrets(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let mut ctx = host
        .context()
        .with_input(input::KEY_VAULT_URI, ParameterValue::String("https://missing.vault.azure.net/".to_string()))
        .with_input(input::KEY_VAULT_OBJECT_NAME, ParameterValue::String("app-secret".to_string()))
        .with_input(input::KEY_VAULT_OBJECT_TYPE, ParameterValue::Int(0));

    let err = execute_plugin(&EvaluateKeyVaultPermissionsPlugin, &broker, &mut ctx).unwrap_err();
    assert_eq!(err.status_code(), 404);
    assert!(err.to_string().contains("No Key Vault named 'missing'"));
    assert_eq!(host.arm.subscription_listings.load(Ordering::SeqCst), 1);
}

#[test]
fn evaluate_permissions_plugin_publishes_buckets() -> Result<()> {
    let host = Host::new(MockArm::granting_secrets(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let mut ctx = host.context().with_input(
        input::KEY_VAULT_RESOURCE_IDENTIFIER,
        ParameterValue::String(format!("{VAULT_ID}/secrets/app-secret/versions/v7")),
    );

    execute_plugin(&EvaluateKeyVaultPermissionsPlugin, &broker, &mut ctx)?;
    assert_eq!(
        ctx.output(output::USER_EFFECTIVE_PERMISSIONS),
        Some(&ParameterValue::Int(1))
    );
    let allowed = ctx
        .output_records(RoleBucket::AllowGetSecretValue.name())
        .map(|records| records.len());
    assert_eq!(allowed, Some(1));
    Ok(())
}

#[test]
fn bound_managed_identity_token() -> Result<()> {
    let host = Host::new(MockArm::default(), MockClient::issuing(ISSUED));
    let broker = host.broker();
    let identity = Uuid::new_v4();
    let mut ctx = host
        .context()
        .with_primary_entity(EntityReference::new(mi::ENTITY, identity))
        .with_input(input::SCOPES, ParameterValue::Strings(vec!["https://vault.azure.net/.default".to_string()]));

    execute_plugin(&ManagedIdentityTokenPlugin, &broker, &mut ctx)?;
    assert!(ctx.output(output::JSON_WEB_TOKEN).is_some());
    assert_eq!(
        host.managed_identity.bound_requests.lock().map(|r| r.clone()).unwrap_or_default(),
        vec![identity]
    );
    Ok(())
}
