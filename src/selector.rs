// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Choosing between the plugin's own managed identity and a secondary
//! credential, and acquiring the token from the chosen source.
//!
//! When the requested identity is the one hosting the plugin, the platform
//! token source answers directly. Any other identity needs a secondary
//! credential guarded by a Key Vault object, which the caller must be allowed
//! to read.

use std::cell::RefCell;

use crate::context::{input, output, ExecutionContext, ParameterValue, CLIENT_ASSERTION_VARIABLE};
use crate::error::{BrokerError, Result};
use crate::identity::{IdentityDescriptor, IdentityResolver, ManagedIdentityRecord};
use crate::keyvault::{CredentialReference, KeyVaultObjectType, KeyVaultReferenceResolver};
use crate::rbac::KeyVaultPermissionCheck;
use crate::services::{ClientCredential, ClientCredentialsRequest, ConfidentialClientError};
use crate::token::{AccessToken, DecodedJwt};
use crate::TokenBroker;

const UNKNOWN: &str = "<unknown>";

pub struct CredentialSourceSelector<'a> {
    broker: &'a TokenBroker,
}

impl<'a> CredentialSourceSelector<'a> {
    pub fn new(broker: &'a TokenBroker) -> Self {
        Self { broker }
    }

    /// Acquire a token for `resolved` with the given scopes.
    pub fn acquire_token(
        &self,
        ctx: &mut ExecutionContext,
        resolved: &IdentityDescriptor,
        scopes: &[String],
    ) -> Result<AccessToken> {
        let services = self.broker.services();
        let options = self.broker.options();

        let host = IdentityResolver::new(services, options)
            .hosting_identity(ctx)?
            .map(|record| ManagedIdentityRecord::from_record(&record))
            .unwrap_or_default();

        if host.serves(resolved) {
            tracing::info!(application = %resolved.application_id, "using hosting managed identity");
            let managed_identity = services.managed_identity()?;
            let token = self.broker.token_cache().get_or_acquire(
                resolved.tenant_id,
                resolved.application_id,
                scopes,
                || Ok(AccessToken::new(managed_identity.acquire_token(scopes)?)),
            )?;
            return Ok(AccessToken::new(token));
        }

        tracing::info!(application = %resolved.application_id, "using secondary credential");
        let reference = self.authorized_reference(ctx)?;
        self.acquire_secondary(ctx, resolved, &host, &reference, scopes)
    }

    /// The Key Vault reference of the request, once the caller is known to
    /// hold the data permissions it needs.
    fn authorized_reference(&self, ctx: &mut ExecutionContext) -> Result<CredentialReference> {
        let services = self.broker.services();
        let key_vault = KeyVaultReferenceResolver::new(services, self.broker.options());

        key_vault.ensure_key_vault_reference(ctx)?;
        let not_found = || {
            BrokerError::not_found(
                "Key Vault reference of the requested identity could not be resolved.",
            )
        };
        let reference = key_vault.key_vault_reference(ctx).ok_or_else(not_found)?;
        let scope = key_vault.content_resource_id(ctx)?.ok_or_else(not_found)?;

        let evaluation = KeyVaultPermissionCheck::new(services.arm()?, self.broker.options())
            .run(ctx, &scope, reference.object_type)?;
        if !evaluation.sufficient {
            return Err(BrokerError::forbidden(format!(
                "Entra Object ID {} has insufficient permissions ({}) on Key Vault object '{}'; {} required.",
                ctx.user_aad_object_id, evaluation.effective, scope, evaluation.required
            )));
        }
        Ok(reference)
    }

    fn acquire_secondary(
        &self,
        ctx: &mut ExecutionContext,
        resolved: &IdentityDescriptor,
        host: &ManagedIdentityRecord,
        reference: &CredentialReference,
        scopes: &[String],
    ) -> Result<AccessToken> {
        let services = self.broker.services();
        let options = self.broker.options();
        let client = services.confidential_client()?;

        let requested = ctx
            .output_record(output::REQUESTED_MANAGED_IDENTITY)
            .map(ManagedIdentityRecord::from_record)
            .unwrap_or_default();

        let audience = ctx
            .input_str(input::ASSERTION_AUDIENCE)
            .unwrap_or(options.assertion_audience.as_str())
            .to_string();
        let assertion_scopes = vec![format!("{audience}/.default")];
        let last_assertion: RefCell<Option<String>> = RefCell::new(None);
        let (host_tenant, host_application) = (
            host.tenant_id.unwrap_or(ctx.tenant_id),
            host.application_id.unwrap_or_default(),
        );

        let assertion = || -> Result<String> {
            let managed_identity = services.managed_identity()?;
            let token = self.broker.token_cache().get_or_acquire(
                host_tenant,
                host_application,
                &assertion_scopes,
                || Ok(AccessToken::new(managed_identity.acquire_token(&assertion_scopes)?)),
            )?;
            *last_assertion.borrow_mut() = Some(token.clone());
            Ok(token)
        };

        let credential = match services.credential_material() {
            Some(material) if requested.is_key_vault_sourced() => match reference.object_type {
                KeyVaultObjectType::Secret => ClientCredential::Secret(material.secret(reference)?),
                KeyVaultObjectType::Certificate | KeyVaultObjectType::CertificateWithX5c => {
                    ClientCredential::Certificate {
                        material: material.certificate(reference)?,
                        send_x5c: reference.object_type == KeyVaultObjectType::CertificateWithX5c,
                    }
                }
                KeyVaultObjectType::Unknown => {
                    return Err(BrokerError::bad_request(format!(
                        "Key Vault object '{}' has no usable object type.",
                        reference.object_name
                    )))
                }
            },
            _ => ClientCredential::Assertion(&assertion),
        };

        let result = client.acquire_token_for_client(ClientCredentialsRequest {
            authority_host: &options.authority_host,
            tenant_id: resolved.tenant_id,
            client_id: resolved.application_id,
            scopes,
            credential,
        });

        let last_assertion = last_assertion.into_inner();
        if let Some(assertion) = &last_assertion {
            ctx.shared_variables.insert(
                CLIENT_ASSERTION_VARIABLE.to_string(),
                ParameterValue::String(assertion.clone()),
            );
        }

        match result {
            Ok(token) => Ok(token),
            Err(ConfidentialClientError::Other(err)) => Err(err),
            Err(ConfidentialClientError::Service {
                error_type,
                message,
                mut additional_data,
            }) => {
                let jwt = last_assertion
                    .as_deref()
                    .and_then(|assertion| DecodedJwt::decode(assertion).ok());
                let issuer = jwt.as_ref().and_then(|j| j.issuer()).unwrap_or(UNKNOWN);
                let subject = jwt.as_ref().and_then(|j| j.subject()).unwrap_or(UNKNOWN);
                additional_data.insert("Type".to_string(), error_type);
                tracing::warn!(issuer, subject, "client credentials exchange rejected");
                Err(BrokerError::forbidden_with_details(
                    format!("Assertion: {{issuer: {issuer}, subject: {subject}}}. {message}"),
                    additional_data,
                ))
            }
        }
    }
}
