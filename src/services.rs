// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Collaborator contracts.
//!
//! The broker performs no I/O of its own. The plugin host supplies these
//! services through [`BrokerServices`]; an operation that needs a collaborator
//! that was not supplied fails with an internal server error naming it.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{BrokerError, Details, Result};
use crate::keyvault::CredentialReference;
use crate::rbac::ast::{DenyAssignment, RoleAssignment, RoleDefinition};
use crate::record::Record;
use crate::resource_id::ResourceId;
use crate::token::AccessToken;

/// One page of a paged listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Token for the next page, `None` on the last page.
    pub continuation: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            continuation: None,
        }
    }
}

/// Fetch every page in order and concatenate the items.
pub fn drain<T>(mut fetch: impl FnMut(Option<&str>) -> Result<Page<T>>) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let page = fetch(continuation.as_deref())?;
        items.extend(page.items);
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(items),
        }
    }
}

/// Walk pages in order until `find` yields a value. Later pages are not fetched.
pub fn find_in_pages<T, R>(
    mut fetch: impl FnMut(Option<&str>) -> Result<Page<T>>,
    mut find: impl FnMut(T) -> Result<Option<R>>,
) -> Result<Option<R>> {
    let mut continuation: Option<String> = None;
    loop {
        let page = fetch(continuation.as_deref())?;
        for item in page.items {
            if let Some(found) = find(item)? {
                return Ok(Some(found));
            }
        }
        match page.continuation {
            Some(next) => continuation = Some(next),
            None => return Ok(None),
        }
    }
}

/// Dataverse-like record store.
pub trait RecordStore: Send + Sync {
    /// Retrieve `columns` of a record; `Ok(None)` when it does not exist.
    fn retrieve(&self, entity: &str, id: Uuid, columns: &[&str]) -> Result<Option<Record>>;
}

/// Azure Resource Manager queries.
pub trait ArmQueryService: Send + Sync {
    fn list_role_definitions(
        &self,
        scope: &ResourceId,
        filter: &str,
        continuation: Option<&str>,
    ) -> Result<Page<RoleDefinition>>;

    fn list_role_assignments(
        &self,
        scope: &ResourceId,
        filter: &str,
        continuation: Option<&str>,
    ) -> Result<Page<RoleAssignment>>;

    fn list_deny_assignments(
        &self,
        scope: &ResourceId,
        filter: &str,
        continuation: Option<&str>,
    ) -> Result<Page<DenyAssignment>>;

    fn list_subscriptions(&self, continuation: Option<&str>) -> Result<Page<ResourceId>>;

    /// Key vaults of a subscription, as `(name, resource id)`.
    fn list_key_vaults(
        &self,
        subscription: &ResourceId,
        continuation: Option<&str>,
    ) -> Result<Page<(String, ResourceId)>>;
}

/// A privilege held by a user, with the business unit it is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeGrant {
    pub privilege_id: Uuid,
    pub privilege_name: String,
    pub business_unit_id: Uuid,
}

pub trait PrivilegeService: Send + Sync {
    fn user_privileges_by_name(
        &self,
        user_aad_object_id: Uuid,
        privilege_names: &[&str],
    ) -> Result<Vec<PrivilegeGrant>>;
}

/// Platform-native token source of the executing plugin.
pub trait ManagedIdentityService: Send + Sync {
    fn acquire_token(&self, scopes: &[String]) -> Result<String>;

    /// Token for a specific `managedidentity` record.
    fn acquire_token_for(&self, managed_identity_id: Uuid, scopes: &[String]) -> Result<String>;
}

/// Host-internal managed identity API. Hosts may or may not offer it.
pub trait InternalManagedIdentityService: Send + Sync {
    fn acquire_token_from_tenant(&self, scopes: &[String], tenant: &str) -> Result<String>;
}

pub trait OnBehalfOfTokenService: Send + Sync {
    fn acquire_token(&self, scopes: &[String]) -> Result<String>;
}

/// Resolves a tenant domain name such as `contoso.onmicrosoft.com` to its id.
pub trait TenantDirectory: Send + Sync {
    fn resolve_tenant_id(&self, domain_name: &str) -> Result<Uuid>;
}

/// An X.509 certificate and a handle to its private key.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    /// DER encoded certificate.
    pub certificate: Vec<u8>,
    pub private_key_handle: String,
}

impl core::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// Secret or certificate material stored in Key Vault.
pub trait CredentialMaterialSource: Send + Sync {
    fn secret(&self, reference: &CredentialReference) -> Result<String>;
    fn certificate(&self, reference: &CredentialReference) -> Result<CertificateMaterial>;
}

/// How a confidential client authenticates.
pub enum ClientCredential<'a> {
    Secret(String),
    Certificate {
        material: CertificateMaterial,
        send_x5c: bool,
    },
    /// Called by the client whenever it needs a fresh signed assertion.
    Assertion(&'a dyn Fn() -> Result<String>),
}

impl core::fmt::Debug for ClientCredential<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientCredential::Secret(_) => f.write_str("Secret(..)"),
            ClientCredential::Certificate { send_x5c, .. } => f
                .debug_struct("Certificate")
                .field("send_x5c", send_x5c)
                .finish_non_exhaustive(),
            ClientCredential::Assertion(_) => f.write_str("Assertion(..)"),
        }
    }
}

#[derive(Debug)]
pub struct ClientCredentialsRequest<'a> {
    pub authority_host: &'a str,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub scopes: &'a [String],
    pub credential: ClientCredential<'a>,
}

/// Failure of an OAuth client-credentials exchange.
#[derive(Debug)]
pub enum ConfidentialClientError {
    /// The token service rejected the request.
    Service {
        error_type: String,
        message: String,
        additional_data: Details,
    },
    Other(BrokerError),
}

impl core::fmt::Display for ConfidentialClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfidentialClientError::Service {
                error_type,
                message,
                ..
            } => write!(f, "{}: {}", error_type, message),
            ConfidentialClientError::Other(err) => write!(f, "{}", err),
        }
    }
}

/// OAuth client-credentials flow.
pub trait ConfidentialClient: Send + Sync {
    fn acquire_token_for_client(
        &self,
        request: ClientCredentialsRequest<'_>,
    ) -> core::result::Result<AccessToken, ConfidentialClientError>;
}

/// The collaborators of one broker, injected explicitly.
#[derive(Clone, Default)]
pub struct BrokerServices {
    record_store: Option<Arc<dyn RecordStore>>,
    arm: Option<Arc<dyn ArmQueryService>>,
    privileges: Option<Arc<dyn PrivilegeService>>,
    managed_identity: Option<Arc<dyn ManagedIdentityService>>,
    internal_managed_identity: Option<Arc<dyn InternalManagedIdentityService>>,
    on_behalf_of: Option<Arc<dyn OnBehalfOfTokenService>>,
    tenant_directory: Option<Arc<dyn TenantDirectory>>,
    credential_material: Option<Arc<dyn CredentialMaterialSource>>,
    confidential_client: Option<Arc<dyn ConfidentialClient>>,
}

macro_rules! collaborator {
    ($field:ident, $with:ident, $trait:ident) => {
        pub fn $with(mut self, service: Arc<dyn $trait>) -> Self {
            self.$field = Some(service);
            self
        }

        pub fn $field(&self) -> Result<&dyn $trait> {
            self.$field
                .as_deref()
                .ok_or_else(|| BrokerError::unavailable(stringify!($trait)))
        }
    };
}

impl BrokerServices {
    pub fn new() -> Self {
        Self::default()
    }

    collaborator!(record_store, with_record_store, RecordStore);
    collaborator!(arm, with_arm, ArmQueryService);
    collaborator!(privileges, with_privileges, PrivilegeService);
    collaborator!(managed_identity, with_managed_identity, ManagedIdentityService);
    collaborator!(on_behalf_of, with_on_behalf_of, OnBehalfOfTokenService);
    collaborator!(tenant_directory, with_tenant_directory, TenantDirectory);
    collaborator!(confidential_client, with_confidential_client, ConfidentialClient);

    pub fn with_internal_managed_identity(
        mut self,
        service: Arc<dyn InternalManagedIdentityService>,
    ) -> Self {
        self.internal_managed_identity = Some(service);
        self
    }

    /// The host-internal managed identity API, if this host offers it.
    pub fn internal_managed_identity(&self) -> Option<&dyn InternalManagedIdentityService> {
        self.internal_managed_identity.as_deref()
    }

    pub fn with_credential_material(mut self, service: Arc<dyn CredentialMaterialSource>) -> Self {
        self.credential_material = Some(service);
        self
    }

    /// Key Vault material source; optional, assertions are used without it.
    pub fn credential_material(&self) -> Option<&dyn CredentialMaterialSource> {
        self.credential_material.as_deref()
    }
}
