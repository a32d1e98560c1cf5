// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory stand-ins for the plugin host's services.

use dataverse_token_broker::rbac::ast::{DenyAssignment, RoleAssignment, RoleDefinition};
use dataverse_token_broker::record::{
    key_vault_reference as kvr, managed_identity as mi, plugin_assembly, plugin_package,
    plugin_step, plugin_type, system_user,
};
use dataverse_token_broker::services::*;
use dataverse_token_broker::token::unsigned_jwt;
use dataverse_token_broker::*;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use uuid::Uuid;

pub type Result<T> = dataverse_token_broker::Result<T>;

pub const VAULT_ID: &str =
    "/subscriptions/00000000-0000-0000-0000-000000000001/resourceGroups/rg1/providers/Microsoft.KeyVault/vaults/kv1";
pub const SECRETS_USER: &str =
    "/providers/Microsoft.Authorization/roleDefinitions/4633458b-17de-408a-b874-0445c86b69e6";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(String, Uuid), Record>>,
    pub retrievals: AtomicUsize,
}

impl MemoryStore {
    pub fn insert(&self, record: Record) -> Uuid {
        let id = record.id.unwrap_or_else(Uuid::new_v4);
        lock(&self.records).insert((record.logical_name.to_lowercase(), id), record.with_id(id));
        id
    }
}

impl RecordStore for MemoryStore {
    fn retrieve(&self, entity: &str, id: Uuid, _columns: &[&str]) -> Result<Option<Record>> {
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.records).get(&(entity.to_lowercase(), id)).cloned())
    }
}

#[derive(Default)]
pub struct MockArm {
    pub role_definitions: Vec<RoleDefinition>,
    pub role_assignments: Vec<RoleAssignment>,
    pub deny_assignments: Vec<DenyAssignment>,
    pub subscriptions: Vec<ResourceId>,
    pub vaults: Vec<(String, ResourceId)>,
    pub calls: AtomicUsize,
    pub subscription_listings: AtomicUsize,
}

impl MockArm {
    /// A vault `kv1` whose secrets the caller may read.
    pub fn granting_secrets() -> Self {
        let vault = ResourceId::parse(VAULT_ID).unwrap_or_else(|e| panic!("{e}"));
        Self {
            role_definitions: vec![RoleDefinition {
                id: SECRETS_USER.to_string(),
                name: "Key Vault Secrets User".to_string(),
                description: None,
                role_type: rbac::ast::RoleType::BuiltInRole,
                permissions: vec![rbac::ast::Permission {
                    data_actions: vec!["Microsoft.KeyVault/vaults/secrets/getSecret/action".to_string()],
                    ..Default::default()
                }],
            }],
            role_assignments: vec![RoleAssignment {
                id: "ra1".to_string(),
                principal_id: "user".to_string(),
                role_definition_id: SECRETS_USER.to_string(),
                scope: VAULT_ID.to_string(),
            }],
            subscriptions: vault.parent().and_then(|rg| rg.parent()).into_iter().collect(),
            vaults: vec![("kv1".to_string(), vault)],
            ..Default::default()
        }
    }

    pub fn without_assignments(mut self) -> Self {
        self.role_assignments.clear();
        self
    }
}

impl ArmQueryService for MockArm {
    fn list_role_definitions(&self, _: &ResourceId, filter: &str, _: Option<&str>) -> Result<Page<RoleDefinition>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Page::last(
            self.role_definitions
                .iter()
                .filter(|d| filter.contains(d.role_type.as_str()))
                .cloned()
                .collect(),
        ))
    }

    fn list_role_assignments(&self, _: &ResourceId, _: &str, _: Option<&str>) -> Result<Page<RoleAssignment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Page::last(self.role_assignments.clone()))
    }

    fn list_deny_assignments(&self, _: &ResourceId, _: &str, _: Option<&str>) -> Result<Page<DenyAssignment>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Page::last(self.deny_assignments.clone()))
    }

    fn list_subscriptions(&self, _: Option<&str>) -> Result<Page<ResourceId>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.subscription_listings.fetch_add(1, Ordering::SeqCst);
        Ok(Page::last(self.subscriptions.clone()))
    }

    fn list_key_vaults(&self, _: &ResourceId, _: Option<&str>) -> Result<Page<(String, ResourceId)>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Page::last(self.vaults.clone()))
    }
}

#[derive(Default)]
pub struct MockPrivileges {
    pub grants: Vec<PrivilegeGrant>,
    pub calls: AtomicUsize,
}

impl PrivilegeService for MockPrivileges {
    fn user_privileges_by_name(&self, _: Uuid, names: &[&str]) -> Result<Vec<PrivilegeGrant>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .grants
            .iter()
            .filter(|g| names.iter().any(|n| n.eq_ignore_ascii_case(&g.privilege_name)))
            .cloned()
            .collect())
    }
}

/// Issues unsigned JWTs naming the platform identity as subject.
#[derive(Default)]
pub struct MockManagedIdentity {
    pub subject: String,
    pub requests: Mutex<Vec<Vec<String>>>,
    pub bound_requests: Mutex<Vec<Uuid>>,
}

impl MockManagedIdentity {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<Vec<String>> {
        lock(&self.requests).clone()
    }

    fn token(&self, scopes: &[String]) -> String {
        unsigned_jwt(&json!({
            "iss": "https://login.microsoftonline.com/host-tenant/v2.0",
            "sub": self.subject,
            "aud": scopes.first().cloned().unwrap_or_default(),
            "exp": chrono::Utc::now().timestamp() + 3600,
        }))
    }
}

impl ManagedIdentityService for MockManagedIdentity {
    fn acquire_token(&self, scopes: &[String]) -> Result<String> {
        lock(&self.requests).push(scopes.to_vec());
        Ok(self.token(scopes))
    }

    fn acquire_token_for(&self, managed_identity_id: Uuid, scopes: &[String]) -> Result<String> {
        lock(&self.bound_requests).push(managed_identity_id);
        Ok(self.token(scopes))
    }
}

pub enum ClientBehavior {
    Issue(String),
    Reject {
        error_type: String,
        message: String,
        additional_data: Vec<(String, String)>,
    },
}

/// Records what each client-credentials request authenticated with.
pub struct MockClient {
    pub behavior: ClientBehavior,
    pub credentials: Mutex<Vec<String>>,
    pub requests: Mutex<Vec<(Uuid, Uuid, Vec<String>)>>,
}

impl MockClient {
    pub fn issuing(token: &str) -> Self {
        Self::new(ClientBehavior::Issue(token.to_string()))
    }

    pub fn new(behavior: ClientBehavior) -> Self {
        Self {
            behavior,
            credentials: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn credentials(&self) -> Vec<String> {
        lock(&self.credentials).clone()
    }

    pub fn requests(&self) -> Vec<(Uuid, Uuid, Vec<String>)> {
        lock(&self.requests).clone()
    }
}

impl ConfidentialClient for MockClient {
    fn acquire_token_for_client(
        &self,
        request: ClientCredentialsRequest<'_>,
    ) -> core::result::Result<AccessToken, ConfidentialClientError> {
        lock(&self.requests).push((request.tenant_id, request.client_id, request.scopes.to_vec()));
        let credential = match &request.credential {
            ClientCredential::Secret(secret) => format!("secret:{secret}"),
            ClientCredential::Certificate { send_x5c, .. } => format!("certificate:x5c={send_x5c}"),
            ClientCredential::Assertion(assertion) => {
                assertion().map_err(ConfidentialClientError::Other)?;
                "assertion".to_string()
            }
        };
        lock(&self.credentials).push(credential);

        match &self.behavior {
            ClientBehavior::Issue(token) => Ok(AccessToken::new(token.clone())),
            ClientBehavior::Reject {
                error_type,
                message,
                additional_data,
            } => Err(ConfidentialClientError::Service {
                error_type: error_type.clone(),
                message: message.clone(),
                additional_data: additional_data.iter().cloned().collect(),
            }),
        }
    }
}

#[derive(Default)]
pub struct MockMaterial {
    pub reads: AtomicUsize,
}

impl CredentialMaterialSource for MockMaterial {
    fn secret(&self, reference: &CredentialReference) -> Result<String> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}-value", reference.object_name))
    }

    fn certificate(&self, _: &CredentialReference) -> Result<CertificateMaterial> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(CertificateMaterial {
            certificate: vec![0x30, 0x82],
            private_key_handle: "key-handle".to_string(),
        })
    }
}

/// Mark a `managedidentity` record as sourcing its credential from Key Vault.
pub fn key_vault_sourced(record: Record, key_vault_reference_id: Uuid) -> Record {
    record
        .with(mi::CREDENTIAL_SOURCE, AttributeValue::OptionSet(mi::CREDENTIAL_SOURCE_KEY_VAULT))
        .with(mi::KEY_VAULT_REFERENCE_ID, key_vault_reference_id)
}

pub struct FixedDirectory(pub Uuid);

impl TenantDirectory for FixedDirectory {
    fn resolve_tenant_id(&self, _domain_name: &str) -> Result<Uuid> {
        Ok(self.0)
    }
}

/// A host with every collaborator mocked, and the ids of its fixture records.
pub struct Host {
    pub store: Arc<MemoryStore>,
    pub arm: Arc<MockArm>,
    pub privileges: Arc<MockPrivileges>,
    pub managed_identity: Arc<MockManagedIdentity>,
    pub client: Arc<MockClient>,
    pub material: Arc<MockMaterial>,
    pub tenant_id: Uuid,
    pub directory_tenant_id: Uuid,
    pub host_application_id: Uuid,
    pub step_id: Uuid,
}

impl Host {
    pub fn new(arm: MockArm, client: MockClient) -> Self {
        Self {
            store: Arc::new(MemoryStore::default()),
            arm: Arc::new(arm),
            privileges: Arc::new(MockPrivileges::default()),
            managed_identity: Arc::new(MockManagedIdentity::new("host-identity-object")),
            client: Arc::new(client),
            material: Arc::new(MockMaterial::default()),
            tenant_id: Uuid::new_v4(),
            directory_tenant_id: Uuid::new_v4(),
            host_application_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
        }
    }

    pub fn with_privileges(mut self, grants: Vec<PrivilegeGrant>) -> Self {
        self.privileges = Arc::new(MockPrivileges {
            grants,
            ..Default::default()
        });
        self
    }

    /// Grant impersonation in `business_unit_id`.
    pub fn impersonation_grant(business_unit_id: Uuid) -> PrivilegeGrant {
        PrivilegeGrant {
            privilege_id: Uuid::new_v4(),
            privilege_name: "prvActOnBehalfOfAnotherUser".to_string(),
            business_unit_id,
        }
    }

    pub fn services(&self) -> BrokerServices {
        BrokerServices::new()
            .with_record_store(self.store.clone())
            .with_arm(self.arm.clone())
            .with_privileges(self.privileges.clone())
            .with_managed_identity(self.managed_identity.clone())
            .with_confidential_client(self.client.clone())
            .with_credential_material(self.material.clone())
            .with_tenant_directory(Arc::new(FixedDirectory(self.directory_tenant_id)))
    }

    pub fn broker(&self) -> TokenBroker {
        TokenBroker::new(self.services(), BrokerOptions::default())
    }

    /// Register step → plugin type → assembly → managed identity.
    /// With `via_package`, the assembly only points at its package.
    pub fn register_plugin(&self, via_package: bool) -> Uuid {
        let identity = self.store.insert(
            Record::new(mi::ENTITY)
                .with(mi::APPLICATION_ID, self.host_application_id)
                .with(mi::TENANT_ID, self.tenant_id),
        );
        let mut assembly = Record::new(plugin_assembly::ENTITY);
        if via_package {
            let package = self.store.insert(
                Record::new(plugin_package::ENTITY)
                    .with(plugin_package::MANAGED_IDENTITY_ID, EntityReference::new(mi::ENTITY, identity)),
            );
            assembly.set(
                plugin_assembly::PACKAGE_ID,
                EntityReference::new(plugin_package::ENTITY, package),
            );
        } else {
            assembly.set(
                plugin_assembly::MANAGED_IDENTITY_ID,
                EntityReference::new(mi::ENTITY, identity),
            );
        }
        let assembly = self.store.insert(assembly);
        let plugin_type_id = self.store.insert(
            Record::new(plugin_type::ENTITY)
                .with(plugin_type::PLUGIN_ASSEMBLY_ID, EntityReference::new(plugin_assembly::ENTITY, assembly)),
        );
        self.store.insert(
            Record::new(plugin_step::ENTITY)
                .with_id(self.step_id)
                .with(plugin_step::PLUGIN_TYPE_ID, EntityReference::new(plugin_type::ENTITY, plugin_type_id)),
        );
        identity
    }

    pub fn register_application_user(&self, user_id: Uuid, application_id: Uuid) {
        self.store.insert(
            Record::new(system_user::ENTITY)
                .with_id(user_id)
                .with(system_user::APPLICATION_ID, application_id),
        );
    }

    pub fn register_key_vault_reference(&self, name: &str, object_type: i32) -> Uuid {
        self.store.insert(
            Record::new(kvr::ENTITY)
                .with(kvr::KEY_VAULT_URI, "https://kv1.vault.azure.net/")
                .with(kvr::KEY_NAME, name)
                .with(kvr::KEY_TYPE, AttributeValue::OptionSet(object_type)),
        )
    }

    /// Context of a plugin step running for an interactive user.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(self.tenant_id, Uuid::new_v4())
            .with_user_aad_object_id(Uuid::new_v4())
            .with_business_unit(Uuid::new_v4())
            .with_owning_extension(EntityReference::new(plugin_step::ENTITY, self.step_id))
    }
}
