// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key Vault references: the secret or certificate guarding a secondary credential.
//!
//! A reference is resolved from the first available of: the primary entity,
//! the `KeyVaultReference` input, the requested managed identity, or loose
//! `KeyVault*` inputs. Its ARM resource identifier is looked up through the
//! subscriptions visible to the broker when not given.

use url::Url;

use crate::context::{input, output, ExecutionContext, ParameterValue};
use crate::error::{BrokerError, Result};
use crate::options::BrokerOptions;
use crate::rbac::capabilities::{Capability, CapabilitySet};
use crate::record::{key_vault_reference as kvr, managed_identity as mi, Record};
use crate::resource_id::ResourceId;
use crate::services::{find_in_pages, BrokerServices};

pub const VAULT_RESOURCE_TYPE: &str = "Microsoft.KeyVault/vaults";
pub const SECRET_RESOURCE_TYPE: &str = "Microsoft.KeyVault/vaults/secrets";
pub const CERTIFICATE_RESOURCE_TYPE: &str = "Microsoft.KeyVault/vaults/certificates";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyVaultObjectType {
    Secret,
    Certificate,
    CertificateWithX5c,
    Unknown,
}

impl KeyVaultObjectType {
    pub fn from_option_value(value: i64) -> Option<Self> {
        match value {
            0 => Some(KeyVaultObjectType::Secret),
            1 => Some(KeyVaultObjectType::Certificate),
            2 => Some(KeyVaultObjectType::CertificateWithX5c),
            _ => None,
        }
    }

    pub fn option_value(self) -> Option<i32> {
        match self {
            KeyVaultObjectType::Secret => Some(0),
            KeyVaultObjectType::Certificate => Some(1),
            KeyVaultObjectType::CertificateWithX5c => Some(2),
            KeyVaultObjectType::Unknown => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            KeyVaultObjectType::Secret,
            KeyVaultObjectType::Certificate,
            KeyVaultObjectType::CertificateWithX5c,
        ]
        .into_iter()
        .find(|t| t.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyVaultObjectType::Secret => "Secret",
            KeyVaultObjectType::Certificate => "Certificate",
            KeyVaultObjectType::CertificateWithX5c => "CertificateWithX5c",
            KeyVaultObjectType::Unknown => "Unknown",
        }
    }

    /// Capabilities a user needs on an object of this type.
    pub fn required_capabilities(self) -> CapabilitySet {
        match self {
            KeyVaultObjectType::Secret => Capability::GetSecret.into(),
            KeyVaultObjectType::Certificate | KeyVaultObjectType::CertificateWithX5c => {
                CapabilitySet::from_iter([
                    Capability::ReadCertificateProperties,
                    Capability::SignWithKey,
                ])
            }
            KeyVaultObjectType::Unknown => CapabilitySet::empty(),
        }
    }

    /// Child resource type segment under a vault.
    fn collection(self) -> Option<&'static str> {
        match self {
            KeyVaultObjectType::Secret => Some("secrets"),
            KeyVaultObjectType::Certificate | KeyVaultObjectType::CertificateWithX5c => {
                Some("certificates")
            }
            KeyVaultObjectType::Unknown => None,
        }
    }

    fn from_resource_type(resource_type: &str) -> Self {
        if resource_type.eq_ignore_ascii_case(SECRET_RESOURCE_TYPE) {
            KeyVaultObjectType::Secret
        } else if resource_type.eq_ignore_ascii_case(CERTIFICATE_RESOURCE_TYPE) {
            KeyVaultObjectType::Certificate
        } else {
            KeyVaultObjectType::Unknown
        }
    }
}

impl core::fmt::Display for KeyVaultObjectType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// A resolved Key Vault object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialReference {
    pub vault_uri: String,
    pub object_name: String,
    pub object_version: Option<String>,
    pub object_type: KeyVaultObjectType,
    pub resource_id: Option<ResourceId>,
}

impl CredentialReference {
    pub fn from_record(record: &Record) -> Self {
        Self {
            vault_uri: record.get_str(kvr::KEY_VAULT_URI).unwrap_or_default().to_string(),
            object_name: record.get_str(kvr::KEY_NAME).unwrap_or_default().to_string(),
            object_version: record.get_str(kvr::KEY_VERSION).map(|s| s.to_string()),
            object_type: record
                .get_option_set(kvr::KEY_TYPE)
                .and_then(|v| KeyVaultObjectType::from_option_value(v.into()))
                .unwrap_or(KeyVaultObjectType::Unknown),
            resource_id: record
                .get_str(kvr::RESOURCE_IDENTIFIER)
                .and_then(|s| ResourceId::parse(s).ok()),
        }
    }
}

/// Resolves and publishes the Key Vault reference of an invocation.
pub struct KeyVaultReferenceResolver<'a> {
    services: &'a BrokerServices,
    options: &'a BrokerOptions,
}

impl<'a> KeyVaultReferenceResolver<'a> {
    pub fn new(services: &'a BrokerServices, options: &'a BrokerOptions) -> Self {
        Self { services, options }
    }

    /// Resolve the reference unless an earlier step already published it.
    pub fn ensure_key_vault_reference(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if ctx.output_record(output::KEY_VAULT_REFERENCE).is_none() {
            self.resolve(ctx)?;
        }
        Ok(())
    }

    /// The published reference, if any.
    pub fn key_vault_reference(&self, ctx: &ExecutionContext) -> Option<CredentialReference> {
        ctx.output_record(output::KEY_VAULT_REFERENCE)
            .map(CredentialReference::from_record)
    }

    /// The published secret or certificate resource id, walking up from versions.
    pub fn content_resource_id(&self, ctx: &ExecutionContext) -> Result<Option<ResourceId>> {
        let Some(raw) = ctx.output_str(output::KEY_VAULT_RESOURCE_IDENTIFIER) else {
            return Ok(None);
        };
        let invalid = || {
            BrokerError::bad_request(format!(
                "Provided KeyVault resource ID '{raw}' is not a valid Resource ID for a KeyVault secret or certificate."
            ))
        };
        let id = ResourceId::parse(raw).map_err(|_| invalid())?;
        id.ancestor_of_type(&[SECRET_RESOURCE_TYPE, CERTIFICATE_RESOURCE_TYPE])
            .map(Some)
            .ok_or_else(invalid)
    }

    /// Resolve the reference and publish `KeyVaultReference` and
    /// `KeyVaultResourceIdentifier`.
    pub fn resolve(&self, ctx: &mut ExecutionContext) -> Result<CredentialReference> {
        let mut record = self.reference_record(ctx)?;

        let resource_id = match record.get_str(kvr::RESOURCE_IDENTIFIER) {
            Some(raw) => ResourceId::parse(raw)?,
            None => {
                let id = self.lookup_resource_id(&record)?;
                record.set(kvr::RESOURCE_IDENTIFIER, id.to_string());
                id
            }
        };

        if record.get_str(kvr::KEY_VAULT_URI).is_none() {
            if let Some(vault) = resource_id.ancestor_of_type(&[VAULT_RESOURCE_TYPE]) {
                record.set(
                    kvr::KEY_VAULT_URI,
                    format!("https://{}.{}", vault.name(), self.options.key_vault_dns_suffix),
                );
            }
        }

        if record.get_str(kvr::KEY_NAME).is_none() {
            if let Some(content) =
                resource_id.ancestor_of_type(&[SECRET_RESOURCE_TYPE, CERTIFICATE_RESOURCE_TYPE])
            {
                record.set(kvr::KEY_NAME, content.name());
                if record.get_option_set(kvr::KEY_TYPE).is_none() {
                    let object_type = KeyVaultObjectType::from_resource_type(&content.resource_type());
                    if let Some(value) = object_type.option_value() {
                        record.set(kvr::KEY_TYPE, crate::record::AttributeValue::OptionSet(value));
                    }
                }
            }
        }

        tracing::debug!(resource_id = %resource_id, "resolved key vault reference");
        let reference = CredentialReference::from_record(&record);
        ctx.set_output(
            output::KEY_VAULT_RESOURCE_IDENTIFIER,
            ParameterValue::String(resource_id.to_string()),
        );
        ctx.set_output(output::KEY_VAULT_REFERENCE, ParameterValue::Record(record));
        Ok(reference)
    }

    fn reference_record(&self, ctx: &ExecutionContext) -> Result<Record> {
        if let Some(id) = ctx.primary_entity_of(kvr::ENTITY) {
            return self.retrieve(id);
        }

        match ctx.input(input::KEY_VAULT_REFERENCE) {
            Some(ParameterValue::Record(record)) => return Ok(record.clone()),
            Some(ParameterValue::EntityReference(r)) if !r.id.is_nil() => {
                return self.retrieve(r.id)
            }
            _ => (),
        }

        if let Some(id) = ctx
            .output_record(output::REQUESTED_MANAGED_IDENTITY)
            .and_then(|identity| identity.get_guid(mi::KEY_VAULT_REFERENCE_ID))
        {
            return self.retrieve(id);
        }

        Self::record_from_inputs(ctx)
    }

    fn retrieve(&self, id: uuid::Uuid) -> Result<Record> {
        self.services
            .record_store()?
            .retrieve(kvr::ENTITY, id, kvr::COLUMNS)?
            .ok_or_else(|| BrokerError::not_found(format!("Key Vault reference {id} does not exist.")))
    }

    fn record_from_inputs(ctx: &ExecutionContext) -> Result<Record> {
        let mut record = Record::new(kvr::ENTITY);

        if let Some(uri) = ctx.input_str(input::KEY_VAULT_URI) {
            record.set(kvr::KEY_VAULT_URI, uri);
        }

        if let Some(value) = ctx.input(input::KEY_VAULT_OBJECT_TYPE) {
            let object_type = Self::object_type_input(value)?;
            if let Some(option) = object_type.option_value() {
                record.set(kvr::KEY_TYPE, crate::record::AttributeValue::OptionSet(option));
            }
        }

        if let Some(name) = ctx.input_str(input::KEY_VAULT_OBJECT_NAME) {
            record.set(kvr::KEY_NAME, name);
            if let Some(version) = ctx.input_str(input::KEY_VAULT_OBJECT_VERSION) {
                record.set(kvr::KEY_VERSION, version);
            }
        }

        if let Some(resource_id) = ctx.input_str(input::KEY_VAULT_RESOURCE_IDENTIFIER) {
            record.set(kvr::RESOURCE_IDENTIFIER, resource_id);
        }

        Ok(record)
    }

    fn object_type_input(value: &ParameterValue) -> Result<KeyVaultObjectType> {
        let parsed = match value {
            ParameterValue::OptionSet(v) => KeyVaultObjectType::from_option_value((*v).into()),
            ParameterValue::Int(v) => KeyVaultObjectType::from_option_value(*v),
            ParameterValue::String(s) => s
                .trim()
                .parse::<i64>()
                .ok()
                .map_or_else(|| KeyVaultObjectType::from_name(s.trim()), KeyVaultObjectType::from_option_value),
            _ => None,
        };
        parsed.ok_or_else(|| {
            let shown = match value {
                ParameterValue::String(s) => format!("'{s}'"),
                ParameterValue::OptionSet(v) => v.to_string(),
                ParameterValue::Int(v) => v.to_string(),
                other => format!("{other:?}"),
            };
            BrokerError::bad_request(format!(
                "Invalid input parameter {}: {} is not a valid Key Vault Object Type.",
                input::KEY_VAULT_OBJECT_TYPE,
                shown
            ))
        })
    }

    /// Find the vault named by the URI host and build the object id beneath it.
    fn lookup_resource_id(&self, record: &Record) -> Result<ResourceId> {
        let uri = record.get_str(kvr::KEY_VAULT_URI).ok_or_else(|| {
            BrokerError::bad_request("Unable to resolve Key Vault Resource without Key Vault URI.")
        })?;
        let vault_name = vault_name_from_uri(uri)?;
        let reference = CredentialReference::from_record(record);

        let collection = reference.object_type.collection().ok_or_else(|| {
            BrokerError::bad_request(format!(
                "Key Vault object type is required to locate '{}' in vault '{}'.",
                reference.object_name, vault_name
            ))
        })?;
        if reference.object_name.is_empty() {
            return Err(BrokerError::bad_request(format!(
                "Key Vault object name is required to locate an object in vault '{vault_name}'."
            )));
        }

        let arm = self.services.arm()?;
        let vault_id = find_in_pages(
            |token| arm.list_subscriptions(token),
            |subscription| {
                find_in_pages(
                    |token| arm.list_key_vaults(&subscription, token),
                    |(name, id)| Ok(name.eq_ignore_ascii_case(&vault_name).then_some(id)),
                )
            },
        )?
        .ok_or_else(|| {
            BrokerError::not_found(format!(
                "No Key Vault named '{vault_name}' (inferred from URI '{uri}') could be found."
            ))
        })?;

        let object_id = vault_id.child(collection, &reference.object_name)?;
        match &reference.object_version {
            Some(version) => object_id.child("versions", version),
            None => Ok(object_id),
        }
    }
}

/// First DNS label of the vault URI host, e.g. `kv1` for `https://kv1.vault.azure.net/`.
pub fn vault_name_from_uri(uri: &str) -> Result<String> {
    let parsed = Url::parse(uri)
        .map_err(|e| BrokerError::bad_request(format!("Invalid Key Vault URI '{uri}': {e}")))?;
    parsed
        .host_str()
        .and_then(|host| host.split('.').next())
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .ok_or_else(|| BrokerError::bad_request(format!("Key Vault URI '{uri}' has no host.")))
}
