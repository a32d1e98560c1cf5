// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Which application identity a token request is for, and whether the caller
//! may ask for it.

use uuid::Uuid;

use crate::context::{input, output, ExecutionContext, ParameterValue};
use crate::error::{BrokerError, Result};
use crate::options::BrokerOptions;
use crate::record::{
    managed_identity as mi, plugin_assembly, plugin_package, plugin_step, plugin_type, system_user,
    Record,
};
use crate::services::BrokerServices;

/// Tenant and application a token is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityDescriptor {
    pub tenant_id: Uuid,
    pub application_id: Uuid,
    /// Resource the token is for; defaults to the application id.
    pub resource_id: Option<String>,
}

impl IdentityDescriptor {
    pub fn resource(&self) -> String {
        match &self.resource_id {
            Some(resource) => resource.clone(),
            None => self.application_id.to_string(),
        }
    }

    /// `{resource}/.default`
    pub fn default_scopes(&self) -> Vec<String> {
        vec![format!("{}/.default", self.resource())]
    }
}

/// Typed view of a `managedidentity` record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ManagedIdentityRecord {
    pub id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub application_id: Option<Uuid>,
    pub name: Option<String>,
    pub credential_source: Option<i32>,
    pub key_vault_reference_id: Option<Uuid>,
}

impl ManagedIdentityRecord {
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id.or_else(|| record.get_guid(mi::ID)),
            tenant_id: record.get_guid(mi::TENANT_ID),
            application_id: record.get_guid(mi::APPLICATION_ID),
            name: record.get_str(mi::NAME).map(|s| s.to_string()),
            credential_source: record.get_option_set(mi::CREDENTIAL_SOURCE),
            key_vault_reference_id: record.get_guid(mi::KEY_VAULT_REFERENCE_ID),
        }
    }

    pub fn is_key_vault_sourced(&self) -> bool {
        self.credential_source == Some(mi::CREDENTIAL_SOURCE_KEY_VAULT)
    }

    /// Whether tokens for `requested` can come straight from this identity.
    pub fn serves(&self, requested: &IdentityDescriptor) -> bool {
        self.application_id == Some(requested.application_id)
            && self.tenant_id.map_or(true, |t| t == requested.tenant_id)
    }
}

pub struct IdentityResolver<'a> {
    services: &'a BrokerServices,
    options: &'a BrokerOptions,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(services: &'a BrokerServices, options: &'a BrokerOptions) -> Self {
        Self { services, options }
    }

    /// Determine the identity a request is for.
    ///
    /// Explicit inputs win, then a bound `managedidentity` record, then the
    /// caller's own application. Tenant defaults to the context tenant.
    pub fn resolve(&self, ctx: &mut ExecutionContext) -> Result<IdentityDescriptor> {
        let user_application_id = self.user_application_id(ctx)?;
        let requested = ManagedIdentityRecord::from_record(&self.requested_managed_identity(ctx)?);

        let tenant_id = requested.tenant_id.unwrap_or(ctx.tenant_id);
        let application_id = requested
            .application_id
            .or(user_application_id)
            .ok_or_else(|| {
                BrokerError::bad_request(format!(
                    "User is not an application user, and input parameter '{}' was not specified.",
                    input::APPLICATION_ID
                ))
            })?;

        let resolved = IdentityDescriptor {
            tenant_id,
            application_id,
            resource_id: ctx.input_str(input::RESOURCE_ID).map(|s| s.to_string()),
        };
        tracing::debug!(%tenant_id, %application_id, "resolved requested identity");
        Ok(resolved)
    }

    /// Succeeds for self-requests; otherwise the caller needs the impersonation
    /// privilege in their own business unit.
    pub fn authorize(&self, ctx: &mut ExecutionContext, resolved: &IdentityDescriptor) -> Result<()> {
        let own_tenant = resolved.tenant_id.is_nil() || resolved.tenant_id == ctx.tenant_id;
        if own_tenant && self.user_application_id(ctx)? == Some(resolved.application_id) {
            return Ok(());
        }

        let privilege = self.options.impersonation_privilege.as_str();
        let grants = self
            .services
            .privileges()?
            .user_privileges_by_name(ctx.user_aad_object_id, &[privilege])?;
        let held = grants.iter().any(|grant| {
            grant.privilege_name.eq_ignore_ascii_case(privilege)
                && grant.business_unit_id == ctx.business_unit_id
        });
        if held {
            tracing::info!(user = %ctx.user_aad_object_id, application = %resolved.application_id, "impersonation permitted");
            return Ok(());
        }

        Err(BrokerError::forbidden(format!(
            "Entra Object ID {} is missing privilege {}.",
            ctx.user_aad_object_id, privilege
        )))
    }

    /// The caller's `systemuser.applicationid`, published as `UserApplicationId`.
    pub fn user_application_id(&self, ctx: &mut ExecutionContext) -> Result<Option<Uuid>> {
        if let Some(id) = ctx.output_guid(output::USER_APPLICATION_ID) {
            return Ok(Some(id));
        }
        if !ctx.is_application_user {
            return Ok(None);
        }

        let application_id = self
            .services
            .record_store()?
            .retrieve(system_user::ENTITY, ctx.user_id, system_user::COLUMNS)?
            .and_then(|user| user.get_guid(system_user::APPLICATION_ID));
        if let Some(id) = application_id {
            ctx.set_output(output::USER_APPLICATION_ID, ParameterValue::Guid(id));
        }
        Ok(application_id)
    }

    /// The managed identity named by the request, published as `RequestedManagedIdentity`.
    pub fn requested_managed_identity(&self, ctx: &mut ExecutionContext) -> Result<Record> {
        if let Some(record) = ctx.output_record(output::REQUESTED_MANAGED_IDENTITY) {
            return Ok(record.clone());
        }

        let record = match ctx.primary_entity_of(mi::ENTITY) {
            Some(id) if !has_explicit_identity(ctx) => self.bound_managed_identity(id)?,
            _ => self.managed_identity_from_inputs(ctx)?,
        };
        ctx.set_output(output::REQUESTED_MANAGED_IDENTITY, ParameterValue::Record(record.clone()));
        Ok(record)
    }

    fn bound_managed_identity(&self, id: Uuid) -> Result<Record> {
        let record = self
            .services
            .record_store()?
            .retrieve(mi::ENTITY, id, mi::COLUMNS)?
            .ok_or_else(|| BrokerError::not_found(format!("Managed identity {id} does not exist.")))?;
        match record.get_option_set(mi::STATECODE) {
            Some(state) if state != mi::STATECODE_ACTIVE => Err(BrokerError::bad_request(format!(
                "Managed identity {id} is not active."
            ))),
            _ => Ok(record),
        }
    }

    fn managed_identity_from_inputs(&self, ctx: &ExecutionContext) -> Result<Record> {
        let mut record = Record::new(mi::ENTITY);

        match ctx.input(input::TENANT_ID) {
            Some(ParameterValue::Guid(id)) => record.set(mi::TENANT_ID, *id),
            Some(ParameterValue::String(value)) if !value.is_empty() => {
                let tenant_id = match Uuid::parse_str(value) {
                    Ok(id) => id,
                    Err(_) => {
                        record.set(mi::TENANT_DOMAIN_NAME, value.as_str());
                        self.services.tenant_directory()?.resolve_tenant_id(value)?
                    }
                };
                record.set(mi::TENANT_ID, tenant_id);
            }
            _ => (),
        }

        if let Some(id) = ctx.input_guid(input::APPLICATION_ID) {
            record.set(mi::APPLICATION_ID, id);
        }
        if let Some(name) = ctx.input_str(input::NAME) {
            record.set(mi::NAME, name);
        }
        Ok(record)
    }

    /// Managed identity of the executing plugin, published as `PluginAssemblyManagedIdentity`.
    ///
    /// Follows step, plugin type and assembly, then falls back to the
    /// assembly's package. Any missing link yields `None`.
    pub fn hosting_identity(&self, ctx: &mut ExecutionContext) -> Result<Option<Record>> {
        if let Some(record) = ctx.output_record(output::PLUGIN_ASSEMBLY_MANAGED_IDENTITY) {
            return Ok(Some(record.clone()));
        }
        let Some(step) = ctx.owning_extension.clone() else {
            return Ok(None);
        };

        let store = self.services.record_store()?;
        let entity = if step.logical_name.is_empty() {
            plugin_step::ENTITY
        } else {
            step.logical_name.as_str()
        };
        let follow = |record: Option<Record>, field: &str| record.and_then(|r| r.get_guid(field));

        let plugin_type_id = follow(
            store.retrieve(entity, step.id, plugin_step::COLUMNS)?,
            plugin_step::PLUGIN_TYPE_ID,
        );
        let Some(plugin_type_id) = plugin_type_id else {
            return Ok(None);
        };
        let assembly_id = follow(
            store.retrieve(plugin_type::ENTITY, plugin_type_id, plugin_type::COLUMNS)?,
            plugin_type::PLUGIN_ASSEMBLY_ID,
        );
        let Some(assembly_id) = assembly_id else {
            return Ok(None);
        };
        let Some(assembly) =
            store.retrieve(plugin_assembly::ENTITY, assembly_id, plugin_assembly::COLUMNS)?
        else {
            return Ok(None);
        };

        let identity_id = match assembly.get_guid(plugin_assembly::MANAGED_IDENTITY_ID) {
            Some(id) => Some(id),
            None => match assembly.get_guid(plugin_assembly::PACKAGE_ID) {
                Some(package_id) => follow(
                    store.retrieve(plugin_package::ENTITY, package_id, plugin_package::COLUMNS)?,
                    plugin_package::MANAGED_IDENTITY_ID,
                ),
                None => None,
            },
        };
        let Some(identity_id) = identity_id else {
            return Ok(None);
        };

        let identity = store.retrieve(mi::ENTITY, identity_id, mi::COLUMNS)?;
        if let Some(record) = &identity {
            tracing::debug!(managed_identity = %identity_id, "found hosting identity");
            ctx.set_output(
                output::PLUGIN_ASSEMBLY_MANAGED_IDENTITY,
                ParameterValue::Record(record.clone()),
            );
        }
        Ok(identity)
    }
}

/// Whether the request names an application or tenant itself.
fn has_explicit_identity(ctx: &ExecutionContext) -> bool {
    let tenant = match ctx.input(input::TENANT_ID) {
        Some(ParameterValue::String(value)) => !value.is_empty(),
        Some(ParameterValue::Guid(id)) => !id.is_nil(),
        _ => false,
    };
    tenant || ctx.input_guid(input::APPLICATION_ID).is_some_and(|id| !id.is_nil())
}
