// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-invocation execution context.
//!
//! Holds the caller's identity, the named input and output parameters, the
//! shared variables of the pipeline and the trace sink of this invocation.
//! Output parameters double as the working state of the orchestration: a step
//! that resolves something publishes it as an output and later steps read it
//! back from there.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{EntityReference, Record};
use crate::trace::{TraceSink, TracingSink};

/// Names of the input parameters the plugins read.
pub mod input {
    pub const SCOPES: &str = "Scopes";
    pub const TENANT_ID: &str = "TenantId";
    pub const APPLICATION_ID: &str = "ApplicationId";
    pub const NAME: &str = "Name";
    pub const RESOURCE_ID: &str = "ResourceId";
    pub const ASSERTION_AUDIENCE: &str = "AssertionAudience";
    pub const KEY_VAULT_REFERENCE: &str = "KeyVaultReference";
    pub const KEY_VAULT_URI: &str = "KeyVaultUri";
    pub const KEY_VAULT_OBJECT_TYPE: &str = "KeyVaultObjectType";
    pub const KEY_VAULT_OBJECT_NAME: &str = "KeyVaultObjectName";
    pub const KEY_VAULT_OBJECT_VERSION: &str = "KeyVaultObjectVersion";
    pub const KEY_VAULT_RESOURCE_IDENTIFIER: &str = "KeyVaultResourceIdentifier";
}

/// Names of the output parameters the plugins produce.
pub mod output {
    pub const ACCESS_TOKEN: &str = "AccessToken";
    pub const JSON_WEB_TOKEN: &str = "JsonWebToken";
    pub const KEY_VAULT_REFERENCE: &str = "KeyVaultReference";
    pub const KEY_VAULT_RESOURCE_IDENTIFIER: &str = "KeyVaultResourceIdentifier";
    pub const REQUESTED_MANAGED_IDENTITY: &str = "RequestedManagedIdentity";
    pub const PLUGIN_ASSEMBLY_MANAGED_IDENTITY: &str = "PluginAssemblyManagedIdentity";
    pub const USER_APPLICATION_ID: &str = "UserApplicationId";
    pub const USER_POSSIBLE_PERMISSIONS: &str = "UserPossiblePermissions";
    pub const USER_POSSIBLE_PERMISSIONS_DISPLAY_NAME: &str = "UserPossiblePermissionsDisplayName";
    pub const USER_EFFECTIVE_PERMISSIONS: &str = "UserEffectivePermissions";
    pub const USER_EFFECTIVE_PERMISSIONS_DISPLAY_NAME: &str = "UserEffectivePermissionsDisplayName";
    pub const USER_HAS_SUFFICIENT_PERMISSIONS: &str = "UserHasSufficientPermissions";
}

/// Shared variable holding the last client assertion handed to the OAuth client.
pub const CLIENT_ASSERTION_VARIABLE: &str = "ClientAssertion";

/// Value of a named parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    String(String),
    Guid(Uuid),
    Strings(Vec<String>),
    OptionSet(i32),
    EntityReference(EntityReference),
    Record(Record),
    Records(Vec<Record>),
    Json(serde_json::Value),
}

pub type Parameters = BTreeMap<String, ParameterValue>;

pub struct ExecutionContext {
    pub tenant_id: Uuid,
    /// `systemuser` id of the caller.
    pub user_id: Uuid,
    pub user_aad_object_id: Uuid,
    pub business_unit_id: Uuid,
    pub is_application_user: bool,
    pub primary_entity: Option<EntityReference>,
    /// Plugin step the invocation runs under.
    pub owning_extension: Option<EntityReference>,
    pub inputs: Parameters,
    pub outputs: Parameters,
    pub shared_variables: Parameters,
    trace: Arc<dyn TraceSink>,
}

impl core::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("user_aad_object_id", &self.user_aad_object_id)
            .field("business_unit_id", &self.business_unit_id)
            .field("is_application_user", &self.is_application_user)
            .field("primary_entity", &self.primary_entity)
            .field("owning_extension", &self.owning_extension)
            .field("inputs", &self.inputs.keys().collect::<Vec<_>>())
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new(tenant_id: Uuid, user_id: Uuid) -> Self {
        Self {
            tenant_id,
            user_id,
            user_aad_object_id: Uuid::nil(),
            business_unit_id: Uuid::nil(),
            is_application_user: false,
            primary_entity: None,
            owning_extension: None,
            inputs: Parameters::new(),
            outputs: Parameters::new(),
            shared_variables: Parameters::new(),
            trace: Arc::new(TracingSink),
        }
    }

    pub fn with_input(mut self, name: &str, value: ParameterValue) -> Self {
        self.inputs.insert(name.to_string(), value);
        self
    }

    pub fn with_user_aad_object_id(mut self, id: Uuid) -> Self {
        self.user_aad_object_id = id;
        self
    }

    pub fn with_business_unit(mut self, id: Uuid) -> Self {
        self.business_unit_id = id;
        self
    }

    pub fn with_application_user(mut self, is_application_user: bool) -> Self {
        self.is_application_user = is_application_user;
        self
    }

    pub fn with_primary_entity(mut self, entity: EntityReference) -> Self {
        self.primary_entity = Some(entity);
        self
    }

    pub fn with_owning_extension(mut self, step: EntityReference) -> Self {
        self.owning_extension = Some(step);
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace = sink;
        self
    }

    pub fn trace(&self, message: &str) {
        self.trace.trace(message);
    }

    pub fn trace_sink(&self) -> &dyn TraceSink {
        self.trace.as_ref()
    }

    /// Primary entity id when the invocation is bound to a record of `logical_name`.
    pub fn primary_entity_of(&self, logical_name: &str) -> Option<Uuid> {
        self.primary_entity
            .as_ref()
            .filter(|e| e.is_entity(logical_name) && !e.id.is_nil())
            .map(|e| e.id)
    }

    pub fn input(&self, name: &str) -> Option<&ParameterValue> {
        self.inputs.get(name)
    }

    /// Non-empty string input.
    pub fn input_str(&self, name: &str) -> Option<&str> {
        match self.input(name)? {
            ParameterValue::String(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// GUID input, given either as a GUID or as its string form.
    pub fn input_guid(&self, name: &str) -> Option<Uuid> {
        match self.input(name)? {
            ParameterValue::Guid(id) => Some(*id),
            ParameterValue::String(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    pub fn input_strings(&self, name: &str) -> Vec<String> {
        match self.input(name) {
            Some(ParameterValue::Strings(values)) => values.clone(),
            Some(ParameterValue::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn output(&self, name: &str) -> Option<&ParameterValue> {
        self.outputs.get(name)
    }

    pub fn set_output(&mut self, name: &str, value: ParameterValue) {
        self.outputs.insert(name.to_string(), value);
    }

    pub fn output_str(&self, name: &str) -> Option<&str> {
        match self.output(name)? {
            ParameterValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn output_guid(&self, name: &str) -> Option<Uuid> {
        match self.output(name)? {
            ParameterValue::Guid(id) if !id.is_nil() => Some(*id),
            _ => None,
        }
    }

    pub fn output_record(&self, name: &str) -> Option<&Record> {
        match self.output(name)? {
            ParameterValue::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn output_records(&self, name: &str) -> Option<&[Record]> {
        match self.output(name)? {
            ParameterValue::Records(r) => Some(r.as_slice()),
            _ => None,
        }
    }

    pub fn shared_str(&self, name: &str) -> Option<&str> {
        match self.shared_variables.get(name)? {
            ParameterValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}
