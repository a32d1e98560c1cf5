// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Loosely typed Dataverse records and the logical names the broker reads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pointer to a record of a given entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReference {
    pub logical_name: String,
    pub id: Uuid,
}

impl EntityReference {
    pub fn new(logical_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            logical_name: logical_name.into(),
            id,
        }
    }

    pub fn is_entity(&self, logical_name: &str) -> bool {
        self.logical_name.eq_ignore_ascii_case(logical_name)
    }
}

/// Column value of a [`Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    String(String),
    Guid(Uuid),
    OptionSet(i32),
    EntityReference(EntityReference),
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::String(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::String(s)
    }
}

impl From<Uuid> for AttributeValue {
    fn from(id: Uuid) -> Self {
        AttributeValue::Guid(id)
    }
}

impl From<EntityReference> for AttributeValue {
    fn from(r: EntityReference) -> Self {
        AttributeValue::EntityReference(r)
    }
}

/// A record as returned by the record store: an entity name, an optional id
/// and the columns that were requested.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub logical_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Record {
    pub fn new(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with(mut self, name: &str, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<AttributeValue>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn is_entity(&self, logical_name: &str) -> bool {
        self.logical_name.eq_ignore_ascii_case(logical_name)
    }

    /// Non-empty string column.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(AttributeValue::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// GUID column; the nil GUID counts as absent. Strings holding a GUID are accepted.
    pub fn get_guid(&self, name: &str) -> Option<Uuid> {
        let id = match self.get(name)? {
            AttributeValue::Guid(id) => *id,
            AttributeValue::String(s) => Uuid::parse_str(s).ok()?,
            AttributeValue::EntityReference(r) => r.id,
            _ => return None,
        };
        (!id.is_nil()).then_some(id)
    }

    pub fn get_option_set(&self, name: &str) -> Option<i32> {
        match self.get(name)? {
            AttributeValue::OptionSet(v) => Some(*v),
            AttributeValue::Int(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_reference(&self, name: &str) -> Option<&EntityReference> {
        match self.get(name)? {
            AttributeValue::EntityReference(r) if !r.id.is_nil() => Some(r),
            _ => None,
        }
    }

    pub fn reference(&self) -> Option<EntityReference> {
        self.id
            .map(|id| EntityReference::new(self.logical_name.clone(), id))
    }
}

pub mod managed_identity {
    pub const ENTITY: &str = "managedidentity";
    pub const ID: &str = "managedidentityid";
    pub const TENANT_ID: &str = "tenantid";
    pub const TENANT_DOMAIN_NAME: &str = "tenantdomainname";
    pub const APPLICATION_ID: &str = "applicationid";
    pub const NAME: &str = "name";
    pub const CREDENTIAL_SOURCE: &str = "credentialsource";
    pub const KEY_VAULT_REFERENCE_ID: &str = "keyvaultreferenceid";
    pub const STATECODE: &str = "statecode";

    pub const CREDENTIAL_SOURCE_KEY_VAULT: i32 = 1;
    pub const STATECODE_ACTIVE: i32 = 0;

    pub const COLUMNS: &[&str] = &[
        ID,
        TENANT_ID,
        NAME,
        APPLICATION_ID,
        CREDENTIAL_SOURCE,
        KEY_VAULT_REFERENCE_ID,
        STATECODE,
    ];
}

pub mod key_vault_reference {
    pub const ENTITY: &str = "keyvaultreference";
    pub const ID: &str = "keyvaultreferenceid";
    pub const KEY_VAULT_URI: &str = "keyvaulturi";
    pub const KEY_NAME: &str = "keyname";
    pub const KEY_TYPE: &str = "keytype";
    pub const KEY_VERSION: &str = "keyversion";
    pub const RESOURCE_IDENTIFIER: &str = "resourceidentifier";
    pub const STATECODE: &str = "statecode";

    pub const COLUMNS: &[&str] = &[
        ID,
        KEY_VAULT_URI,
        KEY_NAME,
        KEY_TYPE,
        KEY_VERSION,
        RESOURCE_IDENTIFIER,
        STATECODE,
    ];
}

pub mod system_user {
    pub const ENTITY: &str = "systemuser";
    pub const APPLICATION_ID: &str = "applicationid";

    pub const COLUMNS: &[&str] = &[APPLICATION_ID];
}

pub mod plugin_step {
    pub const ENTITY: &str = "sdkmessageprocessingstep";
    pub const PLUGIN_TYPE_ID: &str = "plugintypeid";

    pub const COLUMNS: &[&str] = &[PLUGIN_TYPE_ID];
}

pub mod plugin_type {
    pub const ENTITY: &str = "plugintype";
    pub const PLUGIN_ASSEMBLY_ID: &str = "pluginassemblyid";

    pub const COLUMNS: &[&str] = &[PLUGIN_ASSEMBLY_ID];
}

pub mod plugin_assembly {
    pub const ENTITY: &str = "pluginassembly";
    pub const MANAGED_IDENTITY_ID: &str = "managedidentityid";
    pub const PACKAGE_ID: &str = "packageid";

    pub const COLUMNS: &[&str] = &[MANAGED_IDENTITY_ID, PACKAGE_ID];
}

pub mod plugin_package {
    pub const ENTITY: &str = "pluginpackage";
    pub const MANAGED_IDENTITY_ID: &str = "managedidentityid";

    pub const COLUMNS: &[&str] = &[MANAGED_IDENTITY_ID];
}
