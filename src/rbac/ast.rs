// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Azure RBAC model
//!
//! Role definitions, role assignments and deny assignments as listed by Azure
//! Resource Manager for a Key Vault object scope. Only the parts that take part
//! in data-plane permission evaluation are kept.

use serde::{Deserialize, Serialize};

/// Role definition - defines what actions can be performed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDefinition {
    /// Full ARM resource id of the definition.
    pub id: String,
    /// Display name, e.g. `Key Vault Secrets User`.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub role_type: RoleType,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// Role type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleType {
    BuiltInRole,
    CustomRole,
}

impl RoleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleType::BuiltInRole => "BuiltInRole",
            RoleType::CustomRole => "CustomRole",
        }
    }
}

/// Permission set - defines actions that are allowed/denied
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Permission {
    pub actions: Vec<String>,
    pub not_actions: Vec<String>,
    pub data_actions: Vec<String>,
    pub not_data_actions: Vec<String>,
}

/// Role assignment - assigns a role to a principal at a scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub id: String,
    pub principal_id: String,
    pub role_definition_id: String,
    pub scope: String,
}

/// Deny assignment - blocks the listed data actions for its principals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DenyAssignment {
    pub id: String,
    pub name: String,
    pub scope: String,
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// What a role bucket records about a classified role definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSummary {
    pub resource_id: String,
    pub name: String,
    pub description: Option<String>,
    pub role_type: RoleType,
}

impl From<&RoleDefinition> for RoleSummary {
    fn from(role: &RoleDefinition) -> Self {
        Self {
            resource_id: role.id.clone(),
            name: role.name.clone(),
            description: role.description.clone(),
            role_type: role.role_type,
        }
    }
}
