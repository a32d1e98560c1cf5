// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Azure RBAC payload parser
//!
//! Accepts the JSON shapes Azure Resource Manager returns for role
//! definitions, role assignments and deny assignments: either the flat form or
//! the ARM envelope with a `properties` object, alone, as an array, or as a
//! list page with a `value` array.

use crate::error::BrokerError;
use crate::rbac::ast::*;

use serde_json::{Map, Value};

/// Error types for RBAC parsing
#[derive(Debug, Clone)]
pub enum RbacParseError {
    InvalidJson(String),
    MissingField(String),
    InvalidFieldType(String),
}

impl core::fmt::Display for RbacParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            RbacParseError::InvalidJson(msg) => write!(f, "Invalid JSON: {}", msg),
            RbacParseError::MissingField(field) => write!(f, "Missing required field: {}", field),
            RbacParseError::InvalidFieldType(field) => write!(f, "Invalid field type: {}", field),
        }
    }
}

impl std::error::Error for RbacParseError {}

impl From<RbacParseError> for BrokerError {
    fn from(err: RbacParseError) -> Self {
        BrokerError::Failure(anyhow::Error::new(err))
    }
}

/// RBAC payload parser
pub struct RbacParser;

impl RbacParser {
    /// Parse one or more role definitions from a JSON string
    pub fn parse_role_definitions(input: &str) -> Result<Vec<RoleDefinition>, RbacParseError> {
        let json = Self::parse_json(input)?;
        Self::items(&json, "roleDefinitions")?
            .into_iter()
            .map(Self::role_definition_from_value)
            .collect()
    }

    /// Parse one or more role assignments from a JSON string
    pub fn parse_role_assignments(input: &str) -> Result<Vec<RoleAssignment>, RbacParseError> {
        let json = Self::parse_json(input)?;
        Self::items(&json, "roleAssignments")?
            .into_iter()
            .map(Self::role_assignment_from_value)
            .collect()
    }

    /// Parse one or more deny assignments from a JSON string
    pub fn parse_deny_assignments(input: &str) -> Result<Vec<DenyAssignment>, RbacParseError> {
        let json = Self::parse_json(input)?;
        Self::items(&json, "denyAssignments")?
            .into_iter()
            .map(Self::deny_assignment_from_value)
            .collect()
    }

    fn parse_json(input: &str) -> Result<Value, RbacParseError> {
        serde_json::from_str(input).map_err(|e| RbacParseError::InvalidJson(e.to_string()))
    }

    /// A single object, an array of objects, or a list page `{ "value": [...] }`.
    fn items<'a>(json: &'a Value, what: &str) -> Result<Vec<&'a Value>, RbacParseError> {
        match json {
            Value::Array(items) => Ok(items.iter().collect()),
            Value::Object(obj) => match obj.get("value") {
                Some(Value::Array(items)) => Ok(items.iter().collect()),
                Some(_) => Err(RbacParseError::InvalidFieldType(format!("{} value", what))),
                None => Ok(vec![json]),
            },
            _ => Err(RbacParseError::InvalidFieldType(what.to_string())),
        }
    }

    /// Parse a single role definition
    pub fn role_definition_from_value(json: &Value) -> Result<RoleDefinition, RbacParseError> {
        let (obj, props) = Self::envelope(json, "role definition")?;

        let id = Self::required_str(obj, "id")?;

        // The envelope `name` is the definition GUID; the display name lives in `roleName`.
        let name = Self::optional_str(props, "roleName")
            .or_else(|| Self::optional_str(obj, "roleName"))
            .or_else(|| Self::optional_str(obj, "name"))
            .ok_or_else(|| RbacParseError::MissingField("roleName".to_string()))?;

        let description = Self::optional_str(props, "description");

        let role_type = Self::optional_str(props, "type")
            .or_else(|| Self::optional_str(props, "roleType"))
            .map(|s| match s.as_str() {
                "BuiltInRole" => RoleType::BuiltInRole,
                _ => RoleType::CustomRole,
            })
            .unwrap_or(RoleType::CustomRole);

        let permissions = match props.get("permissions") {
            Some(perms) => Self::parse_permissions(perms)?,
            None => Vec::new(),
        };

        Ok(RoleDefinition {
            id,
            name,
            description,
            role_type,
            permissions,
        })
    }

    /// Parse a single role assignment
    pub fn role_assignment_from_value(json: &Value) -> Result<RoleAssignment, RbacParseError> {
        let (obj, props) = Self::envelope(json, "role assignment")?;

        Ok(RoleAssignment {
            id: Self::required_str(obj, "id")?,
            principal_id: Self::required_str(props, "principalId")?,
            role_definition_id: Self::required_str(props, "roleDefinitionId")?,
            scope: Self::required_str(props, "scope")?,
        })
    }

    /// Parse a single deny assignment
    pub fn deny_assignment_from_value(json: &Value) -> Result<DenyAssignment, RbacParseError> {
        let (obj, props) = Self::envelope(json, "deny assignment")?;

        let name = Self::optional_str(props, "denyAssignmentName")
            .or_else(|| Self::optional_str(obj, "name"))
            .unwrap_or_default();

        let permissions = match props.get("permissions") {
            Some(perms) => Self::parse_permissions(perms)?,
            None => Vec::new(),
        };

        Ok(DenyAssignment {
            id: Self::required_str(obj, "id")?,
            name,
            scope: Self::optional_str(props, "scope").unwrap_or_default(),
            permissions,
        })
    }

    /// The object itself and its `properties` (or the object again for the flat form).
    fn envelope<'a>(
        json: &'a Value,
        what: &str,
    ) -> Result<(&'a Map<String, Value>, &'a Map<String, Value>), RbacParseError> {
        let obj = json
            .as_object()
            .ok_or_else(|| RbacParseError::InvalidFieldType(what.to_string()))?;
        let props = match obj.get("properties") {
            Some(Value::Object(props)) => props,
            Some(_) => {
                return Err(RbacParseError::InvalidFieldType(format!(
                    "{} properties",
                    what
                )))
            }
            None => obj,
        };
        Ok((obj, props))
    }

    /// Parse permissions array
    fn parse_permissions(json: &Value) -> Result<Vec<Permission>, RbacParseError> {
        let array = json
            .as_array()
            .ok_or_else(|| RbacParseError::InvalidFieldType("permissions".to_string()))?;

        array.iter().map(Self::parse_permission).collect()
    }

    /// Parse a single permission
    fn parse_permission(json: &Value) -> Result<Permission, RbacParseError> {
        let obj = json
            .as_object()
            .ok_or_else(|| RbacParseError::InvalidFieldType("permission".to_string()))?;

        Ok(Permission {
            actions: Self::string_array(obj, "actions")?,
            not_actions: Self::string_array(obj, "notActions")?,
            data_actions: Self::string_array(obj, "dataActions")?,
            not_data_actions: Self::string_array(obj, "notDataActions")?,
        })
    }

    /// Parse an optional array of strings
    fn string_array(
        obj: &Map<String, Value>,
        field_name: &str,
    ) -> Result<Vec<String>, RbacParseError> {
        let array = match obj.get(field_name) {
            None | Some(Value::Null) => return Ok(Vec::new()),
            Some(json) => json
                .as_array()
                .ok_or_else(|| RbacParseError::InvalidFieldType(field_name.to_string()))?,
        };

        array
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| RbacParseError::InvalidFieldType(format!("{} item", field_name)))
                    .map(|s| s.to_string())
            })
            .collect()
    }

    fn required_str(obj: &Map<String, Value>, field: &str) -> Result<String, RbacParseError> {
        obj.get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| RbacParseError::MissingField(field.to_string()))
    }

    fn optional_str(obj: &Map<String, Value>, field: &str) -> Option<String> {
        obj.get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}
