// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Azure Resource Manager resource identifiers.
//!
//! Only the parts the broker needs: parsing, walking to the parent resource,
//! and reading the resource type and name. Comparison ignores case, as ARM
//! does.

use crate::error::{BrokerError, Result};

use core::hash::{Hash, Hasher};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone)]
pub struct ResourceId {
    segments: Vec<String>,
}

impl ResourceId {
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || {
            BrokerError::bad_request(format!(
                "'{input}' is not a valid Azure Resource Manager resource identifier."
            ))
        };

        if !input.starts_with('/') {
            return Err(invalid());
        }
        let segments: Vec<String> = input
            .trim_matches('/')
            .split('/')
            .map(|s| s.to_string())
            .collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid());
        }

        let id = Self { segments };
        match id.providers_index() {
            Some(p) => {
                // providers/{namespace}/{type}/{name}[/{type}/{name}...]
                let tail = id.segments.len() - p - 2;
                if p % 2 != 0 || tail < 2 || tail % 2 != 0 {
                    return Err(invalid());
                }
            }
            None => {
                if id.segments.len() % 2 != 0 {
                    return Err(invalid());
                }
            }
        }
        Ok(id)
    }

    fn providers_index(&self) -> Option<usize> {
        self.segments
            .iter()
            .rposition(|s| s.eq_ignore_ascii_case("providers"))
            .filter(|p| p + 1 < self.segments.len())
    }

    /// Name of the resource, i.e. the last segment.
    pub fn name(&self) -> &str {
        self.segments.last().map(|s| s.as_str()).unwrap_or_default()
    }

    /// Fully qualified type such as `Microsoft.KeyVault/vaults/secrets`.
    pub fn resource_type(&self) -> String {
        match self.providers_index() {
            Some(p) => {
                let mut parts = vec![self.segments[p + 1].as_str()];
                parts.extend(
                    self.segments[p + 2..]
                        .iter()
                        .step_by(2)
                        .map(|s| s.as_str()),
                );
                parts.join("/")
            }
            None => {
                let kind = &self.segments[self.segments.len() - 2];
                format!("Microsoft.Resources/{}", kind)
            }
        }
    }

    /// The enclosing resource or scope, `None` at the root.
    pub fn parent(&self) -> Option<ResourceId> {
        let len = self.segments.len();
        let keep = match self.providers_index() {
            Some(p) if len - p - 2 > 2 => len - 2,
            Some(p) => p,
            None => len - 2,
        };
        if keep == 0 {
            return None;
        }
        Some(ResourceId {
            segments: self.segments[..keep].to_vec(),
        })
    }

    /// Append a child `{type}/{name}` pair.
    pub fn child(&self, resource_type: &str, name: &str) -> Result<ResourceId> {
        ResourceId::parse(&format!("{}/{}/{}", self, resource_type, name))
    }

    /// Walk up from this resource until one of the given types is found.
    pub fn ancestor_of_type(&self, types: &[&str]) -> Option<ResourceId> {
        let mut current = Some(self.clone());
        while let Some(id) = current {
            let ty = id.resource_type();
            if types.iter().any(|t| t.eq_ignore_ascii_case(&ty)) {
                return Some(id);
            }
            current = id.parent();
        }
        None
    }
}

impl core::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

impl core::str::FromStr for ResourceId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self> {
        ResourceId::parse(s)
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for ResourceId {}

impl Hash for ResourceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for segment in &self.segments {
            segment.to_ascii_lowercase().hash(state);
        }
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ResourceId::parse(&s).map_err(serde::de::Error::custom)
    }
}
