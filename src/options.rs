// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::error::{BrokerError, Result};

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Audience used for federated client assertions unless a request overrides it.
pub const DEFAULT_ASSERTION_AUDIENCE: &str = "api://AzureADTokenExchange";

/// Privilege a caller needs to request tokens for another application identity.
pub const IMPERSONATION_PRIVILEGE: &str = "prvActOnBehalfOfAnotherUser";

/// Tunables of a [`crate::TokenBroker`].
///
/// All fields have defaults, so an empty JSON or YAML document is a valid
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct BrokerOptions {
    pub assertion_audience: String,
    pub authority_host: String,
    pub impersonation_privilege: String,
    pub key_vault_dns_suffix: String,
    /// Seconds before expiry at which a cached token is no longer handed out.
    pub token_refresh_skew_seconds: i64,
    /// Lifetime assumed for tokens whose expiry cannot be read.
    pub fallback_token_lifetime_seconds: i64,
    /// Role definition listings run once per filter, in this order.
    pub role_definition_filters: Vec<String>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            assertion_audience: DEFAULT_ASSERTION_AUDIENCE.to_string(),
            authority_host: "https://login.microsoftonline.com/".to_string(),
            impersonation_privilege: IMPERSONATION_PRIVILEGE.to_string(),
            key_vault_dns_suffix: "vault.azure.net".to_string(),
            token_refresh_skew_seconds: 5 * 60,
            fallback_token_lifetime_seconds: 60 * 60,
            role_definition_filters: vec![
                "type eq 'BuiltInRole'".to_string(),
                "type eq 'CustomRole'".to_string(),
            ],
        }
    }
}

impl BrokerOptions {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| BrokerError::bad_request(format!("Invalid broker options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    #[cfg(feature = "yaml")]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let options: Self = serde_yaml::from_str(yaml)
            .map_err(|e| BrokerError::bad_request(format!("Invalid broker options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_assertion_audience(mut self, audience: impl Into<String>) -> Self {
        self.assertion_audience = audience.into();
        self
    }

    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    pub fn with_token_refresh_skew_seconds(mut self, seconds: i64) -> Self {
        self.token_refresh_skew_seconds = seconds;
        self
    }

    pub fn token_refresh_skew(&self) -> Duration {
        Duration::seconds(self.token_refresh_skew_seconds)
    }

    pub fn fallback_token_lifetime(&self) -> Duration {
        Duration::seconds(self.fallback_token_lifetime_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.assertion_audience.trim().is_empty() {
            return Err(BrokerError::bad_request(
                "Broker option 'assertionAudience' must not be empty.",
            ));
        }
        if self.token_refresh_skew_seconds < 0 || self.fallback_token_lifetime_seconds <= 0 {
            return Err(BrokerError::bad_request(
                "Broker token lifetimes must be positive.",
            ));
        }
        if self.role_definition_filters.is_empty() {
            return Err(BrokerError::bad_request(
                "At least one role definition filter is required.",
            ));
        }
        Ok(())
    }
}
