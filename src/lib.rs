// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Access-token brokering for Dataverse plugins.
//!
//! The crate decides which credential source is authoritative for a token
//! request, whether the calling user may request a token for a different
//! application identity, and whether the user's Azure role assignments grant
//! the Key Vault data actions needed to use a secondary credential.
//!
//! Everything that talks to the outside world (the plugin host's record store,
//! Azure Resource Manager, the platform token services, the OAuth client) is
//! injected through the traits in [`services`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use dataverse_token_broker::*;
//!
//! let broker = TokenBroker::new(services, BrokerOptions::default());
//! let mut ctx = ExecutionContext::new(tenant_id, user_id)
//!     .with_input("ApplicationId", ParameterValue::Guid(app_id))
//!     .with_input("ResourceId", ParameterValue::String("https://graph.microsoft.com".into()));
//!
//! execute_plugin(&FederatedIdentityTokenPlugin, &broker, &mut ctx)?;
//! let token = ctx.output_str(output::ACCESS_TOKEN);
//! ```

pub mod context;
pub mod error;
pub mod identity;
pub mod keyvault;
pub mod options;
pub mod plugins;
pub mod rbac;
pub mod record;
pub mod resource_id;
pub mod selector;
pub mod services;
pub mod token;
pub mod trace;

pub use context::{output, ExecutionContext, ParameterValue, Parameters};
pub use error::{BrokerError, ErrorKind, Result};
pub use identity::{IdentityDescriptor, IdentityResolver, ManagedIdentityRecord};
pub use keyvault::{CredentialReference, KeyVaultObjectType, KeyVaultReferenceResolver};
pub use options::BrokerOptions;
pub use plugins::*;
pub use rbac::{
    action_matches, Capability, CapabilitySet, KeyVaultPermissionCheck, PermissionEvaluation,
    RbacParser, RoleBucket, RoleBuckets,
};
pub use record::{AttributeValue, EntityReference, Record};
pub use resource_id::ResourceId;
pub use selector::CredentialSourceSelector;
pub use services::BrokerServices;
pub use token::{AccessToken, DecodedJwt, TokenCache};

/// The long-lived entry point: owns the injected collaborators, the broker
/// options and the managed-identity token cache.
pub struct TokenBroker {
    services: BrokerServices,
    options: BrokerOptions,
    cache: TokenCache,
}

impl TokenBroker {
    pub fn new(services: BrokerServices, options: BrokerOptions) -> Self {
        let cache = TokenCache::new(options.token_refresh_skew())
            .with_fallback_lifetime(options.fallback_token_lifetime());
        Self {
            services,
            options,
            cache,
        }
    }

    pub fn services(&self) -> &BrokerServices {
        &self.services
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.cache
    }
}
