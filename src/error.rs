// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error kinds surfaced to the plugin host.
//!
//! Validation and authorization failures are classified so the host can map
//! them to a status code. Anything unexpected from a lower layer is carried as
//! [`BrokerError::Failure`] with its message chain preserved.

use std::collections::BTreeMap;

/// Extra key/value context attached to an error, e.g. OAuth service data.
pub type Details = BTreeMap<String, String>;

pub type Result<T> = core::result::Result<T, BrokerError>;

/// Classification of a [`BrokerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    Forbidden,
    NotFound,
    InternalServerError,
    Failure,
}

#[derive(Debug)]
pub enum BrokerError {
    /// Missing or invalid input.
    BadRequest(String),
    /// Authorization failure or insufficient Key Vault permissions.
    Forbidden { message: String, details: Details },
    /// A Key Vault, role or other resource could not be discovered.
    NotFound(String),
    /// A required collaborator service is unavailable.
    InternalServerError(String),
    /// Unexpected lower-layer error.
    Failure(anyhow::Error),
}

impl BrokerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        BrokerError::BadRequest(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        BrokerError::Forbidden {
            message: message.into(),
            details: Details::new(),
        }
    }

    pub fn forbidden_with_details(message: impl Into<String>, details: Details) -> Self {
        BrokerError::Forbidden {
            message: message.into(),
            details,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        BrokerError::NotFound(message.into())
    }

    /// A collaborator the current operation needs was not injected.
    pub fn unavailable(service: &str) -> Self {
        BrokerError::InternalServerError(format!("{service} instance is not available."))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::BadRequest(_) => ErrorKind::BadRequest,
            BrokerError::Forbidden { .. } => ErrorKind::Forbidden,
            BrokerError::NotFound(_) => ErrorKind::NotFound,
            BrokerError::InternalServerError(_) => ErrorKind::InternalServerError,
            BrokerError::Failure(_) => ErrorKind::Failure,
        }
    }

    /// HTTP-style status the host reports for this error.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::BadRequest => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::InternalServerError | ErrorKind::Failure => 500,
        }
    }

    pub fn details(&self) -> Option<&Details> {
        match self {
            BrokerError::Forbidden { details, .. } => Some(details),
            _ => None,
        }
    }

    /// Messages of this error and its causes, innermost first.
    pub fn chain_innermost_first(&self) -> Vec<String> {
        match self {
            BrokerError::Failure(err) => {
                let mut messages: Vec<String> = err.chain().map(|e| e.to_string()).collect();
                messages.reverse();
                messages
            }
            other => vec![other.to_string()],
        }
    }
}

impl core::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            BrokerError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            BrokerError::Forbidden { message, .. } => write!(f, "Forbidden: {}", message),
            BrokerError::NotFound(msg) => write!(f, "Not found: {}", msg),
            BrokerError::InternalServerError(msg) => write!(f, "Internal server error: {}", msg),
            BrokerError::Failure(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Failure(err) => err.source(),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for BrokerError {
    fn from(err: anyhow::Error) -> Self {
        BrokerError::Failure(err)
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Failure(err.into())
    }
}
