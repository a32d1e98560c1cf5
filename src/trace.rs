// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Request-scoped tracing.
//!
//! Each [`crate::ExecutionContext`] carries its own [`TraceSink`]; nothing here
//! is process-global. The default sink forwards to the `tracing` crate so hosts
//! that install a subscriber see plugin traces alongside the broker's own
//! diagnostics.

use crate::error::BrokerError;

use std::sync::Mutex;

/// Destination for plugin trace lines, supplied per invocation.
pub trait TraceSink: Send + Sync {
    fn trace(&self, message: &str);
}

/// Forwards trace lines to `tracing` at INFO level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn trace(&self, message: &str) {
        tracing::info!(target: "dataverse_token_broker::plugin", "{}", message);
    }
}

/// Buffers trace lines in memory, e.g. to hand them back to the host.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl TraceSink for MemorySink {
    fn trace(&self, message: &str) {
        match self.lines.lock() {
            Ok(mut lines) => lines.push(message.to_string()),
            Err(poisoned) => poisoned.into_inner().push(message.to_string()),
        }
    }
}

/// Trace every message in an error chain, innermost cause first.
pub fn trace_error(sink: &dyn TraceSink, operation: &str, error: &BrokerError) {
    for message in error.chain_innermost_first() {
        sink.trace(&format!("Unhandled during {}: {}", operation, message));
    }
}

/// Install a `tracing-subscriber` registry honouring `RUST_LOG`.
///
/// Hosts that already configure a global subscriber should not call this.
#[cfg(feature = "trace-init")]
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber may already be installed by the host or another test.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}
