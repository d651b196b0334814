// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK configuration.
//!
//! Every option is read from an identically-named environment variable
//! (upper-snake-cased, prefixed with `DISPATCH_`) and may be overridden
//! programmatically through the builder methods.

use std::env;
use std::fmt;

use crate::error::{Result, SdkError};

/// SDK configuration.
///
/// # Environment Variables
///
/// | Variable | Required | Description |
/// |----------|----------|-------------|
/// | `DISPATCH_ENDPOINT_URL` | Yes | Base URL of the scheduler |
/// | `DISPATCH_API_KEY` | For outbound calls | Bearer credential |
/// | `DISPATCH_VERIFICATION_KEY` | No | PEM public key for inbound request signatures |
/// | `DISPATCH_TRACE` | No | Dump frame state to stderr before each snapshot |
#[derive(Clone)]
pub struct Config {
    /// Base URL of the scheduler.
    pub endpoint_url: String,
    /// Bearer credential for outbound requests. Secret.
    pub api_key: String,
    /// PEM public key verifying inbound request signatures. When unset,
    /// verification is skipped; intended for local testing only. The key is
    /// consumed by the host HTTP adapter, the SDK only carries it.
    pub verification_key: Option<String>,
    /// Dump coroutine frame state to stderr before each snapshot.
    pub trace: bool,
}

impl Config {
    /// Build a configuration pointing at the given scheduler URL.
    pub fn new(endpoint_url: impl Into<String>) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            api_key: String::new(),
            verification_key: None,
            trace: false,
        }
    }

    /// Load configuration from `DISPATCH_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let endpoint_url = env::var("DISPATCH_ENDPOINT_URL")
            .map_err(|_| SdkError::Config("DISPATCH_ENDPOINT_URL is required".to_string()))?;

        let api_key = env::var("DISPATCH_API_KEY").unwrap_or_default();

        let verification_key = match env::var("DISPATCH_VERIFICATION_KEY") {
            Ok(key) if !key.is_empty() => {
                validate_verification_key(&key)?;
                Some(key)
            }
            _ => None,
        };

        let trace = env::var("DISPATCH_TRACE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            endpoint_url,
            api_key,
            verification_key,
            trace,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    pub fn with_verification_key(mut self, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        validate_verification_key(&key)?;
        self.verification_key = Some(key);
        Ok(self)
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("endpoint_url", &self.endpoint_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field(
                "verification_key",
                &self.verification_key.as_ref().map(|_| "***"),
            )
            .field("trace", &self.trace)
            .finish()
    }
}

fn validate_verification_key(key: &str) -> Result<()> {
    if !key.trim_start().starts_with("-----BEGIN") {
        return Err(SdkError::Config(
            "verification key must be a PEM-encoded public key".to_string(),
        ));
    }
    Ok(())
}
