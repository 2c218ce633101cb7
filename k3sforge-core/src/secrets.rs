//! Secret handling
//!
//! Two kinds of sensitive values flow through a run: the SSH private keys
//! that open each host (resolved through a [`SecretProvider`]) and the
//! join token and kubeconfig the master hands back ([`SecretBundle`]).
//! Both stay wrapped in [`Secret`] so they render as `[REDACTED]`.

use crate::error::{ProvisionError, ProvisionResult};
use k3sforge_common::Secret;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Private key material bound to one host
#[derive(Debug, Clone)]
pub struct Credential {
    host_name: String,
    private_key: Secret<String>,
}

impl Credential {
    pub fn new(host_name: impl Into<String>, private_key: Secret<String>) -> Self {
        Self {
            host_name: host_name.into(),
            private_key,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn private_key(&self) -> &Secret<String> {
        &self.private_key
    }
}

/// Resolves the credential for a host name
pub trait SecretProvider: Send + Sync {
    /// Where the provider looks for a host's secret, for error messages
    fn describe(&self, host_name: &str) -> String;

    fn lookup(&self, host_name: &str) -> Option<Secret<String>>;

    fn resolve(&self, host_name: &str) -> ProvisionResult<Credential> {
        match self.lookup(host_name) {
            Some(key) if !key.is_empty() => Ok(Credential::new(host_name, key)),
            _ => Err(ProvisionError::Configuration(format!(
                "No credential for host '{}' ({} is not set)",
                host_name,
                self.describe(host_name)
            ))),
        }
    }
}

/// Environment variable holding a host's private key: `MAC-1` -> `MAC_1_PRIVATE_KEY`
pub fn credential_env_var(host_name: &str) -> String {
    format!("{}_PRIVATE_KEY", host_name.to_uppercase().replace('-', "_"))
}

/// Reads `<UPPERCASED_HOST_NAME>_PRIVATE_KEY` from the process environment
#[derive(Debug, Clone, Default)]
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn describe(&self, host_name: &str) -> String {
        format!("environment variable {}", credential_env_var(host_name))
    }

    fn lookup(&self, host_name: &str) -> Option<Secret<String>> {
        std::env::var(credential_env_var(host_name))
            .ok()
            .map(Secret::new)
    }
}

/// Map-backed provider for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticSecretProvider {
    keys: HashMap<String, Secret<String>>,
}

impl StaticSecretProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, host_name: &str, key: &str) -> Self {
        self.keys
            .insert(host_name.to_string(), Secret::new(key.to_string()));
        self
    }
}

impl SecretProvider for StaticSecretProvider {
    fn describe(&self, host_name: &str) -> String {
        format!("static key for '{}'", host_name)
    }

    fn lookup(&self, host_name: &str) -> Option<Secret<String>> {
        self.keys.get(host_name).cloned()
    }
}

/// Values produced by the master that workers and callers consume
#[derive(Debug, Clone, Serialize)]
pub struct SecretBundle {
    /// Address workers join through; not secret
    pub ip: String,
    pub token: Secret<String>,
    pub kubeconfig: Secret<String>,
}

/// The subset of the bundle a worker needs to join
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub master_ip: String,
    pub token: Secret<String>,
}

impl SecretBundle {
    pub fn join_info(&self) -> JoinInfo {
        JoinInfo {
            master_ip: self.ip.clone(),
            token: self.token.clone(),
        }
    }
}

/// Wire shape of the master's create-script stdout
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MasterPayload {
    pub ip: String,
    pub token: Secret<String>,
    pub kubeconfig: Secret<String>,
}

impl From<MasterPayload> for SecretBundle {
    fn from(payload: MasterPayload) -> Self {
        Self {
            ip: payload.ip,
            token: payload.token,
            kubeconfig: payload.kubeconfig,
        }
    }
}
