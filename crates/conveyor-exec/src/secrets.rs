//! Secret resolution and masking.
//!
//! A [`SecretValue`] never prints its content through `Debug` or `Display`.
//! Resolved values travel to a step only as environment variables of the step
//! process, and [`SecretBindings::redact`] masks them in anything captured.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use conveyor_types::ConveyorError;

const MASK: &str = "****";

#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(MASK)
    }
}

/// Secrets bound for one step: environment variable name to value.
#[derive(Debug, Clone, Default)]
pub struct SecretBindings {
    bindings: Vec<(String, SecretValue)>,
}

impl SecretBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, env_name: impl Into<String>, value: SecretValue) {
        let env_name = env_name.into();
        self.bindings.retain(|(name, _)| *name != env_name);
        self.bindings.push((env_name, value));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|(name, _)| name.as_str())
    }

    /// `(name, value)` pairs for setting on the step process.
    pub fn iter_env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings
            .iter()
            .map(|(name, value)| (name.as_str(), value.expose()))
    }

    /// Replace every occurrence of a bound value with `****`.
    pub fn redact(&self, text: &str) -> String {
        let mut values: Vec<&str> = self
            .bindings
            .iter()
            .map(|(_, v)| v.expose())
            .filter(|v| !v.is_empty())
            .collect();
        // longest first, so a value containing another is masked whole
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut redacted = text.to_string();
        for value in values {
            if redacted.contains(value) {
                redacted = redacted.replace(value, MASK);
            }
        }
        redacted
    }
}

/// Looks up a credential by id.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> conveyor_types::Result<SecretValue>;
}

/// Resolves credential `registry-token` from `CONVEYOR_SECRET_REGISTRY_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecretResolver {
    prefix: String,
}

impl EnvSecretResolver {
    pub const DEFAULT_PREFIX: &'static str = "CONVEYOR_SECRET_";

    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, credential: &str) -> String {
        let suffix: String = credential
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl Default for EnvSecretResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, credential: &str) -> conveyor_types::Result<SecretValue> {
        std::env::var(self.variable_for(credential))
            .map(SecretValue::new)
            .map_err(|_| ConveyorError::SecretNotFound {
                credential: credential.to_string(),
            })
    }
}

/// Fixed in-memory credentials.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, SecretValue>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, credential: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(credential.into(), SecretValue::new(value));
        self
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve(&self, credential: &str) -> conveyor_types::Result<SecretValue> {
        self.secrets
            .get(credential)
            .cloned()
            .ok_or_else(|| ConveyorError::SecretNotFound {
                credential: credential.to_string(),
            })
    }
}
