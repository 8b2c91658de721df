//! Secret references of the form `PROVIDER#KEY`.
//!
//! Configuration values naming credentials are resolved through a registry
//! of providers. `CLEAR` returns the key literally and `ENV` reads the
//! process environment; further providers can be registered by id.

use crate::error::{DpoError, Result};
use std::collections::HashMap;
use std::sync::Arc;

pub trait SecretProvider: Send + Sync {
    fn get_secret(&self, key: &str) -> Result<String>;
}

/// Returns the key itself, for values kept in the configuration.
pub struct ClearTextProvider;

impl SecretProvider for ClearTextProvider {
    fn get_secret(&self, key: &str) -> Result<String> {
        Ok(key.to_string())
    }
}

/// Reads the process environment.
pub struct EnvProvider;

impl SecretProvider for EnvProvider {
    fn get_secret(&self, key: &str) -> Result<String> {
        std::env::var(key)
            .map_err(|_| DpoError::config(format!("environment variable '{}' is not set", key)))
    }
}

pub struct SecretRegistry {
    providers: HashMap<String, Arc<dyn SecretProvider>>,
}

impl Default for SecretRegistry {
    fn default() -> Self {
        let mut providers: HashMap<String, Arc<dyn SecretProvider>> = HashMap::new();
        providers.insert("CLEAR".to_string(), Arc::new(ClearTextProvider));
        providers.insert("ENV".to_string(), Arc::new(EnvProvider));
        Self { providers }
    }
}

impl SecretRegistry {
    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn SecretProvider>) {
        self.providers.insert(id.into(), provider);
    }

    /// Resolves `PROVIDER#KEY` references. Values without a `#` are
    /// returned unchanged.
    pub fn resolve(&self, value: &str) -> Result<String> {
        let Some((provider_id, key)) = value.split_once('#') else {
            return Ok(value.to_string());
        };
        let provider = self.providers.get(provider_id).ok_or_else(|| {
            DpoError::config(format!("unknown secret provider '{}'", provider_id))
        })?;
        provider.get_secret(key)
    }
}
