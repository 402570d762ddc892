//! API key registry for the authenticating gateway.
//!
//! Keys live in external configuration (a JSON document) so they can be added
//! or rotated without rebuilding. Several keys may share a name, which lets a
//! caller hold an old and a new key during rotation.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Scope entry granting every route family
pub const ANY_SCOPE: &str = "*";

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKey {
    pub name: String,
    pub key: String,
    /// Route families this key may use, e.g. `processes`, `jobs`
    pub scope: HashSet<String>,
}

impl ApiKey {
    pub fn allows(&self, family: &str) -> bool {
        self.scope.contains(ANY_SCOPE) || self.scope.contains(family)
    }
}

#[derive(Debug, Deserialize)]
struct KeyFile {
    keys: Vec<ApiKey>,
}

#[derive(Debug, Error)]
pub enum KeyRegistryError {
    #[error("failed to read key file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("key for {0} is empty")]
    EmptyKey(String),

    #[error("key registered twice (second holder: {0})")]
    DuplicateKey(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("invalid credential")]
    Invalid,

    #[error("credential {name} is not authorized for {family}")]
    OutOfScope { name: String, family: String },
}

/// Mapping from credential to its scope
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: HashMap<String, ApiKey>,
}

impl KeyRegistry {
    /// Parse `{"keys": [{"name": ..., "key": ..., "scope": [...]}]}`
    pub fn from_json(document: &str) -> Result<Self, KeyRegistryError> {
        let file: KeyFile = serde_json::from_str(document)?;
        let mut keys = HashMap::new();
        for api_key in file.keys {
            if api_key.key.trim().is_empty() {
                return Err(KeyRegistryError::EmptyKey(api_key.name));
            }
            let name = api_key.name.clone();
            if keys.insert(api_key.key.clone(), api_key).is_some() {
                return Err(KeyRegistryError::DuplicateKey(name));
            }
        }
        Ok(Self { keys })
    }

    pub fn from_file(path: &Path) -> Result<Self, KeyRegistryError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json(&document)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Check a presented credential against the route family being accessed
    pub fn authorize(&self, presented: Option<&str>, family: &str) -> Result<&ApiKey, AuthError> {
        let presented = presented.filter(|k| !k.is_empty()).ok_or(AuthError::Missing)?;
        let api_key = self.keys.get(presented).ok_or(AuthError::Invalid)?;
        if !api_key.allows(family) {
            return Err(AuthError::OutOfScope {
                name: api_key.name.clone(),
                family: family.to_string(),
            });
        }
        Ok(api_key)
    }
}

/// The `key` query parameter, if present
pub fn credential_from_query(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == "key")
        .map(|(_, value)| value.into_owned())
}
