//! Secrets configuration loaded from environment variables only.
//!
//! This module handles sensitive configuration like API keys that should
//! never be stored in files. All secrets are read from environment variables.

use std::env;

pub const EMBEDDING_API_KEY_ENV: &str = "KMEM_EMBEDDING_API_KEY";

/// Secrets loaded exclusively from environment variables.
#[derive(Clone, Default)]
pub struct Secrets {
    /// Bearer token for the embedding endpoint (env: KMEM_EMBEDDING_API_KEY)
    pub embedding_api_key: Option<String>,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field(
                "embedding_api_key",
                &self.embedding_api_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Errors that can occur when loading secrets
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Secret {0} is set but empty")]
    EmptySecret(&'static str),
}

impl Secrets {
    /// Load secrets from environment variables.
    ///
    /// This function also loads .env file if present (for development),
    /// but production should rely on actual environment variables.
    pub fn from_env() -> Result<Self, SecretsError> {
        let _ = dotenvy::dotenv();

        Self::from_env_inner()
    }

    /// Internal method to load from environment without loading .env
    pub(crate) fn from_env_inner() -> Result<Self, SecretsError> {
        let embedding_api_key = match env::var(EMBEDDING_API_KEY_ENV) {
            Ok(value) if value.trim().is_empty() => {
                return Err(SecretsError::EmptySecret(EMBEDDING_API_KEY_ENV));
            }
            Ok(value) => Some(value),
            Err(_) => None,
        };

        Ok(Self { embedding_api_key })
    }
}
