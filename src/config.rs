//! Deployment configuration, resolved once at startup.
//!
//! The image API key is mandatory. The hosted data store pair is optional
//! but atomic: set both `STUDIO_STORE_URL` and `STUDIO_STORE_ANON_KEY` for
//! the remote-backed variant, or neither for the local-only one. A half-set
//! pair is a configuration error, not a silent fallback.

use secrecy::SecretString;
use thiserror::Error;
use url::Url;

use crate::{AppError, ErrorKind};

pub const ENV_API_KEY: &str = "STUDIO_API_KEY";
pub const ENV_STORE_URL: &str = "STUDIO_STORE_URL";
pub const ENV_STORE_ANON_KEY: &str = "STUDIO_STORE_ANON_KEY";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    MissingVars(Vec<&'static str>),

    #[error("invalid store URL '{url}': {reason}")]
    InvalidStoreUrl { url: String, reason: String },
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        let message = match &e {
            ConfigError::MissingVars(vars) => format!(
                "The application is not configured. Set {} and restart. See the setup \
                 guide for where to obtain each value.",
                vars.join(" and ")
            ),
            ConfigError::InvalidStoreUrl { url, reason } => format!(
                "{ENV_STORE_URL} is set to '{url}', which is not a valid http(s) URL ({reason})."
            ),
        };
        AppError::new(ErrorKind::Configuration, message)
    }
}

/// Connection details for the hosted project store.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub url: Url,
    pub anon_key: SecretString,
}

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub api_key: SecretString,
    pub remote_store: Option<RemoteStoreConfig>,
}

impl StudioConfig {
    /// Reads configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which returns the raw value for
    /// a variable name or `None`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get(ENV_API_KEY);
        let store_url = get(ENV_STORE_URL);
        let store_anon_key = get(ENV_STORE_ANON_KEY);

        let mut missing = Vec::new();
        if api_key.is_none() {
            missing.push(ENV_API_KEY);
        }
        // Both-or-neither: flag whichever half of the pair is absent.
        if store_url.is_none() && store_anon_key.is_some() {
            missing.push(ENV_STORE_URL);
        }
        if store_url.is_some() && store_anon_key.is_none() {
            missing.push(ENV_STORE_ANON_KEY);
        }
        if !missing.is_empty() {
            return Err(ConfigError::MissingVars(missing));
        }

        let api_key = SecretString::new(api_key.unwrap_or_default());

        let remote_store = match (store_url, store_anon_key) {
            (Some(raw_url), Some(anon_key)) => {
                let url = Url::parse(&raw_url).map_err(|e| ConfigError::InvalidStoreUrl {
                    url: raw_url.clone(),
                    reason: e.to_string(),
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidStoreUrl {
                        url: raw_url,
                        reason: format!("unsupported scheme '{}'", url.scheme()),
                    });
                }
                Some(RemoteStoreConfig {
                    url,
                    anon_key: SecretString::new(anon_key),
                })
            }
            _ => None,
        };

        Ok(Self {
            api_key,
            remote_store,
        })
    }

    /// True when the hosted store pair is configured.
    #[must_use]
    pub fn is_remote_backed(&self) -> bool {
        self.remote_store.is_some()
    }
}
