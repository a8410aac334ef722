//! Shared application core for the Studio AI image suite.
//!
//! The crate owns the signed-in user's project/image graph and mediates every
//! mutation against pluggable providers: an image generation service and a
//! project store (remote-backed or local-only). Shells render [`model::StudioModel`]
//! and dispatch intents into [`controller::StudioController`].

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod model;
pub mod services;
pub mod storage;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use controller::StudioController;
pub use model::StudioModel;

/// Name given to a user's very first project.
pub const DEFAULT_FIRST_PROJECT_NAME: &str = "My First Project";
/// Name given to the project synthesized when migrating a legacy flat image list.
pub const MIGRATED_PROJECT_NAME: &str = "Migrated Project";
/// Prefix for subsequently created default project names ("Project 2", ...).
pub const DEFAULT_PROJECT_NAME_PREFIX: &str = "Project ";

pub const MIN_IMAGES_PER_REQUEST: u8 = 1;
pub const MAX_IMAGES_PER_REQUEST: u8 = 4;
pub const MAX_PROMPT_CHARS: usize = 4096;
pub const MAX_PROJECT_NAME_CHARS: usize = 80;
pub const AUTO_NAME_MAX_WORDS: usize = 5;
pub const AUTO_NAME_MAX_CHARS: usize = 40;
pub const MAX_REFERENCE_IMAGES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A required credential or endpoint is missing or malformed. Not
    /// recoverable by retry; routes to the setup guidance screen.
    Configuration,
    /// Invalid credentials or an expired session. Routes back to login.
    Auth,
    /// The remote store's access policy rejected the operation.
    Permission,
    /// The image provider failed to generate, edit or enhance.
    Provider,
    /// The provider refused the request on content-safety grounds.
    SafetyBlocked,
    /// Local or remote persistence failed; optimistic changes roll back.
    Storage,
    /// Rejected locally before any remote call.
    Validation,
    /// A generation was requested with no project to receive the result.
    NoActiveProject,
    NotFound,
    Serialization,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Configuration => "CONFIG_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::Permission => "PERMISSION_DENIED",
            Self::Provider => "PROVIDER_ERROR",
            Self::SafetyBlocked => "SAFETY_BLOCKED",
            Self::Storage => "STORAGE_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::NoActiveProject => "NO_ACTIVE_PROJECT",
            Self::NotFound => "NOT_FOUND",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Storage => ErrorSeverity::Transient,

            Self::Auth
            | Self::Permission
            | Self::Provider
            | Self::SafetyBlocked
            | Self::Validation
            | Self::NoActiveProject
            | Self::NotFound => ErrorSeverity::Permanent,

            Self::Configuration | Self::Serialization | Self::Internal => ErrorSeverity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Storage)
    }
}

/// The single error type surfaced across the controller boundary.
///
/// Subsystem errors ([`services::ProviderError`], [`services::StoreError`],
/// [`storage::StorageError`], ...) convert into this before reaching a shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            // The message already enumerates the missing variables.
            ErrorKind::Configuration => self.message.clone(),
            ErrorKind::Auth => {
                "Your session has expired or your credentials are invalid. Please sign in again."
                    .into()
            }
            ErrorKind::Permission => format!(
                "The data store rejected this action ({}). Check the project's row-level \
                 access policy in your store dashboard, then try again.",
                self.message
            ),
            // Keep the provider's detail so the user can adjust the prompt.
            ErrorKind::Provider | ErrorKind::SafetyBlocked => self.message.clone(),
            ErrorKind::Storage => {
                "Unable to save your changes. Free up storage space or try again.".into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NoActiveProject => {
                "Select or create a project before generating images.".into()
            }
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Serialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Internal => "An unexpected error occurred. Please try again.".into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

#[must_use]
pub fn get_current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Derives a project name from the first few words of a prompt.
///
/// Used exactly once per project: while it still carries a system-assigned
/// default name and holds zero images.
#[must_use]
pub fn derive_project_name(prompt: &str) -> String {
    let joined = prompt
        .split_whitespace()
        .take(AUTO_NAME_MAX_WORDS)
        .collect::<Vec<_>>()
        .join(" ");

    if joined.chars().count() <= AUTO_NAME_MAX_CHARS {
        return joined;
    }

    joined.chars().take(AUTO_NAME_MAX_CHARS).collect()
}
