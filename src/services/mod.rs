//! Provider seams. The controller only ever talks to these traits; concrete
//! clients (hosted store, image API binding, the local-only variant, test
//! fakes) are injected by the shell rather than reached through globals.

mod local;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use local::{LocalAccountService, LocalProjectStore};

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::watch;

use crate::model::{AspectRatio, Image, ImageId, ImagePayload, Project, ProjectId, User};
use crate::{AppError, ErrorKind};

// --- Image provider ---

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("request blocked for safety reasons ({reason}): {}", categories.join(", "))]
    SafetyBlocked {
        reason: String,
        categories: Vec<String>,
    },

    #[error("the image API requires an active billing account")]
    BillingRequired,

    #[error("image provider rejected the API credential: {0}")]
    InvalidCredentials(String),

    #[error("the provider returned no image")]
    Empty,

    #[error("image provider unavailable: {0}")]
    Unavailable(String),

    #[error("image provider error: {0}")]
    Other(String),
}

impl From<ProviderError> for AppError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::SafetyBlocked { reason, categories } => {
                let mut message = format!("Your request was blocked for safety reasons ({reason}).");
                if !categories.is_empty() {
                    message.push_str(&format!(" Detected categories: {}.", categories.join(", ")));
                }
                message.push_str(" Please adjust your prompt and try again.");
                AppError::new(ErrorKind::SafetyBlocked, message)
                    .with_context("block_reason", reason)
            }
            ProviderError::BillingRequired => AppError::new(
                ErrorKind::Provider,
                "The image API requires an active billing account. Enable billing on the \
                 provider project to use this feature.",
            ),
            ProviderError::InvalidCredentials(detail) => AppError::new(
                ErrorKind::Configuration,
                format!(
                    "Authentication with the image provider failed ({detail}). Verify that \
                     {} is set to a valid key and that the API is enabled.",
                    crate::config::ENV_API_KEY
                ),
            ),
            ProviderError::Empty => AppError::new(
                ErrorKind::Provider,
                "The API returned no image. This may be due to safety filters or a vague \
                 prompt. Try being more descriptive.",
            ),
            ProviderError::Unavailable(detail) | ProviderError::Other(detail) => {
                AppError::new(ErrorKind::Provider, format!("Image request failed. Detail: {detail}"))
            }
        }
    }
}

/// The remote image generation/editing/enhancement function, treated as a
/// black box returning encoded image bytes or an error.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Produces `count` images of `aspect_ratio` from a text prompt.
    async fn generate(
        &self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        count: u8,
    ) -> Result<Vec<ImagePayload>, ProviderError>;

    /// Produces exactly one image from a prompt plus reference payloads.
    async fn edit(
        &self,
        prompt: &str,
        references: &[ImagePayload],
    ) -> Result<ImagePayload, ProviderError>;

    /// Produces an enhanced variant of an existing image.
    async fn enhance(&self, source: &ImagePayload) -> Result<ImagePayload, ProviderError>;
}

// --- Account service ---

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("an account with this email already exists")]
    EmailTaken,

    #[error("session expired")]
    SessionExpired,

    #[error("account backend failure: {0}")]
    Backend(String),
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        let kind = match &e {
            AuthError::EmailTaken => ErrorKind::Validation,
            AuthError::Backend(_) => ErrorKind::Storage,
            _ => ErrorKind::Auth,
        };
        let message = match &e {
            AuthError::InvalidCredentials => "Invalid email or password.".to_string(),
            AuthError::EmailTaken => "An account with this email already exists.".to_string(),
            _ => e.to_string(),
        };
        AppError::new(kind, message)
    }
}

/// Credential verification and session issuance.
///
/// `subscribe` yields a watch channel that fires on any session change
/// (login, logout, login elsewhere) so the bootstrap state machine can react
/// asynchronously.
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn signup(
        &self,
        username: &str,
        email: &str,
        password: SecretString,
        photo_url: Option<String>,
    ) -> Result<User, AuthError>;

    async fn login(&self, email: &str, password: SecretString) -> Result<User, AuthError>;

    async fn logout(&self) -> Result<(), AuthError>;

    async fn current_user(&self) -> Result<Option<User>, AuthError>;

    fn subscribe(&self) -> watch::Receiver<Option<User>>;
}

// --- Project store ---

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store's per-user access policy rejected the operation. Surfaced
    /// as its own class: the fix is configuration, not retry.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("could not reach the data store: {0}")]
    Connection(String),

    #[error("store quota exceeded")]
    QuotaExceeded,

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PermissionDenied(detail) => AppError::new(ErrorKind::Permission, detail),
            StoreError::NotFound(what) => AppError::new(ErrorKind::NotFound, what),
            StoreError::Connection(detail) => {
                AppError::new(ErrorKind::Storage, format!("could not reach the data store: {detail}"))
                    .with_context("cause", "connection")
            }
            StoreError::QuotaExceeded => {
                AppError::new(ErrorKind::Storage, "store quota exceeded")
            }
            StoreError::Backend(detail) => AppError::new(ErrorKind::Storage, detail),
        }
    }
}

impl From<crate::storage::StorageError> for StoreError {
    fn from(e: crate::storage::StorageError) -> Self {
        match e {
            crate::storage::StorageError::QuotaExceeded { .. } => StoreError::QuotaExceeded,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Per-user CRUD over `Project` and `Image` records. Every row is scoped to
/// the owning user; implementations enforce that scoping themselves.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn fetch_projects(&self, owner: &User) -> Result<Vec<Project>, StoreError>;

    async fn insert_project(&self, owner: &User, project: &Project) -> Result<(), StoreError>;

    async fn rename_project(
        &self,
        owner: &User,
        id: &ProjectId,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn delete_project(&self, owner: &User, id: &ProjectId) -> Result<(), StoreError>;

    /// Prepends `images` (newest first) to the given project.
    async fn insert_images(
        &self,
        owner: &User,
        project: &ProjectId,
        images: &[Image],
    ) -> Result<(), StoreError>;

    /// Replaces the stored record matching `image.id`.
    async fn update_image(&self, owner: &User, image: &Image) -> Result<(), StoreError>;

    async fn delete_image(&self, owner: &User, id: &ImageId) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_block_carries_reason_and_categories() {
        let err = ProviderError::SafetyBlocked {
            reason: "SAFETY".into(),
            categories: vec!["VIOLENCE".into(), "HATE".into()],
        };
        let app: AppError = err.into();
        assert_eq!(app.kind, ErrorKind::SafetyBlocked);
        assert!(app.message.contains("SAFETY"));
        assert!(app.message.contains("VIOLENCE, HATE"));
        assert!(app.message.contains("adjust your prompt"));
    }

    #[test]
    fn invalid_provider_credentials_route_to_configuration() {
        let app: AppError = ProviderError::InvalidCredentials("API key not valid".into()).into();
        assert_eq!(app.kind, ErrorKind::Configuration);
        assert!(app.message.contains(crate::config::ENV_API_KEY));
    }

    #[test]
    fn permission_denied_is_a_distinct_class() {
        let app: AppError = StoreError::PermissionDenied("policy on table images".into()).into();
        assert_eq!(app.kind, ErrorKind::Permission);
        assert!(app.user_facing_message().contains("access policy"));
    }

    #[test]
    fn connection_failures_are_marked() {
        let app: AppError = StoreError::Connection("dns".into()).into();
        assert_eq!(app.kind, ErrorKind::Storage);
        assert_eq!(app.context.get("cause").map(String::as_str), Some("connection"));
    }

    #[test]
    fn email_taken_is_local_validation() {
        let app: AppError = AuthError::EmailTaken.into();
        assert_eq!(app.kind, ErrorKind::Validation);
    }
}
