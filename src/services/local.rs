//! Local-only deployment variant: accounts and the project graph live in the
//! on-device key/value store. Used when no remote store is configured; the
//! controller cannot tell the difference.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::model::{Image, ImageId, Project, ProjectId, User, UserId, DEFAULT_AVATAR_URL};
use crate::services::{AccountService, AuthError, ProjectStore, StoreError};
use crate::storage::{SessionCache, USERS_KEY};

/// A registered account. Only a salted digest of the password is kept.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct StoredCredential {
    user: User,
    salt: String,
    password_digest: String,
}

fn digest_password(salt: &[u8], password: &SecretString) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt);
    hasher.update(password.expose_secret().as_bytes());
    hasher.finalize()
}

fn verify_password(credential: &StoredCredential, password: &SecretString) -> bool {
    let Ok(salt) = BASE64.decode(&credential.salt) else {
        return false;
    };
    let Ok(stored) = BASE64.decode(&credential.password_digest) else {
        return false;
    };
    let Ok(stored) = <[u8; 32]>::try_from(stored) else {
        return false;
    };
    // blake3::Hash equality is constant-time.
    digest_password(&salt, password) == blake3::Hash::from(stored)
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// Account service backed by the local session cache.
pub struct LocalAccountService {
    cache: SessionCache,
    sessions: watch::Sender<Option<User>>,
}

impl LocalAccountService {
    #[must_use]
    pub fn new(cache: SessionCache) -> Self {
        let initial = cache.current_user();
        let (sessions, _) = watch::channel(initial);
        Self { cache, sessions }
    }

    fn load_credentials(&self) -> Vec<StoredCredential> {
        self.cache.load_raw(USERS_KEY).unwrap_or_default()
    }

    fn save_credentials(&self, credentials: &[StoredCredential]) -> Result<(), AuthError> {
        self.cache
            .save_raw(USERS_KEY, &credentials)
            .map_err(|e| AuthError::Backend(e.to_string()))
    }

    fn open_session(&self, user: &User) -> Result<(), AuthError> {
        self.cache
            .set_current_user(user)
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        self.sessions.send_replace(Some(user.clone()));
        Ok(())
    }
}

#[async_trait]
impl AccountService for LocalAccountService {
    async fn signup(
        &self,
        username: &str,
        email: &str,
        password: SecretString,
        photo_url: Option<String>,
    ) -> Result<User, AuthError> {
        let email = normalize_email(email);
        let mut credentials = self.load_credentials();
        if credentials.iter().any(|c| c.user.email == email) {
            return Err(AuthError::EmailTaken);
        }

        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = digest_password(&salt, &password);

        let user = User {
            id: UserId::generate(),
            username: username.trim().to_string(),
            email,
            photo_url: photo_url.unwrap_or_else(|| DEFAULT_AVATAR_URL.to_string()),
        };

        credentials.push(StoredCredential {
            user: user.clone(),
            salt: BASE64.encode(salt),
            password_digest: BASE64.encode(digest.as_bytes()),
        });
        self.save_credentials(&credentials)?;

        // Signup logs the new account in immediately.
        self.open_session(&user)?;
        debug!(user = %user.id, "account created");
        Ok(user)
    }

    async fn login(&self, email: &str, password: SecretString) -> Result<User, AuthError> {
        let email = normalize_email(email);
        let credentials = self.load_credentials();
        let credential = credentials
            .iter()
            .find(|c| c.user.email == email)
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(credential, &password) {
            return Err(AuthError::InvalidCredentials);
        }

        self.open_session(&credential.user)?;
        Ok(credential.user.clone())
    }

    async fn logout(&self) -> Result<(), AuthError> {
        self.cache
            .clear_current_user()
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        self.sessions.send_replace(None);
        Ok(())
    }

    async fn current_user(&self) -> Result<Option<User>, AuthError> {
        Ok(self.cache.current_user())
    }

    fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.sessions.subscribe()
    }
}

/// Project store backed by the local session cache. The whole per-user graph
/// is re-serialized after every mutation.
pub struct LocalProjectStore {
    cache: SessionCache,
}

impl LocalProjectStore {
    #[must_use]
    pub fn new(cache: SessionCache) -> Self {
        Self { cache }
    }

    fn save(&self, owner: &User, projects: &[Project]) -> Result<(), StoreError> {
        self.cache.save_projects(owner, projects).map_err(StoreError::from)
    }
}

#[async_trait]
impl ProjectStore for LocalProjectStore {
    async fn fetch_projects(&self, owner: &User) -> Result<Vec<Project>, StoreError> {
        Ok(self.cache.load_projects(owner))
    }

    async fn insert_project(&self, owner: &User, project: &Project) -> Result<(), StoreError> {
        let mut projects = self.cache.load_projects(owner);
        projects.push(project.clone());
        self.save(owner, &projects)
    }

    async fn rename_project(
        &self,
        owner: &User,
        id: &ProjectId,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut projects = self.cache.load_projects(owner);
        let project = projects
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))?;
        project.name = name.to_string();
        self.save(owner, &projects)
    }

    async fn delete_project(&self, owner: &User, id: &ProjectId) -> Result<(), StoreError> {
        let mut projects = self.cache.load_projects(owner);
        let pos = projects
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))?;
        projects.remove(pos);
        self.save(owner, &projects)
    }

    async fn insert_images(
        &self,
        owner: &User,
        project: &ProjectId,
        images: &[Image],
    ) -> Result<(), StoreError> {
        let mut projects = self.cache.load_projects(owner);
        let target = projects
            .iter_mut()
            .find(|p| &p.id == project)
            .ok_or_else(|| StoreError::NotFound(format!("project {project}")))?;

        // Prepend, preserving slice order: stored rows mirror the in-memory
        // newest-first ordering.
        let mut combined = images.to_vec();
        combined.append(&mut target.images);
        target.images = combined;
        self.save(owner, &projects)
    }

    async fn update_image(&self, owner: &User, image: &Image) -> Result<(), StoreError> {
        let mut projects = self.cache.load_projects(owner);
        let slot = projects
            .iter_mut()
            .find_map(|p| p.find_image_mut(&image.id))
            .ok_or_else(|| StoreError::NotFound(format!("image {}", image.id)))?;
        *slot = image.clone();
        self.save(owner, &projects)
    }

    async fn delete_image(&self, owner: &User, id: &ImageId) -> Result<(), StoreError> {
        let mut projects = self.cache.load_projects(owner);
        for project in &mut projects {
            if let Some(pos) = project.images.iter().position(|img| &img.id == id) {
                project.images.remove(pos);
                return self.save(owner, &projects);
            }
        }
        Err(StoreError::NotFound(format!("image {id}")))
    }
}
