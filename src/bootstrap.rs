//! Session bootstrap: decides which surface the shell shows and owns the
//! controller's lifecycle. Connectivity failures during startup route to an
//! explicit guidance phase instead of failing silently.

use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::controller::StudioController;
use crate::model::User;
use crate::services::{AccountService, ImageService, ProjectStore};
use crate::{AppError, AppResult, ErrorKind};

/// What the shell should render right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Session resolution in progress.
    Loading,
    Login,
    Signup,
    /// Signed in, projects hydrated, controller available.
    App,
    /// Startup could not complete; carries the guidance text to display.
    SetupGuidance(String),
}

pub struct Bootstrap {
    accounts: Arc<dyn AccountService>,
    images: Arc<dyn ImageService>,
    store: Arc<dyn ProjectStore>,
    phase: Phase,
    controller: Option<StudioController>,
}

impl Bootstrap {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn AccountService>,
        images: Arc<dyn ImageService>,
        store: Arc<dyn ProjectStore>,
    ) -> Self {
        Self {
            accounts,
            images,
            store,
            phase: Phase::Loading,
            controller: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// The controller, available while in [`Phase::App`].
    #[must_use]
    pub fn controller(&self) -> Option<&StudioController> {
        self.controller.as_ref()
    }

    pub fn controller_mut(&mut self) -> Option<&mut StudioController> {
        self.controller.as_mut()
    }

    /// A watch channel that fires on any session change. Shells feed its
    /// values into [`Bootstrap::on_account_change`].
    #[must_use]
    pub fn session_changes(&self) -> watch::Receiver<Option<User>> {
        self.accounts.subscribe()
    }

    /// Resolves the initial phase: restore an existing session into the app,
    /// otherwise land on login.
    #[instrument(skip(self))]
    pub async fn resolve(&mut self) -> &Phase {
        match self.accounts.current_user().await {
            Ok(Some(user)) => self.enter_app(user).await,
            Ok(None) => self.phase = Phase::Login,
            Err(e) => self.route_failure(e.into()),
        }
        &self.phase
    }

    /// Drives the same transitions as [`Bootstrap::resolve`] at any later
    /// time: a session appearing (login elsewhere) enters the app, a session
    /// vanishing returns to login.
    pub async fn on_account_change(&mut self, user: Option<User>) {
        match user {
            Some(user) => self.enter_app(user).await,
            None => {
                self.controller = None;
                self.phase = Phase::Login;
            }
        }
    }

    pub async fn login(&mut self, email: &str, password: SecretString) -> AppResult<()> {
        match self.accounts.login(email, password).await {
            Ok(user) => {
                self.enter_app(user).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn signup(
        &mut self,
        username: &str,
        email: &str,
        password: SecretString,
        photo_url: Option<String>,
    ) -> AppResult<()> {
        match self.accounts.signup(username, email, password, photo_url).await {
            Ok(user) => {
                self.enter_app(user).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn logout(&mut self) -> AppResult<()> {
        self.accounts.logout().await.map_err(AppError::from)?;
        self.controller = None;
        self.phase = Phase::Login;
        Ok(())
    }

    pub fn request_signup(&mut self) {
        self.phase = Phase::Signup;
    }

    pub fn show_login(&mut self) {
        self.controller = None;
        self.phase = Phase::Login;
    }

    async fn enter_app(&mut self, user: User) {
        let mut controller =
            StudioController::new(user, self.images.clone(), self.store.clone());
        match controller.hydrate().await {
            Ok(()) => {
                debug!("session hydrated");
                self.controller = Some(controller);
                self.phase = Phase::App;
            }
            Err(e) => self.route_failure(e),
        }
    }

    fn route_failure(&mut self, err: AppError) {
        self.controller = None;
        self.phase = match err.kind {
            ErrorKind::Auth => Phase::Login,
            _ => Phase::SetupGuidance(err.user_facing_message()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{FakeImageService, FakeProjectStore};
    use crate::services::{LocalAccountService, LocalProjectStore, StoreError};
    use crate::storage::{MemoryKv, SessionCache};
    use crate::DEFAULT_FIRST_PROJECT_NAME;

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    fn local_bootstrap() -> (Bootstrap, SessionCache) {
        let cache = SessionCache::new(Arc::new(MemoryKv::new()));
        let bootstrap = Bootstrap::new(
            Arc::new(LocalAccountService::new(cache.clone())),
            Arc::new(FakeImageService::new()),
            Arc::new(LocalProjectStore::new(cache.clone())),
        );
        (bootstrap, cache)
    }

    #[tokio::test]
    async fn no_session_lands_on_login() {
        let (mut bootstrap, _) = local_bootstrap();
        assert_eq!(bootstrap.phase(), &Phase::Loading);
        assert_eq!(bootstrap.resolve().await, &Phase::Login);
        assert!(bootstrap.controller().is_none());
    }

    #[tokio::test]
    async fn signup_enters_the_app_with_one_default_project() {
        let (mut bootstrap, _) = local_bootstrap();
        bootstrap.resolve().await;
        bootstrap.request_signup();
        assert_eq!(bootstrap.phase(), &Phase::Signup);

        bootstrap
            .signup("ada", "ada@example.com", secret("pw"), None)
            .await
            .unwrap();
        assert_eq!(bootstrap.phase(), &Phase::App);

        let model = bootstrap.controller().unwrap().model();
        assert_eq!(model.projects.len(), 1);
        assert_eq!(model.projects[0].name, DEFAULT_FIRST_PROJECT_NAME);
        assert!(model.active_project_id.is_some());
    }

    #[tokio::test]
    async fn existing_session_restores_straight_into_the_app() {
        let (mut bootstrap, cache) = local_bootstrap();
        bootstrap
            .signup("ada", "ada@example.com", secret("pw"), None)
            .await
            .unwrap();

        // A fresh process over the same storage.
        let mut restarted = Bootstrap::new(
            Arc::new(LocalAccountService::new(cache.clone())),
            Arc::new(FakeImageService::new()),
            Arc::new(LocalProjectStore::new(cache)),
        );
        assert_eq!(restarted.resolve().await, &Phase::App);
        assert_eq!(
            restarted.controller().unwrap().user().email,
            "ada@example.com"
        );
    }

    #[tokio::test]
    async fn failed_login_stays_on_login() {
        let (mut bootstrap, _) = local_bootstrap();
        bootstrap.resolve().await;

        let err = bootstrap
            .login("ghost@example.com", secret("pw"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Auth);
        assert_eq!(bootstrap.phase(), &Phase::Login);
    }

    #[tokio::test]
    async fn logout_returns_to_login_and_drops_the_controller() {
        let (mut bootstrap, _) = local_bootstrap();
        bootstrap
            .signup("ada", "ada@example.com", secret("pw"), None)
            .await
            .unwrap();

        bootstrap.logout().await.unwrap();
        assert_eq!(bootstrap.phase(), &Phase::Login);
        assert!(bootstrap.controller().is_none());
    }

    #[tokio::test]
    async fn store_failure_routes_to_setup_guidance() {
        let cache = SessionCache::new(Arc::new(MemoryKv::new()));
        let accounts = Arc::new(LocalAccountService::new(cache.clone()));
        let store = Arc::new(FakeProjectStore::new());
        store.fail_op("fetch_projects", StoreError::Connection("dns".into()));

        let mut bootstrap = Bootstrap::new(
            accounts.clone(),
            Arc::new(FakeImageService::new()),
            store,
        );
        bootstrap
            .signup("ada", "ada@example.com", secret("pw"), None)
            .await
            .unwrap();

        match bootstrap.phase() {
            Phase::SetupGuidance(reason) => assert!(!reason.is_empty()),
            other => panic!("expected SetupGuidance, got {other:?}"),
        }
        assert!(bootstrap.controller().is_none());
    }

    #[tokio::test]
    async fn account_change_events_drive_transitions() {
        let (mut bootstrap, _) = local_bootstrap();
        bootstrap
            .signup("ada", "ada@example.com", secret("pw"), None)
            .await
            .unwrap();
        let user = bootstrap.controller().unwrap().user().clone();

        bootstrap.on_account_change(None).await;
        assert_eq!(bootstrap.phase(), &Phase::Login);

        bootstrap.on_account_change(Some(user)).await;
        assert_eq!(bootstrap.phase(), &Phase::App);
        assert!(bootstrap.controller().is_some());
    }
}
