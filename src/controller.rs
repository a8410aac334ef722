//! The application state controller: every mutation of the project/image
//! graph flows through here. Remote writes happen before (inserts) or
//! alongside (optimistic updates with full-snapshot rollback) the visible
//! state change, so that after any operation settles the in-memory model
//! matches what the store would return on a fresh fetch.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::model::{
    AspectRatio, GenerationOptions, Image, ImageId, ImagePayload, Project, ProjectId, StudioModel,
    User,
};
use crate::services::{ImageService, ProjectStore, ProviderError};
use crate::{
    derive_project_name, get_current_time_ms, AppError, AppResult, ErrorKind,
    DEFAULT_FIRST_PROJECT_NAME, DEFAULT_PROJECT_NAME_PREFIX, MAX_IMAGES_PER_REQUEST,
    MAX_PROJECT_NAME_CHARS, MAX_PROMPT_CHARS, MAX_REFERENCE_IMAGES, MIN_IMAGES_PER_REQUEST,
};

/// Explicit consent gate for destructive operations. Shells obtain it from
/// the user; the controller refuses without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Confirmed,
    Cancelled,
}

/// Owns the signed-in user's [`StudioModel`] and mediates every mutation
/// against the injected providers. Single-threaded ownership: all operations
/// take `&mut self`, and the busy flags are advisory only.
pub struct StudioController {
    user: User,
    model: StudioModel,
    images: Arc<dyn ImageService>,
    store: Arc<dyn ProjectStore>,
}

impl StudioController {
    #[must_use]
    pub fn new(user: User, images: Arc<dyn ImageService>, store: Arc<dyn ProjectStore>) -> Self {
        Self {
            user,
            model: StudioModel::default(),
            images,
            store,
        }
    }

    #[must_use]
    pub fn model(&self) -> &StudioModel {
        &self.model
    }

    #[must_use]
    pub fn user(&self) -> &User {
        &self.user
    }

    /// Records `err` on the model and returns it, so every failure is both
    /// visible to shells and propagated to the caller.
    fn fail<T>(&mut self, err: impl Into<AppError>) -> AppResult<T> {
        let err = err.into();
        warn!(code = err.code(), message = %err.message, "operation failed");
        self.model.active_error = Some(err.clone());
        Err(err)
    }

    /// Loads the user's projects and activates the first one, synthesizing a
    /// default project when none exist.
    #[instrument(skip(self))]
    pub async fn hydrate(&mut self) -> AppResult<()> {
        match self.store.fetch_projects(&self.user).await {
            Ok(projects) => self.model.projects = projects,
            Err(e) => return self.fail(e),
        }

        if self.model.projects.is_empty() {
            self.create_project(false).await?;
        } else {
            self.model.active_project_id = Some(self.model.projects[0].id.clone());
        }
        self.model.selected_image_id = None;
        Ok(())
    }

    /// Creates a default-named project, persisting it before it becomes
    /// visible. With `return_only` the model is left untouched and only the
    /// record is returned.
    #[instrument(skip(self))]
    pub async fn create_project(&mut self, return_only: bool) -> AppResult<Project> {
        let name = if self.model.projects.is_empty() {
            DEFAULT_FIRST_PROJECT_NAME.to_string()
        } else {
            format!(
                "{DEFAULT_PROJECT_NAME_PREFIX}{}",
                self.model.projects.len() + 1
            )
        };
        let project = Project::new(name, get_current_time_ms());

        if let Err(e) = self.store.insert_project(&self.user, &project).await {
            return self.fail(e);
        }

        if !return_only {
            self.model.projects.push(project.clone());
            self.model.active_project_id = Some(project.id.clone());
            self.model.selected_image_id = None;
        }
        debug!(project = %project.id, "project created");
        Ok(project)
    }

    /// Generates images into the active project. Non-empty reference
    /// payloads select edit mode: exactly one output whose aspect ratio is
    /// the source image's, never the requested one.
    #[instrument(skip_all, fields(ratio = %aspect_ratio, count, edit = options.is_edit()))]
    pub async fn generate(
        &mut self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        count: u8,
        options: GenerationOptions,
    ) -> AppResult<Vec<ImageId>> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return self.fail(AppError::new(
                ErrorKind::Validation,
                "Prompt must not be empty.",
            ));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return self.fail(AppError::new(
                ErrorKind::Validation,
                format!("Prompt exceeds {MAX_PROMPT_CHARS} characters."),
            ));
        }
        if options.reference_images.len() > MAX_REFERENCE_IMAGES {
            return self.fail(AppError::new(
                ErrorKind::Validation,
                format!("At most {MAX_REFERENCE_IMAGES} reference images are supported."),
            ));
        }
        if self.model.active_project().is_none() {
            return self.fail(AppError::new(
                ErrorKind::NoActiveProject,
                "No active project to receive generated images.",
            ));
        }

        self.model.is_generating = true;
        let result = self
            .generate_into_active(prompt, aspect_ratio, count, options)
            .await;
        self.model.is_generating = false;
        result
    }

    async fn generate_into_active(
        &mut self,
        prompt: &str,
        aspect_ratio: AspectRatio,
        count: u8,
        options: GenerationOptions,
    ) -> AppResult<Vec<ImageId>> {
        // Caller verified the active project exists; capture what auto-naming
        // needs before any await.
        let Some(project) = self.model.active_project() else {
            return self.fail(AppError::new(
                ErrorKind::NoActiveProject,
                "No active project to receive generated images.",
            ));
        };
        let project_id = project.id.clone();
        let had_default_name = project.has_default_name();
        let was_empty = project.is_empty();

        let now = get_current_time_ms();
        let new_images: Vec<Image> = if options.is_edit() {
            let payload = match self.images.edit(prompt, &options.reference_images).await {
                Ok(p) => p,
                Err(e) => return self.fail(e),
            };
            // The edited output keeps the source image's ratio.
            let ratio = options.source_aspect_ratio.unwrap_or(aspect_ratio);
            let mut image = Image::new(payload.to_data_url(), prompt.to_string(), ratio, now);
            image.reference_images = options.reference_images;
            vec![image]
        } else {
            let count = count.clamp(MIN_IMAGES_PER_REQUEST, MAX_IMAGES_PER_REQUEST);
            let payloads = match self.images.generate(prompt, aspect_ratio, count).await {
                Ok(p) => p,
                Err(e) => return self.fail(e),
            };
            if payloads.is_empty() {
                return self.fail(ProviderError::Empty);
            }
            payloads
                .into_iter()
                .map(|p| Image::new(p.to_data_url(), prompt.to_string(), aspect_ratio, now))
                .collect()
        };

        // Persist before touching visible state.
        if let Err(e) = self
            .store
            .insert_images(&self.user, &project_id, &new_images)
            .await
        {
            return self.fail(e);
        }

        let ids: Vec<ImageId> = new_images.iter().map(|i| i.id.clone()).collect();
        if let Some(project) = self.model.active_project_mut() {
            let mut combined = new_images;
            combined.append(&mut project.images);
            project.images = combined;
        }

        if had_default_name && was_empty {
            self.auto_name_project(&project_id, prompt).await;
        }

        debug!(inserted = ids.len(), "generation committed");
        Ok(ids)
    }

    /// Renames a still-default-named project after its first image lands.
    /// Failure rolls the name back and raises a toast; the images stay.
    async fn auto_name_project(&mut self, project_id: &ProjectId, prompt: &str) {
        let derived = derive_project_name(prompt);
        if derived.is_empty() {
            return;
        }

        let previous = match self.model.projects.iter_mut().find(|p| &p.id == project_id) {
            Some(project) if project.name != derived => {
                std::mem::replace(&mut project.name, derived.clone())
            }
            _ => return,
        };

        if let Err(e) = self
            .store
            .rename_project(&self.user, project_id, &derived)
            .await
        {
            if let Some(project) = self.model.projects.iter_mut().find(|p| &p.id == project_id) {
                project.name = previous;
            }
            warn!(error = %e, "auto-name rename failed");
            self.model.active_toast =
                Some("Couldn't rename the project automatically.".to_string());
        }
    }

    /// Re-runs generation with an existing image's prompt, ratio and
    /// reference payloads. Clears the image selection first.
    #[instrument(skip(self))]
    pub async fn create_variation(&mut self, id: &ImageId) -> AppResult<Vec<ImageId>> {
        let Some(image) = self.model.find_image(id) else {
            return self.fail(AppError::new(ErrorKind::NotFound, format!("image {id}")));
        };
        let prompt = image.prompt.clone();
        let ratio = image.aspect_ratio;
        let references = image.reference_images.clone();

        self.model.selected_image_id = None;

        let options = if references.is_empty() {
            GenerationOptions::default()
        } else {
            GenerationOptions::with_references(references, ratio)
        };
        self.generate(&prompt, ratio, 1, options).await
    }

    /// Produces the enhanced variant of an image. Already-enhanced images
    /// are a no-op success.
    #[instrument(skip(self))]
    pub async fn enhance_image(&mut self, id: &ImageId) -> AppResult<()> {
        let Some(image) = self.model.find_image(id) else {
            return self.fail(AppError::new(ErrorKind::NotFound, format!("image {id}")));
        };
        if image.enhanced {
            return Ok(());
        }
        let payload = match image.payload() {
            Ok(p) => p,
            Err(e) => {
                let err: AppError = e.into();
                return self.fail(err);
            }
        };
        let image = image.clone();

        self.model.is_enhancing = true;
        let result = self.enhance_inner(payload, image).await;
        self.model.is_enhancing = false;
        result
    }

    async fn enhance_inner(&mut self, payload: ImagePayload, mut image: Image) -> AppResult<()> {
        let enhanced = match self.images.enhance(&payload).await {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        image.enhanced = true;
        image.enhanced_url = Some(enhanced.to_data_url());

        // Persist first; the in-memory record changes only on acceptance.
        if let Err(e) = self.store.update_image(&self.user, &image).await {
            return self.fail(e);
        }
        if let Some(slot) = self.model.find_image_mut(&image.id) {
            *slot = image;
        }
        Ok(())
    }

    /// Optimistically removes an image; a rejected remote delete restores
    /// the pre-delete snapshot. Deleting a project's last image removes the
    /// project too (best effort remotely), keeping at least one project.
    #[instrument(skip(self))]
    pub async fn delete_image(&mut self, id: &ImageId) -> AppResult<()> {
        let Some(owner_id) = self.model.project_of_image(id).map(|p| p.id.clone()) else {
            return self.fail(AppError::new(ErrorKind::NotFound, format!("image {id}")));
        };

        let snapshot = self.model.projects.clone();
        if let Some(project) = self.model.projects.iter_mut().find(|p| p.id == owner_id) {
            project.images.retain(|img| &img.id != id);
        }

        if let Err(e) = self.store.delete_image(&self.user, id).await {
            self.model.projects = snapshot;
            return self.fail(e);
        }

        if self.model.selected_image_id.as_ref() == Some(id) {
            self.model.selected_image_id = None;
        }

        let emptied = self
            .model
            .find_project(&owner_id)
            .is_some_and(Project::is_empty);
        if emptied {
            self.model.projects.retain(|p| p.id != owner_id);
            // The images are already gone; a failed project cleanup is a
            // soft warning, not a rollback.
            if let Err(e) = self.store.delete_project(&self.user, &owner_id).await {
                warn!(error = %e, "emptied project cleanup failed");
                self.model.active_toast =
                    Some("The empty project could not be removed. It may reappear.".to_string());
            }
            if self.model.projects.is_empty() {
                self.create_project(false).await?;
            } else if self.model.active_project_id.as_ref() == Some(&owner_id) {
                self.model.active_project_id = Some(self.model.projects[0].id.clone());
            }
        }
        Ok(())
    }

    /// Optimistic flip with revert on a rejected remote update.
    #[instrument(skip(self))]
    pub async fn toggle_favorite(&mut self, id: &ImageId) -> AppResult<()> {
        let updated = {
            let Some(image) = self.model.find_image_mut(id) else {
                return self.fail(AppError::new(ErrorKind::NotFound, format!("image {id}")));
            };
            image.favorite = !image.favorite;
            image.clone()
        };

        if let Err(e) = self.store.update_image(&self.user, &updated).await {
            if let Some(image) = self.model.find_image_mut(id) {
                image.favorite = !image.favorite;
            }
            return self.fail(e);
        }
        Ok(())
    }

    /// Deletes a project and everything in it. Requires explicit
    /// confirmation; without it nothing is sent remotely.
    #[instrument(skip(self))]
    pub async fn delete_project(
        &mut self,
        id: &ProjectId,
        confirmation: Confirmation,
    ) -> AppResult<()> {
        if confirmation != Confirmation::Confirmed {
            return self.fail(AppError::new(
                ErrorKind::Validation,
                "Project deletion requires confirmation.",
            ));
        }
        if self.model.find_project(id).is_none() {
            return self.fail(AppError::new(ErrorKind::NotFound, format!("project {id}")));
        }

        let snapshot = self.model.projects.clone();
        self.model.projects.retain(|p| &p.id != id);

        if let Err(e) = self.store.delete_project(&self.user, id).await {
            self.model.projects = snapshot;
            return self.fail(e);
        }

        if self.model.active_project_id.as_ref() == Some(id) {
            self.model.active_project_id = self.model.projects.first().map(|p| p.id.clone());
            self.model.selected_image_id = None;
        }
        if self.model.projects.is_empty() {
            self.create_project(false).await?;
        }
        Ok(())
    }

    /// Renames a project. Blank names are rejected locally with no remote
    /// call; otherwise optimistic with rollback.
    #[instrument(skip(self))]
    pub async fn rename_project(&mut self, id: &ProjectId, new_name: &str) -> AppResult<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return self.fail(AppError::new(
                ErrorKind::Validation,
                "Project name must not be blank.",
            ));
        }
        if new_name.chars().count() > MAX_PROJECT_NAME_CHARS {
            return self.fail(AppError::new(
                ErrorKind::Validation,
                format!("Project name exceeds {MAX_PROJECT_NAME_CHARS} characters."),
            ));
        }

        let previous = {
            let Some(project) = self.model.projects.iter_mut().find(|p| &p.id == id) else {
                return self.fail(AppError::new(ErrorKind::NotFound, format!("project {id}")));
            };
            if project.name == new_name {
                return Ok(());
            }
            std::mem::replace(&mut project.name, new_name.to_string())
        };

        if let Err(e) = self.store.rename_project(&self.user, id, new_name).await {
            if let Some(project) = self.model.projects.iter_mut().find(|p| &p.id == id) {
                project.name = previous;
            }
            return self.fail(e);
        }
        Ok(())
    }

    pub fn select_project(&mut self, id: &ProjectId) -> AppResult<()> {
        if self.model.find_project(id).is_none() {
            return self.fail(AppError::new(ErrorKind::NotFound, format!("project {id}")));
        }
        self.model.active_project_id = Some(id.clone());
        self.model.selected_image_id = None;
        Ok(())
    }

    pub fn select_image(&mut self, id: &ImageId) -> AppResult<()> {
        if self.model.find_image(id).is_none() {
            return self.fail(AppError::new(ErrorKind::NotFound, format!("image {id}")));
        }
        self.model.selected_image_id = Some(id.clone());
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.model.selected_image_id = None;
    }

    pub fn dismiss_error(&mut self) {
        self.model.active_error = None;
    }

    pub fn dismiss_toast(&mut self) {
        self.model.active_toast = None;
    }
}
