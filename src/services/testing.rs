//! Deterministic in-memory fakes for the provider seams. Each fake can be
//! armed to fail its next call so tests can drive the rollback paths.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::model::{AspectRatio, Image, ImageId, ImagePayload, Project, ProjectId, User};
use crate::services::{ImageService, ProjectStore, ProviderError, StoreError};

/// Image provider fake. Payloads are numbered so tests can tell results
/// apart; `enhance` prefixes the source bytes.
#[derive(Default)]
pub struct FakeImageService {
    counter: Mutex<u64>,
    fail_next: Mutex<Option<ProviderError>>,
}

impl FakeImageService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the fake to fail its next call with `err`, then recover.
    pub fn fail_next(&self, err: ProviderError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    fn take_failure(&self) -> Option<ProviderError> {
        self.fail_next.lock().unwrap().take()
    }

    fn next_payload(&self) -> ImagePayload {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        ImagePayload::from_bytes(format!("img-{counter}").as_bytes(), "image/png")
    }
}

#[async_trait]
impl ImageService for FakeImageService {
    async fn generate(
        &self,
        _prompt: &str,
        _aspect_ratio: AspectRatio,
        count: u8,
    ) -> Result<Vec<ImagePayload>, ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        Ok((0..count).map(|_| self.next_payload()).collect())
    }

    async fn edit(
        &self,
        _prompt: &str,
        references: &[ImagePayload],
    ) -> Result<ImagePayload, ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if references.is_empty() {
            return Err(ProviderError::Other("edit requires references".into()));
        }
        Ok(self.next_payload())
    }

    async fn enhance(&self, source: &ImagePayload) -> Result<ImagePayload, ProviderError> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let mut bytes = b"enhanced-".to_vec();
        bytes.extend_from_slice(&source.decode().map_err(|e| ProviderError::Other(e.to_string()))?);
        Ok(ImagePayload::from_bytes(&bytes, &source.mime_type))
    }
}

/// Project store fake keeping per-user graphs in memory and logging every
/// mutating call so tests can assert what was (or was not) sent remotely.
#[derive(Default)]
pub struct FakeProjectStore {
    graphs: Mutex<HashMap<String, Vec<Project>>>,
    fail_next: Mutex<Option<StoreError>>,
    fail_on: Mutex<HashMap<String, StoreError>>,
    ops: Mutex<Vec<String>>,
}

impl FakeProjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the fake to fail its next call with `err`, then recover.
    pub fn fail_next(&self, err: StoreError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    /// Arms the fake to fail the next call of the named operation only.
    /// Other operations keep succeeding.
    pub fn fail_op(&self, op: &str, err: StoreError) {
        self.fail_on.lock().unwrap().insert(op.to_string(), err);
    }

    /// Names of the mutating calls received so far, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    /// The stored graph for `user`, as the fake would serve it.
    #[must_use]
    pub fn projects_for(&self, user: &User) -> Vec<Project> {
        self.graphs
            .lock()
            .unwrap()
            .get(user.id.as_str())
            .cloned()
            .unwrap_or_default()
    }

    fn check_failure(&self, op: &str) -> Result<(), StoreError> {
        self.ops.lock().unwrap().push(op.to_string());
        if let Some(err) = self.fail_on.lock().unwrap().remove(op) {
            return Err(err);
        }
        match self.fail_next.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProjectStore for FakeProjectStore {
    async fn fetch_projects(&self, owner: &User) -> Result<Vec<Project>, StoreError> {
        self.check_failure("fetch_projects")?;
        Ok(self.projects_for(owner))
    }

    async fn insert_project(&self, owner: &User, project: &Project) -> Result<(), StoreError> {
        self.check_failure("insert_project")?;
        self.graphs
            .lock()
            .unwrap()
            .entry(owner.id.as_str().to_string())
            .or_default()
            .push(project.clone());
        Ok(())
    }

    async fn rename_project(
        &self,
        owner: &User,
        id: &ProjectId,
        name: &str,
    ) -> Result<(), StoreError> {
        self.check_failure("rename_project")?;
        let mut graphs = self.graphs.lock().unwrap();
        let projects = graphs.entry(owner.id.as_str().to_string()).or_default();
        let project = projects
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))?;
        project.name = name.to_string();
        Ok(())
    }

    async fn delete_project(&self, owner: &User, id: &ProjectId) -> Result<(), StoreError> {
        self.check_failure("delete_project")?;
        let mut graphs = self.graphs.lock().unwrap();
        let projects = graphs.entry(owner.id.as_str().to_string()).or_default();
        let pos = projects
            .iter()
            .position(|p| &p.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("project {id}")))?;
        projects.remove(pos);
        Ok(())
    }

    async fn insert_images(
        &self,
        owner: &User,
        project: &ProjectId,
        images: &[Image],
    ) -> Result<(), StoreError> {
        self.check_failure("insert_images")?;
        let mut graphs = self.graphs.lock().unwrap();
        let projects = graphs.entry(owner.id.as_str().to_string()).or_default();
        let target = projects
            .iter_mut()
            .find(|p| &p.id == project)
            .ok_or_else(|| StoreError::NotFound(format!("project {project}")))?;
        let mut combined = images.to_vec();
        combined.append(&mut target.images);
        target.images = combined;
        Ok(())
    }

    async fn update_image(&self, owner: &User, image: &Image) -> Result<(), StoreError> {
        self.check_failure("update_image")?;
        let mut graphs = self.graphs.lock().unwrap();
        let projects = graphs.entry(owner.id.as_str().to_string()).or_default();
        let slot = projects
            .iter_mut()
            .find_map(|p| p.find_image_mut(&image.id))
            .ok_or_else(|| StoreError::NotFound(format!("image {}", image.id)))?;
        *slot = image.clone();
        Ok(())
    }

    async fn delete_image(&self, owner: &User, id: &ImageId) -> Result<(), StoreError> {
        self.check_failure("delete_image")?;
        let mut graphs = self.graphs.lock().unwrap();
        let projects = graphs.entry(owner.id.as_str().to_string()).or_default();
        for project in projects.iter_mut() {
            if let Some(pos) = project.images.iter().position(|img| &img.id == id) {
                project.images.remove(pos);
                return Ok(());
            }
        }
        Err(StoreError::NotFound(format!("image {id}")))
    }
}
