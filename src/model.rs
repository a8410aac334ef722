use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{AppError, DEFAULT_FIRST_PROJECT_NAME, DEFAULT_PROJECT_NAME_PREFIX, MIGRATED_PROJECT_NAME};

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(UserId);
typed_id!(ProjectId);
typed_id!(ImageId);

// --- Aspect ratio ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "16:9")]
    Landscape,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    LandscapeWide,
    #[serde(rename = "9:16")]
    PortraitTall,
}

impl AspectRatio {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape => "16:9",
            Self::Portrait => "3:4",
            Self::LandscapeWide => "4:3",
            Self::PortraitTall => "9:16",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1:1" => Some(Self::Square),
            "16:9" => Some(Self::Landscape),
            "3:4" => Some(Self::Portrait),
            "4:3" => Some(Self::LandscapeWide),
            "9:16" => Some(Self::PortraitTall),
            _ => None,
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Image payload: self-describing encoded bytes ---

#[derive(Debug, Clone, Error)]
pub enum PayloadError {
    #[error("not a data URL")]
    NotADataUrl,
    #[error("data URL is not base64-encoded")]
    NotBase64Encoded,
    #[error("invalid base64 payload: {0}")]
    InvalidBase64(String),
    #[error("empty image payload")]
    Empty,
}

impl From<PayloadError> for AppError {
    fn from(e: PayloadError) -> Self {
        AppError::new(crate::ErrorKind::Validation, e.to_string())
    }
}

/// Encoded image bytes plus their mime type, the unit of exchange with the
/// image provider. `data` is always base64.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub data: String,
    pub mime_type: String,
}

// Redact debug output; payloads are large and user-generated.
impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("data_len", &self.data.len())
            .finish()
    }
}

impl ImagePayload {
    pub fn new(data: impl Into<String>, mime_type: impl Into<String>) -> Result<Self, PayloadError> {
        let data = data.into();
        if data.is_empty() {
            return Err(PayloadError::Empty);
        }
        BASE64
            .decode(&data)
            .map_err(|e| PayloadError::InvalidBase64(e.to_string()))?;
        Ok(Self {
            data,
            mime_type: mime_type.into(),
        })
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            data: BASE64.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Parses a `data:<mime>;base64,<payload>` URL.
    pub fn from_data_url(url: &str) -> Result<Self, PayloadError> {
        let rest = url.strip_prefix("data:").ok_or(PayloadError::NotADataUrl)?;
        let (mime_type, data) = rest
            .split_once(";base64,")
            .ok_or(PayloadError::NotBase64Encoded)?;
        Self::new(data, mime_type)
    }

    #[must_use]
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn decode(&self) -> Result<Vec<u8>, PayloadError> {
        BASE64
            .decode(&self.data)
            .map_err(|e| PayloadError::InvalidBase64(e.to_string()))
    }
}

// --- User ---

/// Fallback avatar shown until the user sets a photo.
pub const DEFAULT_AVATAR_URL: &str = "data:image/svg+xml;base64,PHN2ZyB4bWxucz0iaHR0cDovL3d3dy53My5vcmcvMjAwMC9zdmciIHZpZXdCb3g9IjAgMCAyNCAyNCIgZmlsbD0iI0EwQTBCNiI+PHBhdGggZD0iTTEyIDJDNi40OCAyIDIgNi40OCAyIDEyczQuNDggMTAgMTAgMTAgMTAtNC40OCAxMC0xMFMxNy41MiAyIDEyIDJ6Ii8+PC9zdmc+";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub photo_url: String,
}

// --- Image ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Image {
    pub id: ImageId,
    /// Primary artifact: a data URL or a remote link.
    pub url: String,
    /// Set once the enhancement call completes.
    pub enhanced_url: Option<String>,
    pub prompt: String,
    pub aspect_ratio: AspectRatio,
    pub favorite: bool,
    pub enhanced: bool,
    /// Reference payloads used to produce this image, if any.
    #[serde(default)]
    pub reference_images: Vec<ImagePayload>,
    pub created_at_ms: u64,
}

impl Image {
    #[must_use]
    pub fn new(url: String, prompt: String, aspect_ratio: AspectRatio, created_at_ms: u64) -> Self {
        Self {
            id: ImageId::generate(),
            url,
            enhanced_url: None,
            prompt,
            aspect_ratio,
            favorite: false,
            enhanced: false,
            reference_images: Vec::new(),
            created_at_ms,
        }
    }

    /// The raw payload behind `url`, required by the enhancement call.
    pub fn payload(&self) -> Result<ImagePayload, PayloadError> {
        ImagePayload::from_data_url(&self.url)
    }
}

// --- Project ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub created_at_ms: u64,
    /// Newest first.
    #[serde(default)]
    pub images: Vec<Image>,
}

impl Project {
    #[must_use]
    pub fn new(name: impl Into<String>, created_at_ms: u64) -> Self {
        Self {
            id: ProjectId::generate(),
            name: name.into(),
            created_at_ms,
            images: Vec::new(),
        }
    }

    /// True while the project still carries a system-assigned name.
    /// Auto-naming from the first prompt only applies in this state.
    #[must_use]
    pub fn has_default_name(&self) -> bool {
        if self.name == DEFAULT_FIRST_PROJECT_NAME || self.name == MIGRATED_PROJECT_NAME {
            return true;
        }
        self.name
            .strip_prefix(DEFAULT_PROJECT_NAME_PREFIX)
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    #[must_use]
    pub fn find_image(&self, id: &ImageId) -> Option<&Image> {
        self.images.iter().find(|img| &img.id == id)
    }

    pub fn find_image_mut(&mut self, id: &ImageId) -> Option<&mut Image> {
        self.images.iter_mut().find(|img| &img.id == id)
    }
}

// --- Generation options ---

/// Extra inputs to a generation request. Non-empty `reference_images`
/// selects edit mode: a single output image whose aspect ratio comes from
/// `source_aspect_ratio`, not from the request. Fields are constructor-only
/// so edit mode always carries a source ratio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub(crate) reference_images: Vec<ImagePayload>,
    pub(crate) source_aspect_ratio: Option<AspectRatio>,
}

impl GenerationOptions {
    #[must_use]
    pub fn with_references(references: Vec<ImagePayload>, source: AspectRatio) -> Self {
        Self {
            reference_images: references,
            source_aspect_ratio: Some(source),
        }
    }

    #[must_use]
    pub fn is_edit(&self) -> bool {
        !self.reference_images.is_empty()
    }
}

// --- The in-memory model shells render ---

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct StudioModel {
    pub projects: Vec<Project>,
    pub active_project_id: Option<ProjectId>,
    pub selected_image_id: Option<ImageId>,

    // Advisory busy flags; shells use them to disable re-entrant submission.
    pub is_generating: bool,
    pub is_enhancing: bool,

    pub active_error: Option<AppError>,
    pub active_toast: Option<String>,
}

impl StudioModel {
    #[must_use]
    pub fn active_project(&self) -> Option<&Project> {
        let id = self.active_project_id.as_ref()?;
        self.projects.iter().find(|p| &p.id == id)
    }

    pub fn active_project_mut(&mut self) -> Option<&mut Project> {
        let id = self.active_project_id.clone()?;
        self.projects.iter_mut().find(|p| p.id == id)
    }

    #[must_use]
    pub fn find_project(&self, id: &ProjectId) -> Option<&Project> {
        self.projects.iter().find(|p| &p.id == id)
    }

    #[must_use]
    pub fn find_image(&self, id: &ImageId) -> Option<&Image> {
        self.projects.iter().find_map(|p| p.find_image(id))
    }

    pub fn find_image_mut(&mut self, id: &ImageId) -> Option<&mut Image> {
        self.projects.iter_mut().find_map(|p| p.find_image_mut(id))
    }

    /// The project owning an image, if any.
    #[must_use]
    pub fn project_of_image(&self, id: &ImageId) -> Option<&Project> {
        self.projects.iter().find(|p| p.find_image(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_ratio_roundtrips_as_ratio_string() {
        let json = serde_json::to_string(&AspectRatio::Landscape).unwrap();
        assert_eq!(json, "\"16:9\"");
        let back: AspectRatio = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AspectRatio::Landscape);
    }

    #[test]
    fn aspect_ratio_parse_rejects_unknown() {
        assert_eq!(AspectRatio::parse("2:1"), None);
        assert_eq!(AspectRatio::parse("9:16"), Some(AspectRatio::PortraitTall));
    }

    #[test]
    fn payload_data_url_roundtrip() {
        let payload = ImagePayload::from_bytes(b"hello", "image/png");
        let url = payload.to_data_url();
        assert!(url.starts_with("data:image/png;base64,"));
        let parsed = ImagePayload::from_data_url(&url).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(parsed.decode().unwrap(), b"hello");
    }

    #[test]
    fn payload_rejects_plain_urls() {
        assert!(matches!(
            ImagePayload::from_data_url("https://example.com/cat.png"),
            Err(PayloadError::NotADataUrl)
        ));
    }

    #[test]
    fn payload_rejects_non_base64_data_urls() {
        assert!(matches!(
            ImagePayload::from_data_url("data:text/plain,hello"),
            Err(PayloadError::NotBase64Encoded)
        ));
        assert!(matches!(
            ImagePayload::from_data_url("data:image/png;base64,!!!not-base64!!!"),
            Err(PayloadError::InvalidBase64(_))
        ));
    }

    #[test]
    fn payload_debug_is_redacted() {
        let payload = ImagePayload::from_bytes(&[0u8; 64], "image/jpeg");
        let debug = format!("{payload:?}");
        assert!(debug.contains("data_len"));
        assert!(!debug.contains(&payload.data));
    }

    #[test]
    fn default_name_detection() {
        let mk = |name: &str| Project::new(name, 0);
        assert!(mk("My First Project").has_default_name());
        assert!(mk("Migrated Project").has_default_name());
        assert!(mk("Project 2").has_default_name());
        assert!(mk("Project 17").has_default_name());
        assert!(!mk("Project ").has_default_name());
        assert!(!mk("Project X").has_default_name());
        assert!(!mk("a red fox in snow").has_default_name());
    }

    #[test]
    fn typed_ids_generate_unique() {
        assert_ne!(ImageId::generate(), ImageId::generate());
    }

    #[test]
    fn model_lookups_traverse_projects() {
        let mut project = Project::new("My First Project", 1);
        let image = Image::new("data:x".into(), "fox".into(), AspectRatio::Square, 2);
        let image_id = image.id.clone();
        project.images.push(image);

        let model = StudioModel {
            active_project_id: Some(project.id.clone()),
            projects: vec![project.clone()],
            ..StudioModel::default()
        };

        assert_eq!(model.active_project().unwrap().id, project.id);
        assert_eq!(model.find_image(&image_id).unwrap().prompt, "fox");
        assert_eq!(model.project_of_image(&image_id).unwrap().id, project.id);
    }
}
