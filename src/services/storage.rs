use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio::fs;

use crate::error::AppError;

/// Largest accepted upload after base64 decoding.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    IdCard,
    Profile,
}

impl ImageKind {
    fn stem(&self) -> &'static str {
        match self {
            ImageKind::IdCard => "id_card",
            ImageKind::Profile => "profile",
        }
    }
}

/// A decoded upload with its sniffed format.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    extension: &'static str,
}

impl ImageUpload {
    /// Accepts raw base64 or a `data:image/...;base64,` URL.
    pub fn from_base64(encoded: &str) -> Result<Self, AppError> {
        let payload = match encoded.trim().split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded.trim(),
        };
        let bytes = STANDARD
            .decode(payload)
            .map_err(|_| AppError::BadRequest("image is not valid base64".into()))?;
        if bytes.is_empty() {
            return Err(AppError::BadRequest("image is empty".into()));
        }
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(AppError::BadRequest("image is too large".into()));
        }
        let (mime_type, extension) = sniff_format(&bytes)
            .ok_or_else(|| AppError::BadRequest("image must be JPEG, PNG or WebP".into()))?;
        Ok(Self {
            bytes,
            mime_type,
            extension,
        })
    }

    pub fn base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

fn sniff_format(bytes: &[u8]) -> Option<(&'static str, &'static str)> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(("image/jpeg", "jpg"))
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(("image/png", "png"))
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some(("image/webp", "webp"))
    } else {
        None
    }
}

#[derive(Clone)]
pub struct StorageService {
    root: Arc<PathBuf>,
}

impl StorageService {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root: Arc::new(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_structure(&self) -> Result<(), AppError> {
        fs::create_dir_all(self.root().join("users")).await?;
        Ok(())
    }

    pub fn user_dir(&self, user_uuid: &str) -> PathBuf {
        self.root().join("users").join(user_uuid)
    }

    pub async fn ensure_user_dir(&self, user_uuid: &str) -> Result<PathBuf, AppError> {
        let dir = self.user_dir(user_uuid);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Writes the image and returns its reference relative to the storage root.
    pub async fn save_user_image(
        &self,
        user_uuid: &str,
        kind: ImageKind,
        image: &ImageUpload,
    ) -> Result<String, AppError> {
        let dir = self.ensure_user_dir(user_uuid).await?;
        let filename = format!("{}.{}", kind.stem(), image.extension);
        fs::write(dir.join(&filename), &image.bytes).await?;
        Ok(format!("users/{user_uuid}/{filename}"))
    }

    pub async fn load_image(&self, reference: &str) -> Result<ImageUpload, AppError> {
        if reference.split('/').any(|part| part == "..") {
            return Err(AppError::BadRequest("invalid image reference".into()));
        }
        let path = self.root().join(reference);
        if !fs::try_exists(&path).await? {
            return Err(AppError::NotFound);
        }
        let bytes = fs::read(&path).await?;
        let (mime_type, extension) = sniff_format(&bytes)
            .ok_or_else(|| AppError::Other(anyhow::anyhow!("stored image {reference} is corrupt")))?;
        Ok(ImageUpload {
            bytes,
            mime_type,
            extension,
        })
    }
}
