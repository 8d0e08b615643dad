//! Bucket-style media storage on local disk.
//!
//! Objects are stored as `<storage_dir>/<bucket>/<owner>_<object>.<ext>`. The
//! owner id in the name lets private buckets check access without a table.

use std::path::{Path as FsPath, PathBuf};

use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{AuthUser, OptionalUser};
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    PropertyImages,
    Avatars,
    Documents,
}

impl Bucket {
    pub fn parse(name: &str) -> Result<Self, AppError> {
        match name {
            "property-images" => Ok(Bucket::PropertyImages),
            "avatars" => Ok(Bucket::Avatars),
            "documents" => Ok(Bucket::Documents),
            _ => Err(AppError::NotFound("Bucket")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::PropertyImages => "property-images",
            Bucket::Avatars => "avatars",
            Bucket::Documents => "documents",
        }
    }

    fn is_public(&self) -> bool {
        !matches!(self, Bucket::Documents)
    }

    fn accepts(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Pdf => *self == Bucket::Documents,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Jpeg,
    Png,
    Webp,
    Gif,
    Pdf,
}

impl MediaKind {
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.split(';').next().map(str::trim) {
            Some("image/jpeg") | Some("image/jpg") => Some(MediaKind::Jpeg),
            Some("image/png") => Some(MediaKind::Png),
            Some("image/webp") => Some(MediaKind::Webp),
            Some("image/gif") => Some(MediaKind::Gif),
            Some("application/pdf") => Some(MediaKind::Pdf),
            _ => None,
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "jpg" => Some(MediaKind::Jpeg),
            "png" => Some(MediaKind::Png),
            "webp" => Some(MediaKind::Webp),
            "gif" => Some(MediaKind::Gif),
            "pdf" => Some(MediaKind::Pdf),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Jpeg => "jpg",
            MediaKind::Png => "png",
            MediaKind::Webp => "webp",
            MediaKind::Gif => "gif",
            MediaKind::Pdf => "pdf",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            MediaKind::Jpeg => "image/jpeg",
            MediaKind::Png => "image/png",
            MediaKind::Webp => "image/webp",
            MediaKind::Gif => "image/gif",
            MediaKind::Pdf => "application/pdf",
        }
    }

    /// Checks the leading magic bytes against the declared type.
    pub fn matches_content(&self, data: &[u8]) -> bool {
        match self {
            MediaKind::Jpeg => data.starts_with(&[0xFF, 0xD8, 0xFF]),
            MediaKind::Png => data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
            MediaKind::Webp => data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP",
            MediaKind::Gif => data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a"),
            MediaKind::Pdf => data.starts_with(b"%PDF-"),
        }
    }
}

/// A validated object name: `<owner uuid>_<object uuid>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName {
    pub owner_id: Uuid,
    pub object_id: Uuid,
    pub kind: MediaKind,
}

impl ObjectName {
    pub fn generate(owner_id: Uuid, kind: MediaKind) -> Self {
        Self { owner_id, object_id: Uuid::new_v4(), kind }
    }

    pub fn parse(name: &str) -> Result<Self, AppError> {
        let invalid = || AppError::NotFound("Object");
        let (stem, ext) = name.rsplit_once('.').ok_or_else(invalid)?;
        let (owner, object) = stem.split_once('_').ok_or_else(invalid)?;
        Ok(Self {
            owner_id: Uuid::parse_str(owner).map_err(|_| invalid())?,
            object_id: Uuid::parse_str(object).map_err(|_| invalid())?,
            kind: MediaKind::from_extension(ext).ok_or_else(invalid)?,
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.{}", self.owner_id, self.object_id, self.kind.extension())
    }
}

/// Reads and writes objects below a root directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: Bucket, name: &ObjectName) -> PathBuf {
        self.root.join(bucket.as_str()).join(name.file_name())
    }

    pub async fn save(&self, bucket: Bucket, name: &ObjectName, data: &[u8]) -> Result<(), AppError> {
        let dir = self.root.join(bucket.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to create {}: {}", dir.display(), e)))?;
        let path = self.path(bucket, name);
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to write {}: {}", path.display(), e)))
    }

    pub async fn load(&self, bucket: Bucket, name: &ObjectName) -> Result<Vec<u8>, AppError> {
        match tokio::fs::read(self.path(bucket, name)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::NotFound("Object")),
            Err(e) => Err(AppError::Internal(format!("Failed to read object: {}", e))),
        }
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }
}

#[derive(Debug, Serialize)]
pub struct StoredObject {
    pub bucket: &'static str,
    pub name: String,
    pub url: String,
    pub content_type: &'static str,
    pub size: usize,
}

async fn file_field(multipart: &mut Multipart) -> Result<(String, Bytes), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::validation(format!("Malformed upload: {}", e)))?
    {
        if field.name() == Some("file") {
            let content_type = field
                .content_type()
                .map(str::to_string)
                .ok_or_else(|| AppError::validation("The file has no content type"))?;
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::validation(format!("Malformed upload: {}", e)))?;
            return Ok((content_type, data));
        }
    }
    Err(AppError::validation("Attach the upload as a 'file' field"))
}

pub async fn upload(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(bucket): Path<String>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<StoredObject>), AppError> {
    let bucket = Bucket::parse(&bucket)?;
    let (content_type, data) = file_field(&mut multipart).await?;
    let kind = MediaKind::from_content_type(&content_type)
        .filter(|kind| bucket.accepts(*kind))
        .ok_or_else(|| AppError::validation(format!("{} files are not accepted here", content_type)))?;
    if data.is_empty() {
        return Err(AppError::validation("The file is empty"));
    }
    if data.len() > state.config.storage_max_bytes {
        return Err(AppError::validation("The file is too large"));
    }
    if !kind.matches_content(&data) {
        return Err(AppError::validation("The file does not match its declared type"));
    }

    let name = ObjectName::generate(user.id, kind);
    state.storage.save(bucket, &name, &data).await?;
    let file_name = name.file_name();
    log::info!("Stored {}/{} ({} bytes) for {}", bucket.as_str(), file_name, data.len(), user.id);
    Ok((
        StatusCode::CREATED,
        Json(StoredObject {
            bucket: bucket.as_str(),
            url: format!("/storage/{}/{}", bucket.as_str(), file_name),
            name: file_name,
            content_type: kind.content_type(),
            size: data.len(),
        }),
    ))
}

pub async fn download(
    State(state): State<AppState>,
    OptionalUser(viewer): OptionalUser,
    Path((bucket, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let bucket = Bucket::parse(&bucket)?;
    let name = ObjectName::parse(&name)?;
    if !bucket.is_public() {
        let allowed = viewer.is_some_and(|v| v.is_admin() || v.id == name.owner_id);
        if !allowed {
            return Err(AppError::NotFound("Object"));
        }
    }
    let data = state.storage.load(bucket, &name).await?;
    let cache = if bucket.is_public() { "public, max-age=86400" } else { "private, no-store" };
    Ok(([(header::CONTENT_TYPE, name.kind.content_type()), (header::CACHE_CONTROL, cache)], data))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0];

    #[test]
    fn buckets_are_allow_listed() {
        assert_eq!(Bucket::parse("avatars").unwrap(), Bucket::Avatars);
        assert!(Bucket::parse("../etc").is_err());
        assert!(Bucket::parse("secrets").is_err());
        assert!(!Bucket::Avatars.accepts(MediaKind::Pdf));
        assert!(Bucket::Documents.accepts(MediaKind::Pdf));
    }

    #[test]
    fn content_types_and_magic_bytes() {
        assert_eq!(MediaKind::from_content_type("image/png; charset=binary"), Some(MediaKind::Png));
        assert_eq!(MediaKind::from_content_type("text/html"), None);
        assert!(MediaKind::Png.matches_content(PNG));
        assert!(!MediaKind::Jpeg.matches_content(PNG));
        assert!(MediaKind::Webp.matches_content(b"RIFF\x00\x00\x00\x00WEBPVP8 "));
        assert!(MediaKind::Pdf.matches_content(b"%PDF-1.7"));
    }

    #[test]
    fn object_names_round_trip_and_reject_traversal() {
        let name = ObjectName::generate(Uuid::new_v4(), MediaKind::Gif);
        assert_eq!(ObjectName::parse(&name.file_name()).unwrap(), name);
        assert!(ObjectName::parse("../../etc/passwd").is_err());
        assert!(ObjectName::parse(&format!("{}_{}.exe", Uuid::new_v4(), Uuid::new_v4())).is_err());
    }

    #[tokio::test]
    async fn disk_store_saves_and_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        let name = ObjectName::generate(Uuid::new_v4(), MediaKind::Png);

        store.save(Bucket::PropertyImages, &name, PNG).await.unwrap();

        assert_eq!(store.load(Bucket::PropertyImages, &name).await.unwrap(), PNG);
        assert!(store.root().join("property-images").join(name.file_name()).exists());
        assert!(matches!(store.load(Bucket::Avatars, &name).await, Err(AppError::NotFound(_))));
    }
}
