use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use oraculo_core::{Attachment, DomainError};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const PROCEDURE_BUCKET: &str = "procedures";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_url: String,
    pub file_name: String,
    pub mime_type: String,
    /// Name of the stored object inside the procedures bucket.
    pub object_name: String,
}

impl From<UploadedFile> for Attachment {
    fn from(file: UploadedFile) -> Self {
        Self { file_url: file.file_url, file_name: file.file_name, mime_type: file.mime_type }
    }
}

/// Blob store for procedure attachments.
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under a fresh object name and return its public URL.
    ///
    /// # Errors
    /// Returns an error when the file name is blank or the blob cannot be written.
    fn put(&self, file_name: &str, mime_type: &str, bytes: &[u8]) -> Result<UploadedFile>;

    /// # Errors
    /// Returns an error when the object name is malformed or the blob cannot be read.
    fn get(&self, object_name: &str) -> Result<Option<Vec<u8>>>;
}

/// Writes objects to `<root>/procedures/<ulid>.<ext>` and publishes them under
/// `<public_base_url>/procedures/`.
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl FsObjectStorage {
    #[must_use]
    pub fn new(root: PathBuf, public_base_url: &str) -> Self {
        Self { root, public_base_url: public_base_url.trim_end_matches('/').to_string() }
    }

    fn bucket_dir(&self) -> PathBuf {
        self.root.join(PROCEDURE_BUCKET)
    }
}

impl ObjectStorage for FsObjectStorage {
    fn put(&self, file_name: &str, mime_type: &str, bytes: &[u8]) -> Result<UploadedFile> {
        let file_name = file_name.trim();
        if file_name.is_empty() {
            return Err(DomainError::Validation("file_name MUST be provided".to_string()).into());
        }

        let object_name = match safe_extension(file_name) {
            Some(ext) => format!("{}.{ext}", Ulid::new()),
            None => Ulid::new().to_string(),
        };
        let dir = self.bucket_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage directory {}", dir.display()))?;
        let path = dir.join(&object_name);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write object {}", path.display()))?;

        Ok(UploadedFile {
            file_url: format!("{}/{PROCEDURE_BUCKET}/{object_name}", self.public_base_url),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            object_name,
        })
    }

    fn get(&self, object_name: &str) -> Result<Option<Vec<u8>>> {
        if !is_object_name(object_name) {
            return Err(DomainError::not_found("file", object_name).into());
        }
        let path = self.bucket_dir().join(object_name);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read object {}", path.display()))?;
        Ok(Some(bytes))
    }
}

fn safe_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|ch| ch.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
}

// Object names are generated by `put`: a ULID plus an optional alphanumeric extension.
fn is_object_name(name: &str) -> bool {
    let (stem, ext) = match name.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (name, None),
    };
    Ulid::from_string(stem).is_ok()
        && ext.map_or(true, |ext| !ext.is_empty() && ext.chars().all(|ch| ch.is_ascii_alphanumeric()))
}

/// Best-effort content type for serving a stored object back.
#[must_use]
pub fn mime_for_object(object_name: &str) -> &'static str {
    match safe_extension(object_name).as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") => "text/markdown; charset=utf-8",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("oraculo-storage-{}", Ulid::new()))
    }

    #[test]
    fn put_writes_under_bucket_and_builds_public_url() -> Result<()> {
        let root = temp_root();
        let storage = FsObjectStorage::new(root.clone(), "http://127.0.0.1:4020/v1/files/");

        let uploaded = storage.put("Manual de Reembolso.PDF", "application/pdf", b"%PDF-1.4")?;
        assert!(uploaded.object_name.ends_with(".pdf"));
        assert_eq!(
            uploaded.file_url,
            format!("http://127.0.0.1:4020/v1/files/procedures/{}", uploaded.object_name)
        );
        assert_eq!(uploaded.file_name, "Manual de Reembolso.PDF");
        assert_eq!(storage.get(&uploaded.object_name)?, Some(b"%PDF-1.4".to_vec()));

        let attachment = Attachment::from(uploaded);
        assert_eq!(attachment.mime_type, "application/pdf");

        let _ = fs::remove_dir_all(&root);
        Ok(())
    }

    #[test]
    fn blank_file_name_is_rejected() {
        let storage = FsObjectStorage::new(temp_root(), "http://localhost/files");
        let err = storage.put("  ", "text/plain", b"x");
        assert!(matches!(
            err.as_ref().map_err(anyhow::Error::downcast_ref::<DomainError>),
            Err(Some(DomainError::Validation(_)))
        ));
    }

    #[test]
    fn get_rejects_path_traversal_and_reports_missing() -> Result<()> {
        let storage = FsObjectStorage::new(temp_root(), "http://localhost/files");
        let traversal = storage.get("../secret.txt");
        assert!(matches!(
            traversal.as_ref().map_err(anyhow::Error::downcast_ref::<DomainError>),
            Err(Some(DomainError::NotFound { entity: "file", .. }))
        ));
        assert!(storage.get("a/b.pdf").is_err());
        assert_eq!(storage.get(&format!("{}.pdf", Ulid::new()))?, None);
        Ok(())
    }

    #[test]
    fn mime_lookup_falls_back_to_octet_stream() {
        assert_eq!(mime_for_object("01J.pdf"), "application/pdf");
        assert_eq!(mime_for_object("01J.bin"), "application/octet-stream");
        assert_eq!(mime_for_object("01J"), "application/octet-stream");
    }
}
