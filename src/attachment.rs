use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::matching::audio_message_transfer_name;

pub const MAX_NAME_LENGTH: usize = 255;

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("attachment not found: {0}")]
    Missing(PathBuf),

    #[error("invalid attachment name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("conversion failed: {0}")]
    Conversion(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Format normalization applied while staging.
#[async_trait::async_trait]
pub trait MediaConverter: Send + Sync {
    /// Writes `source` re-encoded for an audio message to `dest`.
    async fn convert_audio_message(
        &self,
        source: &Path,
        dest: &Path,
    ) -> Result<(), AttachmentError>;
}

/// Copies bytes unchanged and lets the platform re-encode.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyConverter;

#[async_trait::async_trait]
impl MediaConverter for CopyConverter {
    async fn convert_audio_message(
        &self,
        source: &Path,
        dest: &Path,
    ) -> Result<(), AttachmentError> {
        tokio::fs::copy(source, dest).await?;
        Ok(())
    }
}

/// A private copy of an attachment, ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    pub path: PathBuf,
    pub original_name: String,
    pub transfer_name: String,
    pub is_audio_message: bool,
    dir: PathBuf,
}

impl StagedAttachment {
    pub fn was_renamed(&self) -> bool {
        self.original_name != self.transfer_name
    }
}

pub struct AttachmentStager {
    staging_dir: PathBuf,
    converter: Arc<dyn MediaConverter>,
}

impl AttachmentStager {
    pub fn new(staging_dir: impl Into<PathBuf>, converter: Arc<dyn MediaConverter>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            converter,
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Copies `source` into a fresh directory under the staging root,
    /// converting and renaming audio messages on the way.
    pub async fn stage(
        &self,
        source: &Path,
        name: Option<&str>,
        is_audio_message: bool,
    ) -> Result<StagedAttachment, AttachmentError> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|_| AttachmentError::Missing(source.to_path_buf()))?;
        if !metadata.is_file() {
            return Err(AttachmentError::Missing(source.to_path_buf()));
        }

        let original_name = match name {
            Some(n) => n.to_string(),
            None => source
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| AttachmentError::InvalidName {
                    name: source.display().to_string(),
                    reason: "source has no usable file name".into(),
                })?,
        };
        validate_name(&original_name)?;

        let rewritten = if is_audio_message {
            audio_message_transfer_name(&original_name)
        } else {
            None
        };
        let transfer_name = rewritten.clone().unwrap_or_else(|| original_name.clone());

        let dir = self.staging_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let dest = dir.join(&transfer_name);

        let copied = if rewritten.is_some() {
            self.converter.convert_audio_message(source, &dest).await
        } else {
            tokio::fs::copy(source, &dest).await.map(|_| ()).map_err(AttachmentError::from)
        };
        if let Err(e) = copied {
            remove_staging_dir(&dir).await;
            return Err(e);
        }

        debug!(path = %dest.display(), %transfer_name, "attachment staged");
        Ok(StagedAttachment {
            path: dest,
            original_name,
            transfer_name,
            is_audio_message,
            dir,
        })
    }

    /// Deletes the staged copy.
    pub async fn cleanup(&self, staged: &StagedAttachment) {
        remove_staging_dir(&staged.dir).await;
    }
}

async fn remove_staging_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "failed to remove staged attachment");
    }
}

fn validate_name(name: &str) -> Result<(), AttachmentError> {
    let invalid = |reason: &str| AttachmentError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(invalid("name is too long"));
    }
    if name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(invalid("name cannot contain path components"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("name contains control characters"));
    }
    Ok(())
}
