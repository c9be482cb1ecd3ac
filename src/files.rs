use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use tokio::fs;
use uuid::Uuid;

use crate::error::FileError;

/// Public URL prefix attachments are served under, independent of where
/// they land on disk.
pub const PUBLIC_PREFIX: &str = "/uploads/messages";

/// File storage collaborator: takes decoded attachment bytes, hands back a
/// stable reference URL.
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub async fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(UploadStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Decode a browser data-URL (`data:<mime>;base64,<payload>`), write the
    /// payload to disk under a collision-free name, and return its URL.
    pub async fn save(&self, data: &str, filename: &str) -> Result<String, FileError> {
        let (_, payload) = data.split_once(',').ok_or(FileError::MalformedDataUrl)?;
        let bytes = BASE64.decode(payload).map_err(|_| FileError::BadEncoding)?;
        if bytes.is_empty() {
            return Err(FileError::Empty);
        }

        let stored_name = format!("{}_{}", Uuid::new_v4(), filename.replace(' ', "_"));
        let path = self.dir.join(&stored_name);
        fs::write(&path, &bytes).await?;
        info!("stored attachment {stored_name} ({} bytes)", bytes.len());

        Ok(format!("{PUBLIC_PREFIX}/{stored_name}"))
    }
}
