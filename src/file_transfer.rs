//! Storage of files pushed by neighbors.

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::{info, warn};

use crate::message::FileMessage;

/// Writes received files below a directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store writing to `dir`. The directory is created on first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStore { dir: dir.into() }
    }

    /// Writes a received file, returning where it was written.
    ///
    /// Only the final component of the announced file name is kept, so a sender can never write outside of the
    /// store directory.
    pub async fn write(&self, file: &FileMessage) -> io::Result<PathBuf> {
        let name = sanitize_file_name(&file.file_name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid file name {:?}", file.file_name),
            )
        })?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, &file.content).await?;
        Ok(path)
    }

    /// Writes a received file on a background task.
    pub fn store(&self, file: FileMessage) {
        let store = self.clone();
        tokio::spawn(async move {
            match store.write(&file).await {
                Ok(path) => info!(
                    sender = %file.sender,
                    path = %path.display(),
                    len = file.content.len(),
                    "received file"
                ),
                Err(err) => warn!(
                    sender = %file.sender,
                    file_name = %file.file_name,
                    "failed to store received file: {err}"
                ),
            }
        });
    }
}

/// Returns the final path component of a file name, if it names a regular file.
pub fn sanitize_file_name(file_name: &str) -> Option<&str> {
    Path::new(file_name)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
}
