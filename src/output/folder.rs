use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageError, ImageFormat};

use super::OutputSink;
use crate::error::{Result, SessionError};

/// Writes `<root>/<label>/<n>.png`, numbering files per label directory
pub struct LabelFolderSink {
    root: PathBuf,
}

impl LabelFolderSink {
    /// The root must already exist as a directory
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let meta = fs::metadata(root).map_err(|e| SessionError::io(root, e))?;
        if !meta.is_dir() {
            return Err(SessionError::io(
                root,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "save root is not a directory",
                ),
            ));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn label_dir(&self, label: &str) -> Result<PathBuf> {
        let label = label.trim();
        if label.is_empty() {
            return Err(SessionError::Precondition("save label is empty".to_string()));
        }
        if label.contains(['/', '\\']) || label == "." || label == ".." {
            return Err(SessionError::Precondition(format!(
                "save label '{label}' is not a plain directory name"
            )));
        }
        Ok(self.root.join(label))
    }
}

impl OutputSink for LabelFolderSink {
    fn write_image(&mut self, label: &str, image: &DynamicImage) -> Result<PathBuf> {
        let dir = self.label_dir(label)?;
        fs::create_dir_all(&dir).map_err(|e| SessionError::io(&dir, e))?;

        let existing = fs::read_dir(&dir)
            .map_err(|e| SessionError::io(&dir, e))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count();

        let path = dir.join(format!("{existing}.png"));
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| match e {
                ImageError::IoError(source) => SessionError::io(&path, source),
                other => SessionError::Image(other),
            })?;

        tracing::info!("Saved {}", path.display());
        Ok(path)
    }
}
