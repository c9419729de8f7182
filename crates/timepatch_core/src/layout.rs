//! LayeredFS output tree
//!
//! ```text
//! <output-root>/000400000008C600/
//!     romfs/patch.cpk
//!     code.bin
//!     exheader.bin
//! ```

use std::path::{Path, PathBuf};

use crate::entities::{FlatTarget, TITLE_ID};
use crate::error::Error;

/// Paths of the override tree below an output root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideLayout {
    title_dir: PathBuf,
}

impl OverrideLayout {
    pub fn new(output_root: &Path) -> Self {
        Self {
            title_dir: output_root.join(TITLE_ID),
        }
    }

    pub fn title_dir(&self) -> &Path {
        &self.title_dir
    }

    pub fn romfs_dir(&self) -> PathBuf {
        self.title_dir.join("romfs")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.romfs_dir().join("patch.cpk")
    }

    pub fn target_path(&self, target: FlatTarget) -> PathBuf {
        self.title_dir.join(target.output_file_name())
    }

    /// Create the title folder.
    pub async fn prepare(&self) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.title_dir).await?;
        Ok(())
    }

    /// Create (or truncate) the output archive file, including its folder.
    pub fn create_archive_file(&self) -> Result<std::fs::File, Error> {
        std::fs::create_dir_all(self.romfs_dir())?;
        Ok(std::fs::File::create(self.archive_path())?)
    }

    /// Write a patched flat target, replacing any previous output.
    pub async fn write_target(&self, target: FlatTarget, content: &[u8]) -> Result<PathBuf, Error> {
        let path = self.target_path(target);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }
}
