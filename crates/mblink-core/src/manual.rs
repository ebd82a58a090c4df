// ── Manual download fallback ──
//
// Where the program goes when it cannot be flashed over USB. The user
// copies the saved file onto the MICROBIT drive by hand.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mblink_api::HexData;
use tracing::info;

use crate::error::CoreError;

/// Receives a program that could not be flashed automatically.
#[async_trait]
pub trait ManualDownload: Send + Sync {
    async fn offer(&self, hex: &HexData) -> Result<(), CoreError>;
}

/// Saves `<name>.hex` into a directory.
#[derive(Debug, Clone)]
pub struct SaveToDirectory {
    dir: PathBuf,
}

impl SaveToDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where a program with this name is written.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.hex", file_stem(name)))
    }
}

#[async_trait]
impl ManualDownload for SaveToDirectory {
    async fn offer(&self, hex: &HexData) -> Result<(), CoreError> {
        let path = self.path_for(&hex.name);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| CoreError::Io {
                path: self.dir.clone(),
                source,
            })?;
        tokio::fs::write(&path, hex.hex.as_bytes())
            .await
            .map_err(|source| CoreError::Io {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "saved program for manual download");
        Ok(())
    }
}

/// Program names are user text; keep them to one safe path component.
fn file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | ' ') { c } else { '-' })
        .collect();
    let stem = stem.trim_matches(|c| c == '-' || c == ' ');
    if stem.is_empty() { "microbit".into() } else { stem.to_owned() }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn program(name: &str) -> HexData {
        HexData {
            name: name.into(),
            hex: ":020000040000FA\n:00000001FF\n".into(),
        }
    }

    #[test]
    fn names_become_single_path_components() {
        assert_eq!(file_stem("gesture model"), "gesture model");
        assert_eq!(file_stem("../../etc/passwd"), "etc-passwd");
        assert_eq!(file_stem("  "), "microbit");
        assert_eq!(file_stem("wave:shake"), "wave-shake");
    }

    #[tokio::test]
    async fn writes_hex_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SaveToDirectory::new(dir.path().join("downloads"));

        sink.offer(&program("my model")).await.unwrap();

        let saved = std::fs::read_to_string(dir.path().join("downloads/my model.hex")).unwrap();
        assert!(saved.ends_with(":00000001FF\n"));
    }

    #[tokio::test]
    async fn unwritable_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();
        let sink = SaveToDirectory::new(&blocker);

        let err = sink.offer(&program("x")).await.unwrap_err();
        assert!(matches!(err, CoreError::Io { .. }), "{err}");
    }
}
