//! Crash-consistent file replacement for the on-disk store.
//!
//! A file is written to a sibling temp file, synced, then renamed over the
//! target, so readers see either the old or the new contents.

use std::path::{Path, PathBuf};

use rand::RngCore;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::BlockServerResult;

/// Suffix of temp files; a crash can leave these behind.
pub const TEMP_SUFFIX: &str = ".tmp";

fn temp_path(target: &Path) -> PathBuf {
    let mut tag = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut tag);
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}{}", name, hex::encode(tag), TEMP_SUFFIX))
}

/// Replace `target` with `contents` atomically.
pub async fn write_atomic(target: &Path, contents: &[u8]) -> BlockServerResult<()> {
    let tmp = temp_path(target);
    let result: std::io::Result<()> = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, target).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!(path = %target.display(), bytes = contents.len(), "atomic write");
    Ok(())
}

/// True for leftovers of an interrupted [`write_atomic`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("refs");
        write_atomic(&target, b"first").await.unwrap();
        write_atomic(&target, b"second").await.unwrap();
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"second");

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name());
        }
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_write_atomic_missing_dir_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("missing").join("data");
        assert!(write_atomic(&target, b"x").await.is_err());
    }

    #[test]
    fn test_temp_file_detection() {
        let tmp = temp_path(Path::new("/a/b/data"));
        assert!(is_temp_file(&tmp));
        assert!(!is_temp_file(Path::new("/a/b/data")));
    }
}
