//! Moving and checking the rendered output file.

use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{MediaError, MediaResult};

/// Move the finished render to its destination.
///
/// Tries a rename first. When the job temp directory lives on another
/// filesystem (EXDEV) the file is copied next to the destination under a
/// `.partial` name and renamed into place.
pub async fn move_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MediaResult<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();

    ensure_parent_dir(dst).await?;

    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device_error(&e) => {
            tracing::debug!(
                src = %src.display(),
                dst = %dst.display(),
                "Output is on another filesystem, copying"
            );
            copy_and_delete(src, dst).await
        }
        Err(e) => Err(MediaError::from(e)),
    }
}

/// Create the parent directory of `path` when missing.
pub async fn ensure_parent_dir(path: &Path) -> MediaResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !fs::try_exists(parent).await.unwrap_or(false) {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

/// Fail with `OutputValidation` unless `path` is a non-empty file.
pub async fn validate_output_file(path: &Path) -> MediaResult<u64> {
    let metadata = fs::metadata(path)
        .await
        .map_err(|_| MediaError::output_invalid(path, "file does not exist"))?;
    if !metadata.is_file() {
        return Err(MediaError::output_invalid(path, "not a regular file"));
    }
    if metadata.len() == 0 {
        return Err(MediaError::output_invalid(path, "file is empty"));
    }
    Ok(metadata.len())
}

fn is_cross_device_error(e: &std::io::Error) -> bool {
    // EXDEV
    e.raw_os_error() == Some(18)
}

fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dst.with_file_name(name)
}

async fn copy_and_delete(src: &Path, dst: &Path) -> MediaResult<()> {
    let partial = partial_path(dst);

    if let Err(e) = fs::copy(src, &partial).await {
        tracing::error!(
            src = %src.display(),
            partial = %partial.display(),
            "Failed to copy output across filesystems: {}",
            e
        );
        let _ = fs::remove_file(&partial).await;
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&partial, dst).await {
        let _ = fs::remove_file(&partial).await;
        return Err(e.into());
    }

    if let Err(e) = fs::remove_file(src).await {
        tracing::warn!(src = %src.display(), "Failed to remove source after copy: {}", e);
    }
    Ok(())
}
