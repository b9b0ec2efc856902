use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Atomically replace a file's contents.
///
/// Writes a sibling temp file, syncs it, then renames it over `path`, so a
/// crash mid-write leaves either the old state or the new one on disk.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_directory_exists(parent)?;
        }
    }

    let temp_path = path.with_extension("tmp");

    {
        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temporary file: {}", temp_path.display()))?;

        file.write_all(content)
            .with_context(|| format!("Failed to write temporary file: {}", temp_path.display()))?;

        file.sync_all().context("Failed to sync file to disk")?;
    }

    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {} to {}", temp_path.display(), path.display()))?;

    Ok(())
}

/// Create a directory and its parents if missing
pub fn ensure_directory_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }
    Ok(())
}

/// Create the data directory readable only by its owner; it holds PIN hashes
pub fn ensure_private_directory(path: &Path) -> Result<()> {
    ensure_directory_exists(path)?;
    set_file_permissions(path, 0o700)
}

/// Set file permissions to a specific mode (Unix only, no-op elsewhere)
pub fn set_file_permissions(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(path)
            .with_context(|| format!("Failed to get metadata for: {}", path.display()))?;

        let mut permissions = metadata.permissions();
        permissions.set_mode(mode);

        std::fs::set_permissions(path, permissions)
            .with_context(|| format!("Failed to set permissions for: {}", path.display()))?;
    }

    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }

    Ok(())
}
