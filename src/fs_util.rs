use std::fs;
use std::io;
use std::path::Path;

use tempfile::Builder;
use zip::ZipArchive;

use crate::error::HarvestError;
use crate::store::atomic_rename_dir;

fn open_archive(zip_path: &Path) -> Result<ZipArchive<fs::File>, HarvestError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| HarvestError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    ZipArchive::new(file)
        .map_err(|err| HarvestError::Archive(format!("{}: {err}", zip_path.display())))
}

/// Relative paths (`/`-separated) of every file member whose extension matches.
pub fn list_members(zip_path: &Path, extension: &str) -> Result<Vec<String>, HarvestError> {
    let extension = extension.trim_start_matches('.');
    let mut archive = open_archive(zip_path)?;
    let mut members = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        if entry.enclosed_name().is_none() {
            return Err(HarvestError::Archive(format!(
                "zip entry path traversal detected: {}",
                entry.name()
            )));
        }
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().replace('\\', "/");
        let matches = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if matches {
            members.push(name);
        }
    }
    members.sort();
    Ok(members)
}

/// Extracts the whole archive next to `target_dir`, then swaps it into place.
/// A failed extraction leaves any previous `target_dir` untouched.
pub fn extract_archive(zip_path: &Path, target_dir: &Path) -> Result<(), HarvestError> {
    let parent = target_dir.parent().ok_or_else(|| {
        HarvestError::Filesystem(format!("{} has no parent", target_dir.display()))
    })?;
    fs::create_dir_all(parent).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
    let staging = Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)
        .map_err(|err| HarvestError::Filesystem(err.to_string()))?;

    extract_zip(zip_path, staging.path())?;
    atomic_rename_dir(staging.path(), target_dir).map_err(|err| {
        HarvestError::Filesystem(format!("publish {}: {err}", target_dir.display()))
    })?;
    Ok(())
}

fn extract_zip(zip_path: &Path, target_dir: &Path) -> Result<(), HarvestError> {
    let mut archive = open_archive(zip_path)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(HarvestError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let mut outfile = fs::File::create(&entry_path)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        // Reading to the end verifies the member CRC.
        io::copy(&mut entry, &mut outfile)
            .map_err(|err| HarvestError::Archive(format!("{}: {err}", entry.name())))?;
    }
    Ok(())
}

pub fn validate_zip(zip_path: &Path) -> Result<(), HarvestError> {
    let mut archive = open_archive(zip_path)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| HarvestError::Archive(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| HarvestError::Archive(format!("{}: {err}", entry.name())))?;
    }
    Ok(())
}
