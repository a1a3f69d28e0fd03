use std::fs;
use std::io;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::config::{HarvestConfig, PathsConfig, PipelineConfig};
use crate::domain::{GroupKey, MemberKey, ProductName};
use crate::error::HarvestError;

/// Deterministic on-disk layout for every stage's artifacts.
#[derive(Debug, Clone)]
pub struct Store {
    paths: PathsConfig,
    archive_ext: String,
    artifact_ext: String,
}

impl Store {
    pub fn new(config: &HarvestConfig) -> Self {
        Self::new_with_paths(config.paths.clone(), &config.pipeline)
    }

    pub fn new_with_paths(paths: PathsConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            paths,
            archive_ext: pipeline.archive_extension.trim_start_matches('.').to_string(),
            artifact_ext: pipeline.artifact_extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    /// `{download_root}/{region}/{subregion}/{product}.{ext}`
    pub fn archive_path(&self, region: &str, subregion: &str, product: &ProductName) -> Utf8PathBuf {
        self.paths
            .download_root
            .join(region)
            .join(subregion)
            .join(format!("{product}.{}", self.archive_ext))
    }

    /// `{extract_root}/{product}`
    pub fn extract_dir(&self, product: &ProductName) -> Utf8PathBuf {
        self.paths.extract_root.join(product.as_str())
    }

    pub fn member_path(&self, member: &MemberKey) -> Utf8PathBuf {
        self.extract_dir(member.product()).join(member.member())
    }

    /// Converted artifact for a member; keeps the member's internal directory so stems
    /// from different folders of one archive never collide.
    pub fn transform_path(&self, member: &MemberKey) -> Utf8PathBuf {
        let mut path = self.paths.transform_root.join(member.product().as_str());
        let relative = Utf8Path::new(member.member());
        if let Some(parent) = relative.parent() {
            path.push(parent);
        }
        path.join(format!("{}.{}", member.stem(), self.artifact_ext))
    }

    pub fn merge_path(&self, group: &GroupKey) -> Utf8PathBuf {
        self.paths
            .merge_root
            .join(format!("{group}.{}", self.artifact_ext))
    }

    pub fn artifact_ext(&self) -> &str {
        &self.artifact_ext
    }

    /// Converter-internal temp directory (`CPL_TMPDIR`).
    pub fn tool_temp_dir(&self) -> Utf8PathBuf {
        self.paths.scratch_root.join("tool-tmp")
    }

    pub fn transform_scratch_dir(&self) -> Utf8PathBuf {
        self.paths.scratch_root.join("transform")
    }

    pub fn merge_scratch_dir(&self) -> Utf8PathBuf {
        self.paths.scratch_root.join("merge")
    }

    pub fn ensure_roots(&self) -> Result<(), HarvestError> {
        let roots = [
            self.paths.download_root.clone(),
            self.paths.extract_root.clone(),
            self.paths.transform_root.clone(),
            self.paths.merge_root.clone(),
            self.tool_temp_dir(),
            self.transform_scratch_dir(),
            self.merge_scratch_dir(),
        ];
        for root in roots {
            fs::create_dir_all(root.as_std_path())
                .map_err(|err| HarvestError::Filesystem(format!("create {root}: {err}")))?;
        }
        if let Some(parent) = self.paths.state_db.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(format!("create {parent}: {err}")))?;
        }
        Ok(())
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), HarvestError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Replaces `to` with the directory `from`. Both must live on the same volume.
pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    fs::rename(from, to)
}

/// Moves a finished artifact from scratch storage to its published location.
pub trait Relocator: Send + Sync {
    /// Returns the number of bytes published.
    fn relocate(&self, from: &Utf8Path, to: &Utf8Path) -> Result<u64, HarvestError>;
}

/// Copy, sync, delete source, verify. Never a bare rename, since scratch and
/// destination are routinely on different volumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRelocator;

impl Relocator for FsRelocator {
    fn relocate(&self, from: &Utf8Path, to: &Utf8Path) -> Result<u64, HarvestError> {
        let fail = |message: String| HarvestError::Relocation {
            from: from.to_string(),
            to: to.to_string(),
            message,
        };

        let expected = fs::metadata(from.as_std_path())
            .map_err(|err| fail(format!("stat source: {err}")))?
            .len();
        let parent = to
            .parent()
            .ok_or_else(|| fail("destination has no parent directory".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| fail(format!("create destination dir: {err}")))?;

        // Staged next to the destination so the final step is a same-volume rename.
        let staged = Builder::new()
            .prefix(".geo-harvest-publish")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| fail(format!("stage in destination dir: {err}")))?;
        {
            let mut source =
                fs::File::open(from.as_std_path()).map_err(|err| fail(format!("open source: {err}")))?;
            let mut target = staged.as_file();
            io::copy(&mut source, &mut target).map_err(|err| fail(format!("copy: {err}")))?;
            target
                .sync_all()
                .map_err(|err| fail(format!("sync staged copy: {err}")))?;
        }

        // `persist` replaces any previous artifact in one rename.
        staged
            .persist(to.as_std_path())
            .map_err(|err| fail(format!("publish staged copy: {}", err.error)))?;

        let actual = fs::metadata(to.as_std_path())
            .map_err(|err| fail(format!("stat destination: {err}")))?
            .len();
        if actual != expected {
            let _ = fs::remove_file(to.as_std_path());
            return Err(fail(format!(
                "verification failed: expected {expected} bytes, found {actual}"
            )));
        }

        // The destination is complete and verified; a leftover source is only scratch.
        if let Err(err) = fs::remove_file(from.as_std_path()) {
            tracing::warn!(source = %from, error = %err, "relocated source could not be removed");
        }
        Ok(actual)
    }
}
