use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::domain::GroupKey;
use crate::error::HarvestError;
use crate::store::{Relocator, Store};
use crate::tool::{Ogr2Ogr, ToolRunner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReceipt {
    pub artifact: Utf8PathBuf,
    pub source_count: u64,
    pub bytes: u64,
}

/// Fan-in: accumulates every member of a group into one artifact inside a private
/// scratch workspace, then publishes it through the relocator.
pub struct MergeEngine<'a, R, M> {
    tool: &'a Ogr2Ogr<R>,
    store: &'a Store,
    relocator: &'a M,
}

impl<'a, R, M> MergeEngine<'a, R, M>
where
    R: ToolRunner,
    M: Relocator,
{
    pub fn new(tool: &'a Ogr2Ogr<R>, store: &'a Store, relocator: &'a M) -> Self {
        Self {
            tool,
            store,
            relocator,
        }
    }

    /// Either the whole group is published or nothing reaches the destination.
    pub fn merge_group(
        &self,
        group: &GroupKey,
        members: &[Utf8PathBuf],
    ) -> Result<MergeReceipt, HarvestError> {
        let Some((first, rest)) = members.split_first() else {
            return Err(HarvestError::InvalidGroup(format!("{group} has no members")));
        };

        let scratch_root = self.store.merge_scratch_dir();
        std::fs::create_dir_all(scratch_root.as_std_path())
            .map_err(|err| HarvestError::ScratchCollision(format!("{scratch_root}: {err}")))?;
        let workspace = Builder::new()
            .prefix(&format!("{group}-"))
            .tempdir_in(scratch_root.as_std_path())
            .map_err(|err| HarvestError::ScratchCollision(format!("{scratch_root}: {err}")))?;
        let workspace_path = Utf8Path::from_path(workspace.path()).ok_or_else(|| {
            HarvestError::ScratchCollision(format!(
                "non UTF-8 workspace path {}",
                workspace.path().display()
            ))
        })?;
        let output = workspace_path.join(format!("{group}.{}", self.store.artifact_ext()));
        if output.exists() {
            return Err(HarvestError::ScratchCollision(output.to_string()));
        }

        let layer = group.as_str();
        let probed = self.tool.probe(first)?;
        self.tool.seed(first, &output, layer, &probed)?;
        tracing::debug!(group = %group, member = %first, "seeded merge output");

        for (idx, member) in rest.iter().enumerate() {
            let probed = self.tool.probe(member)?;
            self.tool.append(member, &output, layer, &probed)?;
            tracing::debug!(
                group = %group,
                member = %member,
                appended = idx + 2,
                total = members.len(),
                "appended to merge output"
            );
        }

        if !output.exists() {
            return Err(HarvestError::ToolFailed {
                program: self.tool.config().ogr2ogr.clone(),
                message: format!("no merge output produced for {group}"),
            });
        }

        let destination = self.store.merge_path(group);
        let bytes = self.relocator.relocate(&output, &destination)?;
        Ok(MergeReceipt {
            artifact: destination,
            source_count: members.len() as u64,
            bytes,
        })
    }
}
