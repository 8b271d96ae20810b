/// Status persistence around the resource store
///
/// `dehydrate` runs before every workflow write and `hydrate` after every read,
/// so the controller and API only ever see complete node maps while the store
/// only ever sees documents under its size limit. `commit` runs after a write
/// was accepted: offloaded versions are only collected once no stored document
/// can point at them.

use crate::error::{EngineError, PackError, Result};
use crate::persist::offload::OffloadRepository;
use crate::workflow::{packer::StatusPacker, types::Workflow};

#[derive(Debug, Clone)]
pub struct StatusPersister {
    packer: StatusPacker,
    offload: Option<OffloadRepository>,
}

impl StatusPersister {
    /// `offload` enables the relational fallback for maps compression cannot shrink enough
    pub fn new(packer: StatusPacker, offload: Option<OffloadRepository>) -> Self {
        Self { packer, offload }
    }

    pub fn packer(&self) -> &StatusPacker {
        &self.packer
    }

    /// Shrink a hydrated workflow until it fits the store
    ///
    /// Tries compression first, then offload when enabled. Fails with
    /// `Capacity` when neither is enough.
    pub async fn dehydrate(&self, workflow: &mut Workflow) -> Result<()> {
        match self.packer.pack_workflow(workflow) {
            Ok(_) => Ok(()),
            Err(PackError::TooLarge { size, limit }) => {
                let Some(offload) = &self.offload else {
                    return Err(EngineError::Capacity { size, limit });
                };

                let meta = &workflow.metadata;
                let version = offload
                    .save(&meta.namespace, &meta.uid, &workflow.status.nodes)
                    .await?;

                tracing::info!(
                    "💾 Offloaded node status of {} ({} nodes, version {})",
                    meta.key(),
                    workflow.status.nodes.len(),
                    version
                );
                workflow.status.nodes.clear();
                workflow.status.compressed_nodes = None;
                workflow.status.offload_node_status_version = Some(version);

                let size = StatusPacker::encoded_size(workflow)?;
                if size > self.packer.max_size() {
                    return Err(EngineError::Capacity {
                        size,
                        limit: self.packer.max_size(),
                    });
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Collect offloaded versions the just-written document no longer references
    ///
    /// Call only with the document the store accepted; a write that lost a
    /// version race must not collect anything.
    pub async fn commit(&self, written: &Workflow) -> Result<u64> {
        let Some(offload) = &self.offload else {
            return Ok(0);
        };
        let meta = &written.metadata;
        let removed = match &written.status.offload_node_status_version {
            Some(version) => offload.gc(&meta.namespace, &meta.uid, version).await?,
            None => offload.delete_all(&meta.namespace, &meta.uid).await?,
        };
        if removed > 0 {
            tracing::debug!("🧹 Collected {} stale node status versions of {}", removed, meta.key());
        }
        Ok(removed)
    }

    /// Restore the full node map; a no-op on an already hydrated workflow
    pub async fn hydrate(&self, workflow: &mut Workflow) -> Result<()> {
        self.packer.unpack_workflow(workflow)?;

        if let Some(version) = workflow.status.offload_node_status_version.clone() {
            let offload = self.offload.as_ref().ok_or_else(|| {
                EngineError::Infrastructure(format!(
                    "workflow {} has offloaded node status but offload is disabled",
                    workflow.metadata.key()
                ))
            })?;
            let meta = &workflow.metadata;
            workflow.status.nodes = offload.load(&meta.namespace, &meta.uid, &version).await?;
            workflow.status.offload_node_status_version = None;
        }
        Ok(())
    }

    /// Forget any offloaded node maps of a workflow that is going away
    pub async fn release(&self, workflow: &Workflow) -> Result<()> {
        if let Some(offload) = &self.offload {
            offload
                .delete_all(&workflow.metadata.namespace, &workflow.metadata.uid)
                .await?;
        }
        Ok(())
    }
}
