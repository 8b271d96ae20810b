/// Status packer
///
/// Keeps a workflow under the backing store's per-object size limit by
/// replacing its node map with a compressed encoding (zstd, then base64) once the
/// serialized workflow outgrows the threshold. Unpacking restores the exact node
/// map; node maps are ordered, so the round trip is byte-for-byte stable.

use crate::error::PackError;
use crate::workflow::types::{NodeStatus, PackedStatus, Workflow, WorkflowStatus};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const ZSTD_LEVEL: i32 = 3;

/// Default ceiling, matching a typical metadata store object limit
pub const DEFAULT_MAX_STATUS_SIZE: usize = 1024 * 1024;

/// Stateless codec for oversized status documents
#[derive(Debug, Clone, Copy)]
pub struct StatusPacker {
    max_size: usize,
}

impl Default for StatusPacker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATUS_SIZE)
    }
}

impl StatusPacker {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Size of the workflow as it would be written to the store
    pub fn encoded_size(workflow: &Workflow) -> Result<usize, PackError> {
        Ok(serde_json::to_vec(workflow)?.len())
    }

    /// Encode a node map
    pub fn pack_nodes(&self, nodes: &BTreeMap<String, NodeStatus>) -> Result<PackedStatus, PackError> {
        let raw = serde_json::to_vec(nodes)?;
        let compressed = zstd::encode_all(raw.as_slice(), ZSTD_LEVEL)
            .map_err(|e| PackError::Corrupt(format!("compression failed: {}", e)))?;
        Ok(PackedStatus {
            data: STANDARD.encode(compressed),
            raw_size: raw.len(),
            checksum: checksum(&raw),
        })
    }

    /// Decode a node map, verifying size and checksum
    pub fn unpack_nodes(&self, packed: &PackedStatus) -> Result<BTreeMap<String, NodeStatus>, PackError> {
        let compressed = STANDARD
            .decode(packed.data.as_bytes())
            .map_err(|e| PackError::Corrupt(format!("invalid base64: {}", e)))?;
        let raw = zstd::decode_all(compressed.as_slice())
            .map_err(|e| PackError::Corrupt(format!("decompression failed: {}", e)))?;
        if raw.len() != packed.raw_size {
            return Err(PackError::Corrupt(format!(
                "expected {} bytes, decoded {}",
                packed.raw_size,
                raw.len()
            )));
        }
        let actual = checksum(&raw);
        if actual != packed.checksum {
            return Err(PackError::Checksum {
                expected: packed.checksum.clone(),
                actual,
            });
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Packed copy of a status document
    pub fn pack(&self, status: &WorkflowStatus) -> Result<WorkflowStatus, PackError> {
        let mut packed = status.clone();
        if packed.compressed_nodes.is_none() {
            packed.compressed_nodes = Some(self.pack_nodes(&status.nodes)?);
            packed.nodes.clear();
        }
        Ok(packed)
    }

    /// Unpacked copy of a status document; a no-op when already unpacked
    pub fn unpack(&self, status: &WorkflowStatus) -> Result<WorkflowStatus, PackError> {
        let mut unpacked = status.clone();
        if let Some(packed) = unpacked.compressed_nodes.take() {
            unpacked.nodes = self.unpack_nodes(&packed)?;
        }
        Ok(unpacked)
    }

    /// Pack the workflow in place if it exceeds the threshold
    ///
    /// Returns whether packing happened. If the packed workflow is still over
    /// the limit the workflow is left untouched and `TooLarge` is returned.
    pub fn pack_workflow(&self, workflow: &mut Workflow) -> Result<bool, PackError> {
        let size = Self::encoded_size(workflow)?;
        if size <= self.max_size {
            return Ok(false);
        }
        if workflow.status.compressed_nodes.is_some() {
            return Err(PackError::TooLarge {
                size,
                limit: self.max_size,
            });
        }

        let packed = self.pack_nodes(&workflow.status.nodes)?;
        let nodes = std::mem::take(&mut workflow.status.nodes);
        workflow.status.compressed_nodes = Some(packed);

        let packed_size = Self::encoded_size(workflow)?;
        if packed_size > self.max_size {
            workflow.status.compressed_nodes = None;
            workflow.status.nodes = nodes;
            tracing::warn!(
                "📦 Workflow {} still {} bytes after packing (limit {})",
                workflow.metadata.key(),
                packed_size,
                self.max_size
            );
            return Err(PackError::TooLarge {
                size: packed_size,
                limit: self.max_size,
            });
        }

        tracing::info!(
            "📦 Packed status of {}: {} -> {} bytes",
            workflow.metadata.key(),
            size,
            packed_size
        );
        Ok(true)
    }

    /// Restore the node map in place; returns whether anything was unpacked
    pub fn unpack_workflow(&self, workflow: &mut Workflow) -> Result<bool, PackError> {
        match workflow.status.compressed_nodes.take() {
            Some(packed) => match self.unpack_nodes(&packed) {
                Ok(nodes) => {
                    workflow.status.nodes = nodes;
                    Ok(true)
                }
                Err(e) => {
                    workflow.status.compressed_nodes = Some(packed);
                    Err(e)
                }
            },
            None => Ok(false),
        }
    }
}

/// hex SHA-256 of raw bytes
pub fn checksum(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}
