//! The generator boundary.
//!
//! The generator owns the block-template subsystem and the RPC link to
//! the full node. It pushes `WorkbaseTemplate` snapshots into the
//! stratifier and takes candidate blocks back.

use async_trait::async_trait;
use serde::Serialize;

/// Metadata accompanying a candidate block submission.
#[derive(Debug, Clone, Serialize)]
pub struct BlockMeta {
    pub height: u64,
    pub workbase_id: u64,
    pub workername: String,
    pub share_diff: f64,
    pub hash_hex: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Submit a serialized candidate block. Returns whether the node
    /// accepted it; transport failures bubble up as errors.
    async fn submit_block(&self, block_hex: String, meta: BlockMeta) -> anyhow::Result<bool>;
}

/// Generator stub that records submissions; used by tests.
#[derive(Debug, Default)]
pub struct NullGenerator {
    submissions: parking_lot::Mutex<Vec<BlockMeta>>,
}

impl NullGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<BlockMeta> {
        self.submissions.lock().clone()
    }
}

#[async_trait]
impl Generator for NullGenerator {
    async fn submit_block(&self, _block_hex: String, meta: BlockMeta) -> anyhow::Result<bool> {
        self.submissions.lock().push(meta);
        Ok(true)
    }
}
