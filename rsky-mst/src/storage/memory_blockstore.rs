use crate::block_map::{BlockMap, BlocksAndMissing};
use crate::storage::readable_blockstore::ReadableBlockstore;
use crate::storage::types::RepoStorage;
use anyhow::Result;
use lexicon_cid::Cid;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Debug, Default)]
pub struct MemoryBlockstore {
    pub blocks: Arc<RwLock<BlockMap>>,
}

impl MemoryBlockstore {
    pub async fn new(blocks: Option<BlockMap>) -> Self {
        let this = Self::default();
        if let Some(blocks) = blocks {
            let mut block_guard = this.blocks.write().await;
            block_guard.add_map(blocks);
        }
        this
    }

    pub async fn size(&self) -> usize {
        self.blocks.read().await.size()
    }
}

impl ReadableBlockstore for MemoryBlockstore {
    fn get_bytes<'a>(
        &'a self,
        cid: &'a Cid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let block_guard = self.blocks.read().await;
            Ok(block_guard.get(cid).cloned())
        })
    }

    fn has<'a>(
        &'a self,
        cid: Cid,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let block_guard = self.blocks.read().await;
            Ok(block_guard.has(&cid))
        })
    }

    fn get_blocks<'a>(
        &'a self,
        cids: Vec<Cid>,
    ) -> Pin<Box<dyn Future<Output = Result<BlocksAndMissing>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let block_guard = self.blocks.read().await;
            Ok(block_guard.get_many(cids))
        })
    }
}

impl RepoStorage for MemoryBlockstore {
    fn put_block<'a>(
        &'a self,
        cid: Cid,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let mut block_guard = self.blocks.write().await;
            block_guard.set(cid, bytes);
            Ok(())
        })
    }

    fn put_many<'a>(
        &'a self,
        to_put: BlockMap,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let mut block_guard = self.blocks.write().await;
            block_guard.add_map(to_put);
            Ok(())
        })
    }
}
