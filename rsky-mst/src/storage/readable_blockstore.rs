use crate::block_map::BlocksAndMissing;
use crate::error::MstError;
use anyhow::Result;
use lexicon_cid::Cid;
use std::future::Future;
use std::pin::Pin;

pub trait ReadableBlockstore: Send + Sync {
    fn get_bytes<'a>(
        &'a self,
        cid: &'a Cid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send + Sync + 'a>>;
    fn has<'a>(
        &'a self,
        cid: Cid,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + Sync + 'a>>;
    fn get_blocks<'a>(
        &'a self,
        cids: Vec<Cid>,
    ) -> Pin<Box<dyn Future<Output = Result<BlocksAndMissing>> + Send + Sync + 'a>>;

    /// Like `get_bytes`, but an absent block is an error
    fn read_bytes<'a>(
        &'a self,
        cid: &'a Cid,
    ) -> Pin<Box<dyn Future<Output = crate::Result<Vec<u8>>> + Send + 'a>> {
        Box::pin(async move {
            self.get_bytes(cid)
                .await?
                .ok_or(MstError::MissingBlock(*cid))
        })
    }
}
