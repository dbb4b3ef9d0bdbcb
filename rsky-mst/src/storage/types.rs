use crate::block_map::BlockMap;
use crate::storage::readable_blockstore::ReadableBlockstore;
use anyhow::Result;
use lexicon_cid::Cid;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

pub trait RepoStorage: ReadableBlockstore + Send + Sync + Debug {
    // Writeable
    fn put_block<'a>(
        &'a self,
        cid: Cid,
        bytes: Vec<u8>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>>;
    fn put_many<'a>(
        &'a self,
        to_put: BlockMap,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>>;
}
