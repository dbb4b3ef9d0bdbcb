pub mod memory_blockstore;
pub mod readable_blockstore;
pub mod types;

pub use memory_blockstore::MemoryBlockstore;
pub use readable_blockstore::ReadableBlockstore;
pub use types::RepoStorage;
