use lexicon_cid::Cid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MstError {
    #[error("invalid mst key `{0}`")]
    InvalidKey(String),
    #[error("could not find a record with key `{0}`")]
    KeyNotFound(String),
    #[error("there is already a value at key `{0}`")]
    KeyExists(String),
    #[error("malformed mst node: {0}")]
    MalformedNode(String),
    #[error("missing block `{0}`")]
    MissingBlock(Cid),
    #[error("could not encode mst node: {0}")]
    Encoding(String),
    #[error("invalid mst walk: {0}")]
    InvalidWalk(&'static str),
    /// Failure reported by the block store, passed through untouched
    #[error(transparent)]
    StorageUnavailable(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MstError>;
