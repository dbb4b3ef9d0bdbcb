use crate::error::{MstError, Result};
use lexicon_cid::multihash::Multihash;
use lexicon_cid::Cid;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub const SHA2_256: u64 = 0x12;
pub const DAG_CBOR_CODEC: u64 = 0x71;

pub fn struct_to_cbor<T: Serialize>(obj: &T) -> Result<Vec<u8>> {
    serde_ipld_dagcbor::to_vec(obj).map_err(|error| MstError::Encoding(error.to_string()))
}

/// CIDv1 over a SHA2-256 multihash of `bytes`
pub fn cid_for_bytes(codec: u64, bytes: &[u8]) -> Result<Cid> {
    let hash = Sha256::digest(bytes);
    let multihash = Multihash::<64>::wrap(SHA2_256, hash.as_slice())
        .map_err(|error| MstError::Encoding(error.to_string()))?;
    Ok(Cid::new_v1(codec, multihash))
}

pub fn cid_for_cbor<T: Serialize>(data: &T) -> Result<Cid> {
    let bytes = struct_to_cbor(data)?;
    cid_for_bytes(DAG_CBOR_CODEC, &bytes)
}
