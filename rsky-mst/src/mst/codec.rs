/**
 * A couple notes on CBOR encoding:
 *
 * There are never two neighboring subtrees.
 * Therefore, we can represent a node as an array of
 * leaves & pointers to their right neighbor (possibly null),
 * along with a pointer to the left-most subtree (also possibly null).
 *
 * Most keys in a subtree will have overlap.
 * We do compression on prefixes by describing keys as:
 * - the length of the prefix that it shares in common with the preceding key
 * - the rest of the string
 *
 * For example:
 * If the first leaf in a tree is `bsky/posts/abcdefg` and the second is `bsky/posts/abcdehi`
 * Then the first will be described as `prefix: 0, key: 'bsky/posts/abcdefg'`,
 * and the second will be described as `prefix: 16, key: 'hi'.`
 *
 * Fields are declared in DAG-CBOR canonical key order so the encoded
 * map is byte-for-byte identical to other implementations.
 */
use crate::error::{MstError, Result};
use crate::ipld;
use lexicon_cid::Cid;
use sha2::{Digest, Sha256};
use std::fmt::{self, Debug, Formatter};

/// treeEntry are elements of nodeData's Entries.
#[derive(PartialEq, Clone, Deserialize, Serialize)]
pub struct TreeEntry {
    #[serde(with = "serde_bytes")]
    pub k: Vec<u8>, // remaining part of path/key (appended to "previous key")
    pub p: usize, // count of bytes shared with previous path/key in tree
    pub t: Option<Cid>, // [optional] pointer to lower-level subtree to the "right" of this path/key entry
    pub v: Cid,         // CID pointer at this path/key
}

impl Debug for TreeEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeEntry")
            .field("p", &self.p)
            .field("k", &String::from_utf8_lossy(&self.k))
            .field("v", &self.v.to_string())
            .field("t", &self.t.map(|cid| cid.to_string()))
            .finish()
    }
}

/// MST tree node as gets serialized to CBOR. Note that the CBOR fields are all
/// single-character.
#[derive(PartialEq, Clone, Deserialize, Serialize)]
pub struct NodeData {
    pub e: Vec<TreeEntry>, // ordered list of entries at this node
    pub l: Option<Cid>, // [optional] pointer to lower-level subtree to the "left" of this path/key
}

impl Debug for NodeData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeData")
            .field("l", &self.l.map(|cid| cid.to_string()))
            .field("e", &self.e)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CidAndBytes {
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

/// Turns node records into blocks and back.
pub trait NodeCodec: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, data: &NodeData) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<NodeData>;
    fn cid_for_bytes(&self, bytes: &[u8]) -> Result<Cid>;

    fn block_for(&self, data: &NodeData) -> Result<CidAndBytes> {
        let bytes = self.encode(data)?;
        let cid = self.cid_for_bytes(&bytes)?;
        Ok(CidAndBytes { cid, bytes })
    }
}

/// Digest used to place keys on layers.
pub trait KeyHasher: Send + Sync {
    fn name(&self) -> &'static str;
    fn digest(&self, key: &[u8]) -> Vec<u8>;
}

/// DAG-CBOR nodes addressed by CIDv1 + SHA2-256, as atproto repositories use.
#[derive(Debug, Clone, Copy, Default)]
pub struct DagCborCodec;

impl NodeCodec for DagCborCodec {
    fn name(&self) -> &'static str {
        "dag-cbor"
    }

    fn encode(&self, data: &NodeData) -> Result<Vec<u8>> {
        ipld::struct_to_cbor(data)
    }

    fn decode(&self, bytes: &[u8]) -> Result<NodeData> {
        serde_ipld_dagcbor::from_slice(bytes)
            .map_err(|error| MstError::MalformedNode(format!("undecodable node: {error}")))
    }

    fn cid_for_bytes(&self, bytes: &[u8]) -> Result<Cid> {
        ipld::cid_for_bytes(ipld::DAG_CBOR_CODEC, bytes)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hasher;

impl KeyHasher for Sha256Hasher {
    fn name(&self) -> &'static str {
        "sha2-256"
    }

    fn digest(&self, key: &[u8]) -> Vec<u8> {
        Sha256::digest(key).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid1() -> Cid {
        Cid::try_from("bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454").unwrap()
    }

    #[test]
    fn empty_node_has_well_known_cid() -> anyhow::Result<()> {
        let block = DagCborCodec.block_for(&NodeData {
            e: vec![],
            l: None,
        })?;
        assert_eq!(
            block.cid.to_string(),
            "bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm"
        );
        // {"e": [], "l": null}
        assert_eq!(block.bytes, vec![0xa2, 0x61, 0x65, 0x80, 0x61, 0x6c, 0xf6]);
        Ok(())
    }

    #[test]
    fn decodes_what_it_encodes() -> anyhow::Result<()> {
        let data = NodeData {
            l: Some(cid1()),
            e: vec![
                TreeEntry {
                    p: 0,
                    k: b"com.example.record/3jqfcqzm3fo2j".to_vec(),
                    v: cid1(),
                    t: None,
                },
                TreeEntry {
                    p: 29,
                    k: b"p2j".to_vec(),
                    v: cid1(),
                    t: Some(cid1()),
                },
            ],
        };
        let bytes = DagCborCodec.encode(&data)?;
        assert_eq!(DagCborCodec.decode(&bytes)?, data);
        Ok(())
    }

    #[test]
    fn rejects_garbage() {
        let result = DagCborCodec.decode(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(MstError::MalformedNode(_))));
    }
}
