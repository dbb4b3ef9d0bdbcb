use super::codec::{NodeData, TreeEntry};
use super::{Leaf, NodeEntry, NodeRef};
use crate::config::MstConfig;
use crate::error::{MstError, Result};
use crate::ipld;
use crate::storage::types::RepoStorage;
use lazy_static::lazy_static;
use lexicon_cid::Cid;
use rand::{thread_rng, Rng};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub const MAX_KEY_LEN: usize = 1024;

fn is_valid_chars(input: &str) -> bool {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^[a-zA-Z0-9_~\-:.]+$").expect("key charset regex");
    }
    RE.is_match(input)
}

// * Restricted to a subset of ASCII characters. The allowed characters are
// alphanumeric (A-Za-z0-9), period, dash, underscore, colon, or tilde (.-_:~)
// * Exactly one `/`, with a non-empty collection before it and a non-empty record key after it
// * At most 1024 bytes in total
pub fn is_valid_mst_key(key: &str) -> bool {
    if key.len() > MAX_KEY_LEN {
        return false;
    }
    match key.split_once('/') {
        Some((collection, rkey)) => is_valid_chars(collection) && is_valid_chars(rkey),
        None => false,
    }
}

pub fn ensure_valid_mst_key(key: &str) -> Result<()> {
    match is_valid_mst_key(key) {
        true => Ok(()),
        false => Err(MstError::InvalidKey(key.to_string())),
    }
}

/// Counts leading zeros of the digest two bits at a time, giving ~4 fanout.
pub fn layer_for_digest(hash: &[u8]) -> u32 {
    let mut leading_zeros = 0;
    for byte in hash {
        if *byte < 64 {
            leading_zeros += 1
        };
        if *byte < 16 {
            leading_zeros += 1
        };
        if *byte < 4 {
            leading_zeros += 1
        };
        if *byte == 0 {
            leading_zeros += 1;
        } else {
            break;
        }
    }
    leading_zeros
}

pub fn leading_zeros_on_hash(key: &[u8]) -> u32 {
    layer_for_digest(Sha256::digest(key).as_slice())
}

/// Length of the common prefix, in bytes
pub fn count_prefix_len(a: &str, b: &str) -> usize {
    a.bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

pub fn serialize_node_data(entries: &[NodeEntry], config: &MstConfig) -> Result<NodeData> {
    let mut data = NodeData {
        e: Vec::new(),
        l: None,
    };
    let mut i = 0;
    if let Some(NodeEntry::Tree(tree)) = entries.first() {
        i += 1;
        data.l = Some(tree.pointer(config)?);
    }
    let mut last_key = "";
    while i < entries.len() {
        let leaf = match &entries[i] {
            NodeEntry::Leaf(leaf) => leaf,
            NodeEntry::Tree(_) => {
                return Err(MstError::MalformedNode(
                    "two subtrees next to each other".to_string(),
                ))
            }
        };
        i += 1;
        let mut subtree: Option<Cid> = None;
        if let Some(NodeEntry::Tree(tree)) = entries.get(i) {
            subtree = Some(tree.pointer(config)?);
            i += 1;
        }
        ensure_valid_mst_key(&leaf.key)?;
        let prefix_len = count_prefix_len(last_key, &leaf.key);
        data.e.push(TreeEntry {
            k: leaf.key.as_bytes()[prefix_len..].to_vec(),
            p: prefix_len,
            t: subtree,
            v: leaf.value,
        });
        last_key = &leaf.key;
    }
    Ok(data)
}

/// Rebuilds the entries of a node, checking every invariant a well-formed
/// node satisfies. Returns the entries and the layer of the node, if known.
///
/// `layer` is the layer the parent expects this node to be on; subtrees
/// found here are handed `layer - 1`.
pub fn deserialize_node_data(
    data: &NodeData,
    layer: Option<u32>,
    config: &MstConfig,
) -> Result<(Vec<NodeEntry>, Option<u32>)> {
    let mut keys: Vec<String> = Vec::with_capacity(data.e.len());
    let mut last_key: Vec<u8> = Vec::new();
    for entry in &data.e {
        if entry.p > last_key.len() {
            return Err(MstError::MalformedNode(format!(
                "prefix length {} is longer than the previous key",
                entry.p
            )));
        }
        let mut key_bytes = last_key[..entry.p].to_vec();
        key_bytes.extend_from_slice(&entry.k);
        let key = String::from_utf8(key_bytes)
            .map_err(|_| MstError::MalformedNode("key is not valid utf-8".to_string()))?;
        if !is_valid_mst_key(&key) {
            return Err(MstError::MalformedNode(format!("invalid key `{key}`")));
        }
        if let Some(prev) = keys.last() {
            if key.as_str() <= prev.as_str() {
                return Err(MstError::MalformedNode(format!(
                    "keys out of order: `{prev}` then `{key}`"
                )));
            }
        }
        last_key = key.as_bytes().to_vec();
        keys.push(key);
    }

    let mut layer = layer;
    for key in &keys {
        let key_layer = config.layer_for_key(key);
        match layer {
            None => layer = Some(key_layer),
            Some(expected) if expected != key_layer => {
                return Err(MstError::MalformedNode(format!(
                    "key `{key}` belongs on layer {key_layer}, node is on layer {expected}"
                )))
            }
            Some(_) => (),
        }
    }

    let has_subtrees = data.l.is_some() || data.e.iter().any(|entry| entry.t.is_some());
    let child_layer = match layer {
        Some(0) if has_subtrees => {
            return Err(MstError::MalformedNode(
                "node on layer 0 points to a subtree".to_string(),
            ))
        }
        Some(layer) => layer.checked_sub(1),
        None => None,
    };
    let subtree = |pointer: Cid| {
        NodeEntry::Tree(NodeRef::Unresolved {
            pointer,
            layer: child_layer,
        })
    };

    let mut entries: Vec<NodeEntry> = Vec::with_capacity(data.e.len() * 2 + 1);
    if let Some(l) = data.l {
        entries.push(subtree(l));
    }
    for (entry, key) in data.e.iter().zip(keys) {
        entries.push(NodeEntry::Leaf(Leaf {
            key,
            value: entry.v,
        }));
        if let Some(t) = entry.t {
            entries.push(subtree(t));
        }
    }
    Ok((entries, layer))
}

pub fn short_cid(cid: &Cid) -> String {
    let cid = cid.to_string();
    match cid.len() {
        len if len > 8 => cid[len - 8..].to_string(),
        _ => cid,
    }
}

pub type IdMapping = BTreeMap<String, Cid>;

pub async fn random_cid(storage: Option<&dyn RepoStorage>) -> Result<Cid> {
    let mut record = BTreeMap::new();
    record.insert("test".to_string(), random_str(50));
    let cid = ipld::cid_for_cbor(&record)?;
    if let Some(storage) = storage {
        storage
            .put_block(cid, ipld::struct_to_cbor(&record)?)
            .await?;
    }
    Ok(cid)
}

pub async fn generate_bulk_data_keys(
    count: usize,
    storage: Option<&dyn RepoStorage>,
) -> Result<IdMapping> {
    let mut obj: IdMapping = BTreeMap::new();
    while obj.len() < count {
        let key = format!("com.example.record/{}", random_str(13));
        obj.insert(key, random_cid(storage).await?);
    }
    Ok(obj)
}

pub fn random_str(len: usize) -> String {
    const CHARSET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
    let charset_len = CHARSET.len();
    let mut rng = thread_rng();

    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..charset_len);
            CHARSET[idx] as char
        })
        .collect()
}
