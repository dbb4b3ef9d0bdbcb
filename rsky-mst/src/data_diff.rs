use crate::block_map::BlockMap;
use crate::cid_set::CidSet;
use crate::config::MstConfig;
use crate::error::Result;
use crate::mst::diff::mst_diff;
use crate::mst::{NodeEntry, MST};
use lexicon_cid::Cid;
use std::collections::HashMap;
use std::fmt::Debug;

#[derive(Debug, Clone, PartialEq)]
pub struct DataAdd {
    pub key: String,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataUpdate {
    pub key: String,
    pub prev: Cid,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataDelete {
    pub key: String,
    pub cid: Cid,
}

/// Everything that changed between two versions of a tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataDiff {
    pub adds: HashMap<String, DataAdd>,
    pub updates: HashMap<String, DataUpdate>,
    pub deletes: HashMap<String, DataDelete>,

    pub new_mst_blocks: BlockMap,
    pub new_leaf_cids: CidSet,
    pub removed_cids: CidSet,
    pub removed_mst_blocks: CidSet,
}

impl DataDiff {
    pub fn new() -> Self {
        DataDiff {
            adds: HashMap::new(),
            updates: HashMap::new(),
            deletes: HashMap::new(),
            new_mst_blocks: BlockMap::new(),
            new_leaf_cids: CidSet::new(None),
            removed_cids: CidSet::new(None),
            removed_mst_blocks: CidSet::new(None),
        }
    }

    /// Changes that turn `prev` into `curr`. Without `prev`, everything in
    /// `curr` is new.
    pub async fn of(curr: &MST, prev: Option<&MST>) -> Result<DataDiff> {
        mst_diff(curr, prev).await
    }

    /// Records an entry of `tree` as new. Subtrees are recorded with their
    /// encoded block.
    pub async fn node_add(&mut self, tree: &MST, entry: &NodeEntry) -> Result<()> {
        match entry {
            NodeEntry::Leaf(leaf) => self.leaf_add(&leaf.key, leaf.value),
            NodeEntry::Tree(node) => {
                let block = tree.resolve(node).await?.block(tree.config())?;
                self.tree_add(block.cid, block.bytes);
            }
        }
        Ok(())
    }

    /// Records an entry as gone. Never fetches: subtrees only need their pointer.
    pub fn node_delete(&mut self, entry: &NodeEntry, config: &MstConfig) -> Result<()> {
        match entry {
            NodeEntry::Leaf(leaf) => self.leaf_delete(&leaf.key, leaf.value),
            NodeEntry::Tree(node) => self.tree_delete(node.pointer(config)?),
        }
        Ok(())
    }

    pub fn leaf_add(&mut self, key: &str, cid: Cid) {
        self.adds.insert(
            key.to_string(),
            DataAdd {
                key: key.to_string(),
                cid,
            },
        );
        if self.removed_cids.has(cid) {
            self.removed_cids.delete(cid);
        } else {
            self.new_leaf_cids.add(cid);
        }
    }

    pub fn leaf_update(&mut self, key: &str, prev: Cid, cid: Cid) {
        if prev == cid {
            return;
        }
        self.updates.insert(
            key.to_string(),
            DataUpdate {
                key: key.to_string(),
                prev,
                cid,
            },
        );
        self.removed_cids.add(prev);
        self.new_leaf_cids.add(cid);
    }

    pub fn leaf_delete(&mut self, key: &str, cid: Cid) {
        self.deletes.insert(
            key.to_string(),
            DataDelete {
                key: key.to_string(),
                cid,
            },
        );
        if self.new_leaf_cids.has(cid) {
            self.new_leaf_cids.delete(cid);
        } else {
            self.removed_cids.add(cid);
        }
    }

    pub fn tree_add(&mut self, cid: Cid, bytes: Vec<u8>) {
        if self.removed_cids.has(cid) {
            self.removed_cids.delete(cid);
            self.removed_mst_blocks.delete(cid);
        } else {
            self.new_mst_blocks.set(cid, bytes);
        }
    }

    pub fn tree_delete(&mut self, cid: Cid) {
        if self.new_mst_blocks.has(&cid) {
            self.new_mst_blocks.delete(&cid);
        } else {
            self.removed_cids.add(cid);
            self.removed_mst_blocks.add(cid);
        }
    }

    pub fn add_list(&self) -> Vec<DataAdd> {
        self.adds.values().cloned().collect()
    }

    pub fn update_list(&self) -> Vec<DataUpdate> {
        self.updates.values().cloned().collect()
    }

    pub fn delete_list(&self) -> Vec<DataDelete> {
        self.deletes.values().cloned().collect()
    }

    /// Node and value pointers the newer tree introduces
    pub fn new_cids(&self) -> CidSet {
        let mut cids = CidSet::new(Some(self.new_mst_blocks.cids()));
        cids.add_set(self.new_leaf_cids.clone());
        cids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipld::cid_for_cbor;

    fn cid_of(value: &str) -> Cid {
        cid_for_cbor(&value).unwrap()
    }

    #[test]
    fn add_then_delete_of_the_same_value_cancels_out() {
        let mut diff = DataDiff::new();
        let value = cid_of("record");
        diff.leaf_add("coll/a", value);
        diff.leaf_delete("coll/b", value);
        assert_eq!(diff.new_leaf_cids.size(), 0);
        assert_eq!(diff.removed_cids.size(), 0);
        assert_eq!(diff.add_list().len(), 1);
        assert_eq!(diff.delete_list().len(), 1);
    }

    #[test]
    fn moved_subtrees_are_neither_new_nor_removed() {
        let mut diff = DataDiff::new();
        let node = cid_of("node");
        diff.tree_delete(node);
        assert!(diff.removed_mst_blocks.has(node));
        diff.tree_add(node, vec![1, 2, 3]);
        assert_eq!(diff.removed_mst_blocks.size(), 0);
        assert_eq!(diff.removed_cids.size(), 0);
        assert_eq!(diff.new_mst_blocks.size(), 0);

        let other = cid_of("other");
        diff.tree_add(other, vec![4]);
        diff.tree_delete(other);
        assert_eq!(diff.new_mst_blocks.size(), 0);
        assert_eq!(diff.removed_mst_blocks.size(), 0);
    }

    #[test]
    fn identical_update_is_ignored() {
        let mut diff = DataDiff::new();
        let value = cid_of("same");
        diff.leaf_update("coll/a", value, value);
        assert!(diff.update_list().is_empty());

        let newer = cid_of("newer");
        diff.leaf_update("coll/a", value, newer);
        assert_eq!(
            diff.update_list(),
            vec![DataUpdate {
                key: "coll/a".to_string(),
                prev: value,
                cid: newer,
            }]
        );
        assert!(diff.removed_cids.has(value));
        assert!(diff.new_cids().has(newer));
    }
}
