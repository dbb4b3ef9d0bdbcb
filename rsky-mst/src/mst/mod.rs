/**
 * This is an implementation of a Merkle Search Tree (MST)
 * The data structure is described here: https://hal.inria.fr/hal-02303490/document
 * The MST is an ordered, insert-order-independent, deterministic tree.
 * Keys are laid out in alphabetic order.
 * The key insight of an MST is that each key is hashed and starting 0s are counted
 * to determine which layer it falls on (5 zeros for ~32 fanout).
 * This is a merkle tree, so each subtree is referred to by its hash (CID).
 * When a leaf is changed, every tree on the path to that leaf is changed as well,
 * thereby updating the root hash.
 *
 * For atproto, we use SHA-256 as the key hashing algorithm, and ~4 fanout
 * (2-bits of zero per layer).
 *
 * Nodes are immutable and shared between versions of a tree through `Arc`.
 * A subtree that has only been seen as a pointer stays an `Unresolved`
 * reference; it is fetched from storage on every visit and never written
 * back into the tree, so a `MST` value can be read from many tasks at once.
 * Mutations rebuild the path from the root to the changed leaf and return a
 * new `MST`, leaving the original untouched.
 */
use crate::block_map::BlockMap;
use crate::cid_set::CidSet;
use crate::config::MstConfig;
use crate::error::{MstError, Result};
use crate::mst::codec::{CidAndBytes, NodeData};
use crate::storage::types::RepoStorage;
use async_recursion::async_recursion;
use async_stream::try_stream;
use futures::{Stream, TryStreamExt};
use lexicon_cid::Cid;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::{Arc, OnceLock};

pub mod codec;
pub mod diff;
pub mod util;
pub mod walker;

#[derive(Clone, PartialEq, Eq)]
pub struct Leaf {
    pub key: String,
    pub value: Cid,
}

impl Debug for Leaf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leaf")
            .field("key", &self.key)
            .field("value", &self.value.to_string())
            .finish()
    }
}

/// A subtree as seen from its parent.
#[derive(Clone)]
pub enum NodeRef {
    Resolved(Arc<Node>),
    /// Known only by pointer. `layer` is what the parent implies, if anything.
    Unresolved { pointer: Cid, layer: Option<u32> },
}

impl NodeRef {
    pub fn pointer(&self, config: &MstConfig) -> Result<Cid> {
        match self {
            NodeRef::Resolved(node) => node.pointer(config),
            NodeRef::Unresolved { pointer, .. } => Ok(*pointer),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, NodeRef::Resolved(_))
    }
}

impl Debug for NodeRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Resolved(node) => node.fmt(f),
            NodeRef::Unresolved { pointer, layer } => f
                .debug_struct("Unresolved")
                .field("pointer", &pointer.to_string())
                .field("layer", layer)
                .finish(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum NodeEntry {
    Tree(NodeRef),
    Leaf(Leaf),
}

impl NodeEntry {
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf(_))
    }
}

/// One node of the tree: leaves in key order, with subtrees between them.
/// Never two subtrees next to each other.
pub struct Node {
    entries: Vec<NodeEntry>,
    layer: Option<u32>,
    pointer: OnceLock<Cid>,
}

impl Node {
    pub fn new(entries: Vec<NodeEntry>, layer: Option<u32>) -> Self {
        Node {
            entries,
            layer,
            pointer: OnceLock::new(),
        }
    }

    /// The empty tree. Always layer 0.
    pub fn empty() -> Self {
        Node::new(Vec::new(), Some(0))
    }

    /// Rebuilds a node fetched from storage. `pointer` must be the address
    /// `data` was read from.
    pub fn from_data(
        pointer: Cid,
        data: &NodeData,
        layer: Option<u32>,
        config: &MstConfig,
    ) -> Result<Self> {
        let (entries, layer) = util::deserialize_node_data(data, layer, config)?;
        Ok(Node {
            entries,
            layer,
            pointer: OnceLock::from(pointer),
        })
    }

    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    pub fn layer_hint(&self) -> Option<u32> {
        self.layer
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn data(&self, config: &MstConfig) -> Result<NodeData> {
        util::serialize_node_data(&self.entries, config)
    }

    pub fn block(&self, config: &MstConfig) -> Result<CidAndBytes> {
        let block = config.codec.block_for(&self.data(config)?)?;
        let _ = self.pointer.set(block.cid);
        Ok(block)
    }

    /// Content address of this node, computed once.
    pub fn pointer(&self, config: &MstConfig) -> Result<Cid> {
        if let Some(pointer) = self.pointer.get() {
            return Ok(*pointer);
        }
        Ok(self.block(config)?.cid)
    }

    /// Index of the first leaf whose key is >= `key`, or the entry count
    pub fn find_gt_or_equal_leaf_index(&self, key: &str) -> usize {
        self.entries
            .iter()
            .position(|entry| match entry {
                NodeEntry::Leaf(leaf) => leaf.key.as_str() >= key,
                NodeEntry::Tree(_) => false,
            })
            .unwrap_or(self.entries.len())
    }

    pub fn leaf_at(&self, index: usize) -> Option<&Leaf> {
        match self.entries.get(index) {
            Some(NodeEntry::Leaf(leaf)) => Some(leaf),
            _ => None,
        }
    }

    /// The subtree directly left of `index`, if there is one
    pub fn tree_before(&self, index: usize) -> Option<&NodeRef> {
        match index.checked_sub(1).and_then(|i| self.entries.get(i)) {
            Some(NodeEntry::Tree(tree)) => Some(tree),
            _ => None,
        }
    }

    // Immutable edits. Each returns a fresh node on the same layer.

    fn with_entries(&self, entries: Vec<NodeEntry>) -> Node {
        Node::new(entries, self.layer)
    }

    fn update_entry(&self, index: usize, entry: NodeEntry) -> Node {
        let mut entries = self.entries.clone();
        entries[index] = entry;
        self.with_entries(entries)
    }

    fn remove_entry(&self, index: usize) -> Node {
        let mut entries = self.entries.clone();
        entries.remove(index);
        self.with_entries(entries)
    }

    fn splice_in(&self, entry: NodeEntry, index: usize) -> Node {
        let mut entries = self.entries.clone();
        entries.insert(index, entry);
        self.with_entries(entries)
    }

    fn replace_with_split(
        &self,
        index: usize,
        left: Option<NodeRef>,
        leaf: Leaf,
        right: Option<NodeRef>,
    ) -> Node {
        let mut entries = self.entries[..index].to_vec();
        entries.extend(left.map(NodeEntry::Tree));
        entries.push(NodeEntry::Leaf(leaf));
        entries.extend(right.map(NodeEntry::Tree));
        entries.extend_from_slice(&self.entries[index + 1..]);
        self.with_entries(entries)
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("pointer", &self.pointer.get().map(|cid| cid.to_string()))
            .field("layer", &self.layer)
            .field("entries", &self.entries)
            .finish()
    }
}

#[derive(Debug)]
pub struct UnstoredBlocks {
    pub root: Cid,
    pub blocks: BlockMap,
}

enum Seek {
    Node(NodeRef),
    Entry(NodeEntry),
}

#[derive(Clone)]
pub struct MST {
    root: NodeRef,
    storage: Arc<dyn RepoStorage>,
    config: MstConfig,
}

impl Debug for MST {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MST")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish()
    }
}

impl Display for MST {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fn pointer_str(node: &NodeRef, config: &MstConfig) -> String {
            match node.pointer(config) {
                Ok(cid) => format!("*({})", util::short_cid(&cid)),
                Err(_) => "*(?)".to_string(),
            }
        }

        fn fmt_node(
            node: &NodeRef,
            config: &MstConfig,
            f: &mut Formatter<'_>,
            prefix: &str,
            is_last: bool,
        ) -> fmt::Result {
            writeln!(
                f,
                "{}{}── {}",
                prefix,
                if is_last { "└" } else { "├" },
                pointer_str(node, config),
            )?;

            let child_prefix = format!("{}{}", prefix, if is_last { "   " } else { "│  " });

            let node = match node {
                NodeRef::Resolved(node) => node,
                NodeRef::Unresolved { .. } => {
                    writeln!(f, "{}(virtual node)", child_prefix)?;
                    return Ok(());
                }
            };

            for (i, entry) in node.entries().iter().enumerate() {
                let last_child = i == node.entries().len() - 1;
                match entry {
                    NodeEntry::Leaf(leaf) => {
                        writeln!(
                            f,
                            "{}{}── {} -> {}",
                            child_prefix,
                            if last_child { "└" } else { "├" },
                            leaf.key,
                            util::short_cid(&leaf.value)
                        )?;
                    }
                    NodeEntry::Tree(child) => {
                        fmt_node(child, config, f, &child_prefix, last_child)?;
                    }
                }
            }
            Ok(())
        }

        fmt_node(&self.root, &self.config, f, "", true)
    }
}

impl MST {
    pub fn create(storage: Arc<dyn RepoStorage>) -> Self {
        Self::create_with_config(storage, MstConfig::default())
    }

    pub fn create_with_config(storage: Arc<dyn RepoStorage>, config: MstConfig) -> Self {
        MST {
            root: NodeRef::Resolved(Arc::new(Node::empty())),
            storage,
            config,
        }
    }

    /// Nothing is fetched until the tree is first read.
    pub fn load(storage: Arc<dyn RepoStorage>, cid: Cid) -> Self {
        Self::load_with_config(storage, cid, MstConfig::default())
    }

    pub fn load_with_config(storage: Arc<dyn RepoStorage>, cid: Cid, config: MstConfig) -> Self {
        MST {
            root: NodeRef::Unresolved {
                pointer: cid,
                layer: None,
            },
            storage,
            config,
        }
    }

    fn with_root(&self, root: Arc<Node>) -> Self {
        MST {
            root: NodeRef::Resolved(root),
            storage: self.storage.clone(),
            config: self.config.clone(),
        }
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn storage(&self) -> &Arc<dyn RepoStorage> {
        &self.storage
    }

    pub fn config(&self) -> &MstConfig {
        &self.config
    }

    /// Content address of the root. Identical contents always give the same pointer.
    pub fn get_pointer(&self) -> Result<Cid> {
        self.root.pointer(&self.config)
    }

    /// Materializes a node, fetching and verifying it if needed.
    pub async fn resolve(&self, node: &NodeRef) -> Result<Arc<Node>> {
        match node {
            NodeRef::Resolved(node) => Ok(node.clone()),
            NodeRef::Unresolved { pointer, layer } => {
                let bytes = self.storage.read_bytes(pointer).await?;
                let computed = self.config.codec.cid_for_bytes(&bytes)?;
                if computed != *pointer {
                    return Err(MstError::MalformedNode(format!(
                        "block {pointer} hashes to {computed}"
                    )));
                }
                let data = self.config.codec.decode(&bytes)?;
                let node = Node::from_data(*pointer, &data, *layer, &self.config)?;
                tracing::trace!(%pointer, entries = node.entries.len(), "resolved mst node");
                Ok(Arc::new(node))
            }
        }
    }

    // Layers
    // -------------------

    pub async fn get_layer(&self) -> Result<u32> {
        let root = self.resolve(&self.root).await?;
        self.layer_of(&root).await
    }

    async fn layer_of(&self, node: &Node) -> Result<u32> {
        Ok(self.attempt_layer(node).await?.unwrap_or(0))
    }

    /// Layer from the node's own leaves, else one above its first
    /// subtree's. `None` only for an empty node.
    #[async_recursion]
    async fn attempt_layer(&self, node: &Node) -> Result<Option<u32>> {
        if let Some(layer) = node.layer_hint() {
            return Ok(Some(layer));
        }
        for entry in node.entries() {
            if let NodeEntry::Leaf(leaf) = entry {
                return Ok(Some(self.config.layer_for_key(&leaf.key)));
            }
        }
        for entry in node.entries() {
            if let NodeEntry::Tree(child) = entry {
                if let NodeRef::Unresolved {
                    layer: Some(layer), ..
                } = child
                {
                    return Ok(Some(layer + 1));
                }
                let child = self.resolve(child).await?;
                if let Some(layer) = self.attempt_layer(&child).await? {
                    return Ok(Some(layer + 1));
                }
            }
        }
        Ok(None)
    }

    // Core functionality
    // -------------------

    /// Gets the value at the given key. Keys that could never be stored
    /// are simply absent.
    pub async fn get(&self, key: &str) -> Result<Option<Cid>> {
        if !util::is_valid_mst_key(key) {
            return Ok(None);
        }
        let mut current = self.root.clone();
        loop {
            let node = self.resolve(&current).await?;
            let index = node.find_gt_or_equal_leaf_index(key);
            if let Some(found) = node.leaf_at(index) {
                if found.key == key {
                    return Ok(Some(found.value));
                }
            }
            match node.tree_before(index) {
                Some(prev) => current = prev.clone(),
                None => return Ok(None),
            }
        }
    }

    /// Adds a new leaf for the given key/value pair
    /// Throws if a leaf with that key already exists
    pub async fn add(&self, key: &str, value: Cid) -> Result<Self> {
        util::ensure_valid_mst_key(key)?;
        let key_layer = self.config.layer_for_key(key);
        let leaf = Leaf {
            key: key.to_string(),
            value,
        };
        let root = self.add_in(&self.root, leaf, key_layer).await?;
        Ok(self.with_root(root))
    }

    #[async_recursion]
    async fn add_in(&self, node: &NodeRef, leaf: Leaf, key_layer: u32) -> Result<Arc<Node>> {
        let node = self.resolve(node).await?;
        let layer = self.layer_of(&node).await?;
        let index = node.find_gt_or_equal_leaf_index(&leaf.key);

        if key_layer == layer {
            if let Some(found) = node.leaf_at(index) {
                if found.key == leaf.key {
                    return Err(MstError::KeyExists(leaf.key));
                }
            }
            let updated = match node.tree_before(index) {
                // split the subtree around the key
                Some(prev) => {
                    let (left, right) = self.split_around(prev, &leaf.key).await?;
                    node.replace_with_split(index - 1, left, leaf, right)
                }
                // the entry before is a leaf, or we're on the far left
                None => node.splice_in(NodeEntry::Leaf(leaf), index),
            };
            Ok(Arc::new(updated))
        } else if key_layer < layer {
            match node.tree_before(index) {
                Some(prev) => {
                    let subtree = self.add_in(prev, leaf, key_layer).await?;
                    Ok(Arc::new(node.update_entry(
                        index - 1,
                        NodeEntry::Tree(NodeRef::Resolved(subtree)),
                    )))
                }
                None => {
                    let child = NodeRef::Resolved(Arc::new(Node::new(Vec::new(), Some(layer - 1))));
                    let subtree = self.add_in(&child, leaf, key_layer).await?;
                    Ok(Arc::new(node.splice_in(
                        NodeEntry::Tree(NodeRef::Resolved(subtree)),
                        index,
                    )))
                }
            }
        } else {
            // the key belongs above the current root: push the whole tree down
            let (mut left, mut right) = self
                .split_around(&NodeRef::Resolved(node.clone()), &leaf.key)
                .await?;
            for parent_layer in layer + 1..key_layer {
                left = left.map(|child| create_parent(child, parent_layer));
                right = right.map(|child| create_parent(child, parent_layer));
            }
            let mut entries = Vec::with_capacity(3);
            entries.extend(left.map(NodeEntry::Tree));
            entries.push(NodeEntry::Leaf(leaf));
            entries.extend(right.map(NodeEntry::Tree));
            tracing::debug!(from = layer, to = key_layer, "mst root raised");
            Ok(Arc::new(Node::new(entries, Some(key_layer))))
        }
    }

    /// Edits the value at the given key
    /// Throws if the given key does not exist
    pub async fn update(&self, key: &str, value: Cid) -> Result<Self> {
        util::ensure_valid_mst_key(key)?;
        let leaf = Leaf {
            key: key.to_string(),
            value,
        };
        let root = self.update_in(&self.root, leaf).await?;
        Ok(self.with_root(root))
    }

    #[async_recursion]
    async fn update_in(&self, node: &NodeRef, leaf: Leaf) -> Result<Arc<Node>> {
        let node = self.resolve(node).await?;
        let index = node.find_gt_or_equal_leaf_index(&leaf.key);
        if let Some(found) = node.leaf_at(index) {
            if found.key == leaf.key {
                return Ok(Arc::new(node.update_entry(index, NodeEntry::Leaf(leaf))));
            }
        }
        match node.tree_before(index) {
            Some(prev) => {
                let subtree = self.update_in(prev, leaf).await?;
                Ok(Arc::new(node.update_entry(
                    index - 1,
                    NodeEntry::Tree(NodeRef::Resolved(subtree)),
                )))
            }
            None => Err(MstError::KeyNotFound(leaf.key)),
        }
    }

    /// Deletes the value at the given key
    pub async fn delete(&self, key: &str) -> Result<Self> {
        util::ensure_valid_mst_key(key)?;
        let altered = self.delete_recurse(&self.root, key).await?;
        let trimmed = self.trim_top(altered).await?;
        if trimmed.is_empty() {
            return Ok(self.with_root(Arc::new(Node::empty())));
        }
        Ok(self.with_root(trimmed))
    }

    #[async_recursion]
    async fn delete_recurse(&self, node: &NodeRef, key: &str) -> Result<Arc<Node>> {
        let node = self.resolve(node).await?;
        let index = node.find_gt_or_equal_leaf_index(key);
        let entries = node.entries();

        // the key is in this node
        if let Some(found) = node.leaf_at(index) {
            if found.key == key {
                let prev = index.checked_sub(1).and_then(|i| entries.get(i));
                let next = entries.get(index + 1);
                return match (prev, next) {
                    (Some(NodeEntry::Tree(prev)), Some(NodeEntry::Tree(next))) => {
                        let merged = self.append_merge(prev, next).await?;
                        let mut updated = entries[..index - 1].to_vec();
                        updated.push(NodeEntry::Tree(NodeRef::Resolved(merged)));
                        updated.extend_from_slice(&entries[index + 2..]);
                        Ok(Arc::new(node.with_entries(updated)))
                    }
                    _ => Ok(Arc::new(node.remove_entry(index))),
                };
            }
        }

        // else recurse down to find it
        match node.tree_before(index) {
            Some(prev) => {
                let subtree = self.delete_recurse(prev, key).await?;
                if subtree.is_empty() {
                    Ok(Arc::new(node.remove_entry(index - 1)))
                } else {
                    Ok(Arc::new(node.update_entry(
                        index - 1,
                        NodeEntry::Tree(NodeRef::Resolved(subtree)),
                    )))
                }
            }
            None => Err(MstError::KeyNotFound(key.to_string())),
        }
    }

    /// Merges two adjacent trees of the same layer
    #[async_recursion]
    async fn append_merge(&self, left: &NodeRef, right: &NodeRef) -> Result<Arc<Node>> {
        let left = self.resolve(left).await?;
        let right = self.resolve(right).await?;
        let (left_layer, right_layer) = (self.layer_of(&left).await?, self.layer_of(&right).await?);
        if left_layer != right_layer {
            return Err(MstError::MalformedNode(format!(
                "trying to merge a node on layer {left_layer} with one on layer {right_layer}"
            )));
        }
        let mut entries = left.entries().to_vec();
        match (left.entries().last(), right.entries().first()) {
            (Some(NodeEntry::Tree(left_tree)), Some(NodeEntry::Tree(right_tree))) => {
                let merged = self.append_merge(left_tree, right_tree).await?;
                entries.pop();
                entries.push(NodeEntry::Tree(NodeRef::Resolved(merged)));
                entries.extend_from_slice(&right.entries()[1..]);
            }
            _ => entries.extend_from_slice(right.entries()),
        }
        Ok(Arc::new(Node::new(entries, Some(left_layer))))
    }

    /// Drops roots that are nothing but a pointer to a single subtree
    #[async_recursion]
    async fn trim_top(&self, node: Arc<Node>) -> Result<Arc<Node>> {
        match node.entries() {
            [NodeEntry::Tree(only)] => {
                let child = self.resolve(only).await?;
                tracing::trace!(layer = ?node.layer_hint(), "trimming mst root");
                self.trim_top(child).await
            }
            _ => Ok(node),
        }
    }

    // Subtree & Splits
    // -------------------

    /// Recursively splits a subtree around a given key
    #[async_recursion]
    async fn split_around(
        &self,
        node: &NodeRef,
        key: &str,
    ) -> Result<(Option<NodeRef>, Option<NodeRef>)> {
        let node = self.resolve(node).await?;
        let index = node.find_gt_or_equal_leaf_index(key);
        let mut left_entries = node.entries()[..index].to_vec();
        let mut right_entries = node.entries()[index..].to_vec();

        // if the far right of the left side is a subtree,
        // we need to split it on the key as well
        if let Some(NodeEntry::Tree(last)) = left_entries.last().cloned() {
            left_entries.pop();
            let (split_left, split_right) = self.split_around(&last, key).await?;
            left_entries.extend(split_left.map(NodeEntry::Tree));
            if let Some(split_right) = split_right {
                right_entries.insert(0, NodeEntry::Tree(split_right));
            }
        }

        let wrap = |entries: Vec<NodeEntry>| match entries.is_empty() {
            true => None,
            false => Some(NodeRef::Resolved(Arc::new(node.with_entries(entries)))),
        };
        Ok((wrap(left_entries), wrap(right_entries)))
    }

    // Walking the tree
    // -------------------

    /// Every node in the tree, depth-first: each subtree is yielded before
    /// its entries, leaves in key order.
    pub fn walk(&self) -> impl Stream<Item = Result<NodeEntry>> + Send + 'static {
        self.walk_entries(false)
    }

    /// Like `walk`, but skips subtrees whose blocks are missing from storage.
    pub fn walk_reachable(&self) -> impl Stream<Item = Result<NodeEntry>> + Send + 'static {
        self.walk_entries(true)
    }

    fn walk_entries(
        &self,
        skip_missing: bool,
    ) -> impl Stream<Item = Result<NodeEntry>> + Send + 'static {
        let tree = self.clone();
        try_stream! {
            let mut stack = vec![NodeEntry::Tree(tree.root.clone())];
            while let Some(entry) = stack.pop() {
                let node = match entry {
                    NodeEntry::Leaf(leaf) => {
                        yield NodeEntry::Leaf(leaf);
                        continue;
                    }
                    NodeEntry::Tree(node) => node,
                };
                let resolved = tree.resolve(&node).await;
                if skip_missing && matches!(resolved, Err(MstError::MissingBlock(_))) {
                    tracing::debug!(pointer = ?node.pointer(&tree.config).ok(), "skipping unreachable mst node");
                    continue;
                }
                let node = resolved?;
                stack.extend(node.entries().iter().rev().cloned());
                yield NodeEntry::Tree(NodeRef::Resolved(node));
            }
        }
    }

    /// Walks the leaves of the tree in order, starting at the first key >= `key`.
    /// Only the subtrees on the path to `key` are visited to find the start.
    pub fn walk_leaves_from(&self, key: &str) -> impl Stream<Item = Result<Leaf>> + Send + 'static {
        let tree = self.clone();
        let key = key.to_string();
        try_stream! {
            let mut stack = vec![Seek::Node(tree.root.clone())];
            while let Some(frame) = stack.pop() {
                match frame {
                    Seek::Node(node) => {
                        let node = tree.resolve(&node).await?;
                        let index = node.find_gt_or_equal_leaf_index(&key);
                        for entry in node.entries()[index..].iter().rev() {
                            stack.push(Seek::Entry(entry.clone()));
                        }
                        if let Some(prev) = node.tree_before(index) {
                            stack.push(Seek::Node(prev.clone()));
                        }
                    }
                    Seek::Entry(NodeEntry::Leaf(leaf)) => {
                        yield leaf;
                    }
                    Seek::Entry(NodeEntry::Tree(node)) => {
                        let node = tree.resolve(&node).await?;
                        for entry in node.entries().iter().rev() {
                            stack.push(Seek::Entry(entry.clone()));
                        }
                    }
                }
            }
        }
    }

    pub async fn all_nodes(&self) -> Result<Vec<NodeEntry>> {
        self.walk().try_collect().await
    }

    pub async fn all_cids(&self) -> Result<CidSet> {
        let mut cids = CidSet::new(None);
        let mut stream = Box::pin(self.walk());
        while let Some(entry) = stream.try_next().await? {
            match entry {
                NodeEntry::Tree(node) => cids.add(node.pointer(&self.config)?),
                NodeEntry::Leaf(leaf) => cids.add(leaf.value),
            }
        }
        Ok(cids)
    }

    pub async fn leaves(&self) -> Result<Vec<Leaf>> {
        collect_leaves(self.walk()).await
    }

    pub async fn leaf_count(&self) -> Result<usize> {
        Ok(self.leaves().await?.len())
    }

    pub async fn reachable_leaves(&self) -> Result<Vec<Leaf>> {
        collect_leaves(self.walk_reachable()).await
    }

    // List operations (partial tree traversal)
    // -------------------

    /// Leaves strictly after `after` and strictly before `before`, at most `count` of them.
    pub async fn list(
        &self,
        count: Option<usize>,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<Leaf>> {
        let count = count.unwrap_or(usize::MAX);
        let after = after.unwrap_or("");
        let mut vals: Vec<Leaf> = Vec::new();
        let mut stream = Box::pin(self.walk_leaves_from(after));
        while let Some(leaf) = stream.try_next().await? {
            if leaf.key == after {
                continue;
            }
            if vals.len() >= count {
                break;
            }
            if let Some(before) = before {
                if leaf.key.as_str() >= before {
                    break;
                }
            }
            vals.push(leaf);
        }
        Ok(vals)
    }

    pub async fn list_with_prefix(&self, prefix: &str, count: Option<usize>) -> Result<Vec<Leaf>> {
        let count = count.unwrap_or(usize::MAX);
        let mut vals: Vec<Leaf> = Vec::new();
        let mut stream = Box::pin(self.walk_leaves_from(prefix));
        while let Some(leaf) = stream.try_next().await? {
            if vals.len() >= count || !leaf.key.starts_with(prefix) {
                break;
            }
            vals.push(leaf);
        }
        Ok(vals)
    }

    // Sync Protocol
    // -------------------

    /// Pointers of every node from the root down to `key`, plus the value
    /// at `key` if it exists. Enough to prove the key's presence or absence.
    pub async fn cids_for_path(&self, key: &str) -> Result<Vec<Cid>> {
        let mut cids: Vec<Cid> = Vec::new();
        let mut current = self.root.clone();
        loop {
            let node = self.resolve(&current).await?;
            cids.push(node.pointer(&self.config)?);
            let index = node.find_gt_or_equal_leaf_index(key);
            if let Some(found) = node.leaf_at(index) {
                if found.key == key {
                    cids.push(found.value);
                    return Ok(cids);
                }
            }
            match node.tree_before(index) {
                Some(prev) => current = prev.clone(),
                None => return Ok(cids),
            }
        }
    }

    /// Adds the blocks of every node from the root down to `key`.
    pub async fn add_blocks_for_path(&self, key: &str, blocks: &mut BlockMap) -> Result<()> {
        let mut current = self.root.clone();
        loop {
            let node = self.resolve(&current).await?;
            let block = node.block(&self.config)?;
            blocks.set(block.cid, block.bytes);
            let index = node.find_gt_or_equal_leaf_index(key);
            if let Some(found) = node.leaf_at(index) {
                if found.key == key {
                    return Ok(());
                }
            }
            match node.tree_before(index) {
                Some(prev) => current = prev.clone(),
                None => return Ok(()),
            }
        }
    }

    /// Blocks for every in-memory node the store does not have yet.
    /// Subtrees known only by pointer already live in a store and are skipped.
    pub async fn get_unstored_blocks(&self) -> Result<UnstoredBlocks> {
        let mut blocks = BlockMap::new();
        let root = self.collect_unstored(&self.root, &mut blocks).await?;
        Ok(UnstoredBlocks { root, blocks })
    }

    #[async_recursion]
    async fn collect_unstored(&self, node: &NodeRef, blocks: &mut BlockMap) -> Result<Cid> {
        let node = match node {
            NodeRef::Unresolved { pointer, .. } => return Ok(*pointer),
            NodeRef::Resolved(node) => node,
        };
        let pointer = node.pointer(&self.config)?;
        if blocks.has(&pointer) || self.storage.has(pointer).await? {
            return Ok(pointer);
        }
        for entry in node.entries() {
            if let NodeEntry::Tree(child) = entry {
                self.collect_unstored(child, blocks).await?;
            }
        }
        let block = node.block(&self.config)?;
        blocks.set(block.cid, block.bytes);
        Ok(pointer)
    }

    /// Writes all unstored nodes to storage and returns the root pointer.
    pub async fn save_mst(&self) -> Result<Cid> {
        let unstored = self.get_unstored_blocks().await?;
        tracing::debug!(
            root = %unstored.root,
            blocks = unstored.blocks.size(),
            "persisting mst blocks"
        );
        self.storage.put_many(unstored.blocks).await?;
        Ok(unstored.root)
    }
}

fn create_parent(child: NodeRef, layer: u32) -> NodeRef {
    NodeRef::Resolved(Arc::new(Node::new(vec![NodeEntry::Tree(child)], Some(layer))))
}

async fn collect_leaves<S>(stream: S) -> Result<Vec<Leaf>>
where
    S: Stream<Item = Result<NodeEntry>>,
{
    let mut leaves: Vec<Leaf> = Vec::new();
    let mut stream = Box::pin(stream);
    while let Some(entry) = stream.try_next().await? {
        if let NodeEntry::Leaf(leaf) = entry {
            leaves.push(leaf);
        }
    }
    Ok(leaves)
}
