use super::{Node, NodeEntry, NodeRef, MST};
use crate::error::{MstError, Result};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct WalkerStatusProgress {
    pub curr: NodeEntry,
    pub walking: Option<Arc<Node>>, // walking set to None if `curr` is the root of the tree
    pub index: usize,
    pub layer: u32, // layer of `walking`; one above the root while on the root
}

#[derive(Clone, Debug)]
pub enum WalkerStatus {
    Done,
    Progress(WalkerStatusProgress),
}

/// Resumable depth-first cursor over a tree. Subtrees are only fetched when
/// stepped into.
pub struct MstWalker<'a> {
    tree: &'a MST,
    pub stack: Vec<WalkerStatus>,
    pub status: WalkerStatus,
}

impl<'a> MstWalker<'a> {
    pub async fn new(tree: &'a MST) -> Result<MstWalker<'a>> {
        let root = tree.resolve(&tree.root).await?;
        let layer = tree.layer_of(&root).await?;
        Ok(MstWalker {
            tree,
            stack: Vec::new(),
            status: WalkerStatus::Progress(WalkerStatusProgress {
                curr: NodeEntry::Tree(NodeRef::Resolved(root)),
                walking: None,
                index: 0,
                layer: layer + 1,
            }),
        })
    }

    pub fn tree(&self) -> &'a MST {
        self.tree
    }

    pub fn is_done(&self) -> bool {
        matches!(self.status, WalkerStatus::Done)
    }

    pub fn current(&self) -> Option<&NodeEntry> {
        match &self.status {
            WalkerStatus::Done => None,
            WalkerStatus::Progress(progress) => Some(&progress.curr),
        }
    }

    /// return the current layer of the node you are walking
    pub fn layer(&self) -> Result<u32> {
        match &self.status {
            WalkerStatus::Done => Err(MstError::InvalidWalk("walk is done")),
            WalkerStatus::Progress(progress) => Ok(progress.layer),
        }
    }

    /// Materializes the subtree under the cursor, so stepping into it later
    /// does not fetch it again.
    pub async fn resolve_current(&mut self) -> Result<Arc<Node>> {
        let tree = self.tree;
        let progress = match &mut self.status {
            WalkerStatus::Done => return Err(MstError::InvalidWalk("walk is done")),
            WalkerStatus::Progress(progress) => progress,
        };
        let node = match &progress.curr {
            NodeEntry::Tree(node) => tree.resolve(node).await?,
            NodeEntry::Leaf(_) => {
                return Err(MstError::InvalidWalk("no tree at pointer, cannot step into"))
            }
        };
        progress.curr = NodeEntry::Tree(NodeRef::Resolved(node.clone()));
        Ok(node)
    }

    /// move to the next node in the subtree, skipping over the subtree
    pub fn step_over(&mut self) {
        loop {
            let progress = match &mut self.status {
                WalkerStatus::Done => return,
                WalkerStatus::Progress(progress) => progress,
            };
            // stepping over the root of the tree has nowhere to go
            let next = progress
                .walking
                .as_ref()
                .and_then(|walking| walking.entries().get(progress.index + 1).cloned());
            if let Some(next) = next {
                progress.index += 1;
                progress.curr = next;
                return;
            }
            match self.stack.pop() {
                Some(popped) => self.status = popped,
                None => {
                    self.status = WalkerStatus::Done;
                    return;
                }
            }
        }
    }

    /// step into a subtree, errors if currently pointed at a leaf
    pub async fn step_into(&mut self) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }
        let node = self.resolve_current().await?;
        let progress = match &self.status {
            WalkerStatus::Done => return Ok(()),
            WalkerStatus::Progress(progress) => progress.clone(),
        };
        let child_layer = progress.layer.checked_sub(1).ok_or_else(|| {
            MstError::MalformedNode("subtree below a node on layer 0".to_string())
        })?;
        let first = match node.entries().first() {
            Some(first) => first.clone(),
            // an empty root is the empty tree
            None if progress.walking.is_none() => {
                self.status = WalkerStatus::Done;
                return Ok(());
            }
            None => {
                return Err(MstError::MalformedNode(
                    "tried to step into a node with 0 entries".to_string(),
                ))
            }
        };
        if progress.walking.is_some() {
            self.stack.push(WalkerStatus::Progress(progress));
        }
        self.status = WalkerStatus::Progress(WalkerStatusProgress {
            curr: first,
            walking: Some(node),
            index: 0,
            layer: child_layer,
        });
        Ok(())
    }

    /// advance the pointer to the next node in the tree,
    /// stepping into the current node if necessary
    pub async fn advance(&mut self) -> Result<()> {
        let on_leaf = match self.current() {
            None => return Ok(()),
            Some(entry) => entry.is_leaf(),
        };
        if on_leaf {
            self.step_over();
            return Ok(());
        }
        self.step_into().await
    }
}
