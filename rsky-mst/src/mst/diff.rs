use super::walker::{MstWalker, WalkerStatus};
use super::{NodeEntry, NodeRef, MST};
use crate::data_diff::DataDiff;
use crate::error::{MstError, Result};
use futures::TryStreamExt;

/// Every entry of `tree`, as additions
pub async fn null_diff(tree: &MST) -> Result<DataDiff> {
    let mut diff = DataDiff::new();
    let mut stream = Box::pin(tree.walk());
    while let Some(entry) = stream.try_next().await? {
        diff.node_add(tree, &entry).await?;
    }
    log_summary(&diff);
    Ok(diff)
}

pub async fn mst_diff(curr: &MST, prev: Option<&MST>) -> Result<DataDiff> {
    let prev = match prev {
        Some(prev) => prev,
        None => return null_diff(curr).await,
    };
    let config = curr.config();
    let mut diff = DataDiff::new();
    if curr.get_pointer()? == prev.get_pointer()? {
        return Ok(diff);
    }

    let mut left_walker = MstWalker::new(prev).await?;
    let mut right_walker = MstWalker::new(curr).await?;
    loop {
        let (left, right) = match (&left_walker.status, &right_walker.status) {
            (WalkerStatus::Done, WalkerStatus::Done) => break,
            // if one walker is finished, continue walking the other & logging all nodes
            (WalkerStatus::Done, WalkerStatus::Progress(_)) => {
                add_current(&mut diff, &mut right_walker).await?;
                right_walker.advance().await?;
                continue;
            }
            (WalkerStatus::Progress(l), WalkerStatus::Done) => {
                diff.node_delete(&l.curr, config)?;
                left_walker.advance().await?;
                continue;
            }
            (WalkerStatus::Progress(l), WalkerStatus::Progress(r)) => {
                (l.curr.clone(), r.curr.clone())
            }
        };

        // if both pointers are leaves, record an update & advance both or record
        // the lowest key and advance that pointer
        if let (NodeEntry::Leaf(left_leaf), NodeEntry::Leaf(right_leaf)) = (&left, &right) {
            if left_leaf.key == right_leaf.key {
                diff.leaf_update(&left_leaf.key, left_leaf.value, right_leaf.value);
                left_walker.advance().await?;
                right_walker.advance().await?;
            } else if left_leaf.key < right_leaf.key {
                diff.leaf_delete(&left_leaf.key, left_leaf.value);
                left_walker.advance().await?;
            } else {
                diff.leaf_add(&right_leaf.key, right_leaf.value);
                right_walker.advance().await?;
            }
            continue;
        }

        // next, ensure that we're on the same layer
        // if one walker is at a higher layer than the other, we need to do
        // one of two things
        // if the higher walker is pointed at a tree, step into that tree to
        // try to catch up with the lower
        // if the higher walker is pointed at a leaf, then advance the lower walker
        // to try to catch up the higher
        let (left_layer, right_layer) = (left_walker.layer()?, right_walker.layer()?);
        if left_layer > right_layer {
            if left.is_leaf() {
                add_current(&mut diff, &mut right_walker).await?;
                right_walker.advance().await?;
            } else {
                diff.node_delete(&left, config)?;
                left_walker.step_into().await?;
            }
            continue;
        } else if left_layer < right_layer {
            if right.is_leaf() {
                diff.node_delete(&left, config)?;
                left_walker.advance().await?;
            } else {
                add_current(&mut diff, &mut right_walker).await?;
                right_walker.step_into().await?;
            }
            continue;
        }

        match (&left, &right) {
            // if we're on the same level, and both pointers are trees, do a comparison
            // if they're the same, step over. if they're different, step in to
            // find the subdiff
            (NodeEntry::Tree(left_tree), NodeEntry::Tree(right_tree)) => {
                if left_tree.pointer(config)? == right_tree.pointer(config)? {
                    left_walker.step_over();
                    right_walker.step_over();
                } else {
                    add_current(&mut diff, &mut right_walker).await?;
                    diff.node_delete(&left, config)?;
                    left_walker.step_into().await?;
                    right_walker.step_into().await?;
                }
            }
            // finally, if one pointer is a tree and the other is a leaf,
            // simply step into the tree
            (NodeEntry::Leaf(_), NodeEntry::Tree(_)) => {
                add_current(&mut diff, &mut right_walker).await?;
                right_walker.step_into().await?;
            }
            (NodeEntry::Tree(_), NodeEntry::Leaf(_)) => {
                diff.node_delete(&left, config)?;
                left_walker.step_into().await?;
            }
            (NodeEntry::Leaf(_), NodeEntry::Leaf(_)) => {
                return Err(MstError::InvalidWalk("unidentifiable case in diff walk"))
            }
        }
    }
    log_summary(&diff);
    Ok(diff)
}

/// Records the entry under the walker as added. Subtrees are materialized in
/// place so stepping into them afterwards does not fetch them twice.
async fn add_current(diff: &mut DataDiff, walker: &mut MstWalker<'_>) -> Result<()> {
    let on_tree = matches!(walker.current(), Some(NodeEntry::Tree(_)));
    let entry = match on_tree {
        true => NodeEntry::Tree(NodeRef::Resolved(walker.resolve_current().await?)),
        false => match walker.current() {
            Some(entry) => entry.clone(),
            None => return Ok(()),
        },
    };
    diff.node_add(walker.tree(), &entry).await
}

fn log_summary(diff: &DataDiff) {
    tracing::debug!(
        adds = diff.adds.len(),
        updates = diff.updates.len(),
        deletes = diff.deletes.len(),
        new_blocks = diff.new_mst_blocks.size(),
        removed_blocks = diff.removed_mst_blocks.size(),
        "computed mst diff"
    );
}
