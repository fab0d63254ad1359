//! B+ tree maintenance for the store engine.
//!
//! Reads walk pages directly through a [`cursor::Cursor`]. Writes materialise
//! the pages they touch as [`node::Node`]s; no structural change happens until
//! commit, when every materialised tree goes through two passes:
//!
//! 1. **Rebalance**, deepest node first: nodes left under a quarter page or
//!    below [`MIN_KEYS_PER_PAGE`] entries by deletes are merged into a
//!    sibling, and a root branch with a single child is collapsed.
//! 2. **Spill**, deepest node first: each node is split into page-sized
//!    siblings, its old page is freed, fresh pages are allocated and written,
//!    and the parent entry is renamed/inserted by key. A root that splits
//!    grows a new root above it.
//!
//! ## Structure
//!
//! - `node.rs`: in-memory node and the node arena
//! - `split.rs`: within-node split partitioning
//! - `cursor.rs`: positional iteration over pages and nodes

pub mod cursor;
pub(crate) mod node;
pub(crate) mod split;

use std::collections::HashMap;
use std::sync::Arc;

use memmap2::Mmap;
use node::{Node, NodeArena, NodeBytes, NodeId};

use crate::error::{Error, PageId, Result};
use crate::page::{LeafFlags, MIN_KEYS_PER_PAGE, Page, pages_for};
use crate::transaction::TxStats;

/// Page access for tree maintenance.
///
/// Read transactions serve pages from the memory map; write transactions
/// layer their own dirty pages on top and own the freelist scratch copy.
pub(crate) trait PageProvider {
    /// Page `id`, including its overflow run.
    fn page(&self, id: PageId) -> Result<Page<'_>>;

    /// Map that mapped pages borrow from, if any.
    fn mapped(&self) -> Option<&Arc<Mmap>>;

    /// Page size in bytes.
    fn page_size(&self) -> usize;

    /// Allocates `count` contiguous pages and returns the id of the first.
    /// The new page buffer has its header id and overflow set.
    fn allocate(&mut self, count: usize) -> Result<PageId>;

    /// Mutable buffer of a page allocated by this transaction.
    fn page_mut(&mut self, id: PageId) -> Result<&mut [u8]>;

    /// Releases page `id` and its overflow run.
    fn free(&mut self, id: PageId) -> Result<()>;
}

/// Materialised nodes of one bucket's tree.
#[derive(Debug, Default)]
pub(crate) struct TreeNodes {
    pub(crate) root_node: Option<NodeId>,
    /// Source page id → node.
    pub(crate) nodes: HashMap<PageId, NodeId>,
}

/// Mutable view of one bucket's tree within a write transaction.
pub(crate) struct BTree<'a, P: PageProvider> {
    arena: &'a mut NodeArena,
    tree: &'a mut TreeNodes,
    pager: &'a mut P,
    stats: &'a mut TxStats,
}

impl<'a, P: PageProvider> BTree<'a, P> {
    pub(crate) fn new(
        arena: &'a mut NodeArena,
        tree: &'a mut TreeNodes,
        pager: &'a mut P,
        stats: &'a mut TxStats,
    ) -> Self {
        Self { arena, tree, pager, stats }
    }

    /// Node for page `pgid`, materialising it under `parent` on first use.
    pub(crate) fn node(&mut self, pgid: PageId, parent: Option<NodeId>) -> Result<NodeId> {
        if let Some(&id) = self.tree.nodes.get(&pgid) {
            return Ok(id);
        }

        let mut node = Node::read(self.pager.page(pgid)?, self.pager.mapped())?;
        node.parent = parent;
        node.depth = parent.map_or(0, |p| self.arena[p].depth + 1);
        let id = self.arena.insert(node);
        match parent {
            Some(p) => self.arena[p].children.push(id),
            None => self.tree.root_node = Some(id),
        }
        self.tree.nodes.insert(pgid, id);
        self.stats.node_count += 1;
        Ok(id)
    }

    /// Child `index` of branch node `parent`.
    pub(crate) fn child_at(&mut self, parent: NodeId, index: usize) -> Result<NodeId> {
        let pgid = match self.arena[parent].inodes.get(index) {
            Some(inode) if !self.arena[parent].is_leaf => inode.pgid,
            _ => {
                return Err(Error::Corrupted {
                    reason: format!("no child {index} under node for page {}", self.arena[parent].pgid),
                });
            }
        };
        self.node(pgid, Some(parent))
    }

    /// Leaf node reached from `root` by following the branch indices in `path`.
    pub(crate) fn leaf_for_path(&mut self, root: PageId, path: &[usize]) -> Result<NodeId> {
        let mut id = self.node(root, None)?;
        for &index in path {
            id = self.child_at(id, index)?;
        }
        Ok(id)
    }

    /// Inserts or replaces a leaf entry in node `leaf`.
    pub(crate) fn put(&mut self, leaf: NodeId, key: &[u8], value: &[u8], flags: LeafFlags) {
        self.arena[leaf].put(key, key.into(), value.into(), 0, flags);
    }

    /// Removes a leaf entry from node `leaf`.
    pub(crate) fn del(&mut self, leaf: NodeId, key: &[u8]) -> bool {
        self.arena[leaf].del(key)
    }

    fn free_page(&mut self, pgid: PageId) -> Result<()> {
        if pgid == 0 {
            return Ok(());
        }
        self.pager.free(pgid)
    }

    /// Frees every page of the tree rooted at `root`, returning the headers
    /// of nested buckets found in its leaves. Materialised nodes take
    /// precedence over the pages they were read from.
    pub(crate) fn free_tree(&mut self, root: PageId) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pages = Vec::new();
        let mut nested = Vec::new();
        self.collect_pages(root, &mut pages, &mut nested)?;
        for pgid in pages {
            self.free_page(pgid)?;
        }
        for id in std::mem::take(&mut self.tree.nodes).into_values() {
            self.arena.remove(id);
        }
        self.tree.root_node = None;
        Ok(nested)
    }

    fn collect_pages(
        &self,
        pgid: PageId,
        pages: &mut Vec<PageId>,
        nested: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        if let Some(&id) = self.tree.nodes.get(&pgid) {
            let node = &self.arena[id];
            for inode in &node.inodes {
                if node.is_leaf {
                    if inode.flags.contains(LeafFlags::BUCKET) {
                        nested.push((inode.key().to_vec(), inode.value().to_vec()));
                    }
                } else {
                    self.collect_pages(inode.pgid, pages, nested)?;
                }
            }
        } else {
            let page = self.pager.page(pgid)?;
            if page.is_leaf() {
                for i in 0..page.count() as usize {
                    let elem = page.leaf_element(i);
                    if elem.is_bucket() {
                        nested.push((elem.key.to_vec(), elem.value.to_vec()));
                    }
                }
            } else if page.is_branch() {
                for i in 0..page.count() as usize {
                    self.collect_pages(page.branch_element(i).pgid, pages, nested)?;
                }
            } else {
                return Err(Error::Corrupted {
                    reason: format!("page {pgid} is a {} page inside a bucket", page.flags().kind()),
                });
            }
        }
        pages.push(pgid);
        Ok(())
    }

    /// Rebalances every materialised node, deepest first.
    pub(crate) fn rebalance_all(&mut self) -> Result<()> {
        let mut ids: Vec<NodeId> = self.tree.nodes.values().copied().collect();
        ids.sort_by(|a, b| self.arena[*b].depth.cmp(&self.arena[*a].depth));
        for id in ids {
            if self.arena.get(id).is_some() {
                self.rebalance(id)?;
            }
        }
        Ok(())
    }

    fn rebalance(&mut self, id: NodeId) -> Result<()> {
        let threshold = self.pager.page_size() / 4;
        let Some(node) = self.arena.get_mut(id) else {
            return Ok(());
        };
        if !node.unbalanced {
            return Ok(());
        }
        node.unbalanced = false;
        self.stats.rebalance += 1;

        if node.size() > threshold && node.inodes.len() >= MIN_KEYS_PER_PAGE {
            return Ok(());
        }

        let Some(parent) = node.parent else {
            if !node.is_leaf && node.inodes.len() == 1 {
                self.collapse_root(id)?;
            } else if !node.is_leaf && node.inodes.is_empty() {
                node.is_leaf = true;
                node.children.clear();
            }
            return Ok(());
        };

        if node.inodes.is_empty() {
            let key = std::mem::take(&mut node.key);
            let pgid = node.pgid;
            let parent_node = &mut self.arena[parent];
            parent_node.del(&key);
            parent_node.children.retain(|&child| child != id);
            self.tree.nodes.remove(&pgid);
            self.arena.remove(id);
            self.free_page(pgid)?;
            return self.rebalance(parent);
        }

        // A parent with a single entry has no sibling to merge with.
        if self.arena[parent].inodes.len() < 2 {
            return Ok(());
        }

        let index = self.arena[parent].child_index(&self.arena[id].key);
        if index == 0 {
            let sibling = self.child_at(parent, 1)?;
            self.merge(sibling, id, parent)?;
        } else {
            let sibling = self.child_at(parent, index - 1)?;
            self.merge(id, sibling, parent)?;
        }
        self.rebalance(parent)
    }

    /// Moves every entry of `from` onto the end of its left neighbour `into`
    /// and drops `from` from `parent`.
    fn merge(&mut self, from: NodeId, into: NodeId, parent: NodeId) -> Result<()> {
        let Some(source) = self.arena.remove(from) else {
            return Ok(());
        };
        self.tree.nodes.remove(&source.pgid);

        for &child in &source.children {
            self.arena[child].parent = Some(into);
        }
        let target = &mut self.arena[into];
        target.children.extend(source.children.iter().copied());
        target.inodes.extend(source.inodes);

        let parent_node = &mut self.arena[parent];
        parent_node.del(&source.key);
        parent_node.children.retain(|&child| child != from);
        self.free_page(source.pgid)
    }

    /// Replaces a single-child root branch by its child.
    fn collapse_root(&mut self, root: NodeId) -> Result<()> {
        let child = self.child_at(root, 0)?;
        let Some(child_node) = self.arena.remove(child) else {
            return Ok(());
        };
        self.tree.nodes.remove(&child_node.pgid);

        let root_node = &mut self.arena[root];
        root_node.is_leaf = child_node.is_leaf;
        root_node.inodes = child_node.inodes;
        root_node.children = child_node.children;
        let grandchildren = root_node.children.clone();
        for grandchild in grandchildren {
            self.arena[grandchild].parent = Some(root);
            self.set_depth(grandchild, 1);
        }
        self.free_page(child_node.pgid)
    }

    fn set_depth(&mut self, id: NodeId, depth: usize) {
        self.arena[id].depth = depth;
        let children = self.arena[id].children.clone();
        for child in children {
            self.set_depth(child, depth + 1);
        }
    }

    /// Writes every materialised node to fresh pages, deepest first. Returns
    /// the new root page id when the tree was materialised.
    pub(crate) fn spill(&mut self, fill_percent: f64) -> Result<Option<PageId>> {
        let Some(mut root) = self.tree.root_node else {
            return Ok(None);
        };

        let mut ids: Vec<NodeId> =
            self.tree.nodes.values().copied().filter(|&id| self.arena.get(id).is_some()).collect();
        ids.sort_by(|a, b| {
            let (a, b) = (&self.arena[*a], &self.arena[*b]);
            b.depth.cmp(&a.depth).then_with(|| a.key.cmp(&b.key))
        });
        for id in ids {
            self.spill_node(id, fill_percent)?;
        }

        // Splitting the root leaves it under a new parent that still needs pages.
        while let Some(parent) = self.arena[root].parent {
            root = parent;
            self.spill_node(root, fill_percent)?;
        }
        self.tree.root_node = Some(root);
        Ok(Some(self.arena[root].pgid))
    }

    fn spill_node(&mut self, id: NodeId, fill_percent: f64) -> Result<()> {
        if self.arena[id].spilled {
            return Ok(());
        }

        let page_size = self.pager.page_size();
        let siblings = self.arena[id].split(page_size, fill_percent);
        if !siblings.is_empty() {
            self.stats.split += siblings.len();
            if self.arena[id].parent.is_none() {
                let depth = self.arena[id].depth;
                let parent = self.arena.insert(Node {
                    is_leaf: false,
                    children: vec![id],
                    depth: depth.saturating_sub(1),
                    ..Node::default()
                });
                self.arena[id].parent = Some(parent);
            }
        }

        let old = std::mem::take(&mut self.arena[id].pgid);
        self.free_page(old)?;

        let pgid = self.write_node(id)?;
        let node = &mut self.arena[id];
        node.pgid = pgid;
        node.spilled = true;
        let parent = node.parent;
        let is_leaf = node.is_leaf;
        let depth = node.depth;
        let first = node.inodes.first().map(|inode| inode.key.clone());
        let old_key = if node.key.is_empty() {
            first.as_ref().map(|key| key.as_slice().to_vec()).unwrap_or_default()
        } else {
            std::mem::take(&mut node.key)
        };
        if let Some(first) = &first {
            node.key = first.as_slice().to_vec();
        }
        self.stats.spill += 1;

        let Some(parent) = parent else {
            return Ok(());
        };
        if let Some(first) = first {
            self.arena[parent].put(&old_key, first, NodeBytes::default(), pgid, LeafFlags::empty());
        }

        for group in siblings {
            let key = match group.first() {
                Some(inode) => inode.key.clone(),
                None => continue,
            };
            let sibling = self.arena.insert(Node {
                is_leaf,
                spilled: true,
                key: key.as_slice().to_vec(),
                parent: Some(parent),
                depth,
                inodes: group,
                ..Node::default()
            });
            self.arena[parent].children.push(sibling);
            let pgid = self.write_node(sibling)?;
            self.arena[sibling].pgid = pgid;
            let old_key = key.as_slice().to_vec();
            self.arena[parent].put(&old_key, key, NodeBytes::default(), pgid, LeafFlags::empty());
            self.stats.spill += 1;
        }
        Ok(())
    }

    fn write_node(&mut self, id: NodeId) -> Result<PageId> {
        let node = &self.arena[id];
        let count = pages_for(node.size(), self.pager.page_size());
        let pgid = self.pager.allocate(count)?;
        node.write(self.pager.page_mut(pgid)?);
        Ok(pgid)
    }
}
