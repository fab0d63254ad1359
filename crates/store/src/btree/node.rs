//! In-memory B+tree nodes.
//!
//! A write transaction materialises every page it touches as a [`Node`].
//! Nodes live in a per-transaction [`NodeArena`] and refer to their parent
//! and children by [`NodeId`], so the parent/child back links never form
//! owning cycles.
//!
//! Keys and values read from a page keep pointing into the memory map
//! ([`NodeBytes::Mapped`]) until the node is dereferenced or the entry is
//! replaced.

use std::fmt;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{Error, PageId, Result};
use crate::page::{
    BRANCH_ELEMENT_SIZE, LEAF_ELEMENT_SIZE, LeafFlags, PAGE_HEADER_SIZE, Page, PageFlags,
    PageHeader, PageMut,
};

/// Index of a node inside a [`NodeArena`].
pub(crate) type NodeId = usize;

/// Key or value bytes held by a node entry.
#[derive(Clone)]
pub(crate) enum NodeBytes {
    /// Slice of a memory map the transaction keeps alive.
    Mapped { map: Arc<Mmap>, offset: usize, len: usize },
    /// Heap copy.
    Owned(Vec<u8>),
}

impl NodeBytes {
    /// Borrows `bytes` from `map` when they lie inside it, otherwise copies them.
    pub(crate) fn from_page(bytes: &[u8], map: Option<&Arc<Mmap>>) -> Self {
        if let Some(map) = map {
            let base = map.as_ptr() as usize;
            let start = bytes.as_ptr() as usize;
            if start >= base && start + bytes.len() <= base + map.len() {
                return NodeBytes::Mapped { map: Arc::clone(map), offset: start - base, len: bytes.len() };
            }
        }
        NodeBytes::Owned(bytes.to_vec())
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        match self {
            NodeBytes::Mapped { map, offset, len } => &map[*offset..*offset + *len],
            NodeBytes::Owned(bytes) => bytes,
        }
    }

    pub(crate) fn is_mapped(&self) -> bool {
        matches!(self, NodeBytes::Mapped { .. })
    }

    /// Copies mapped bytes onto the heap. Returns whether a copy was made.
    pub(crate) fn make_owned(&mut self) -> bool {
        if let NodeBytes::Mapped { .. } = self {
            *self = NodeBytes::Owned(self.as_slice().to_vec());
            true
        } else {
            false
        }
    }
}

impl Default for NodeBytes {
    fn default() -> Self {
        NodeBytes::Owned(Vec::new())
    }
}

impl From<&[u8]> for NodeBytes {
    fn from(bytes: &[u8]) -> Self {
        NodeBytes::Owned(bytes.to_vec())
    }
}

impl From<Vec<u8>> for NodeBytes {
    fn from(bytes: Vec<u8>) -> Self {
        NodeBytes::Owned(bytes)
    }
}

impl fmt::Debug for NodeBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = if self.is_mapped() { "Mapped" } else { "Owned" };
        write!(f, "{tag}({:?})", String::from_utf8_lossy(self.as_slice()))
    }
}

/// One entry of a node: a leaf key/value or a branch separator/child.
#[derive(Debug, Clone, Default)]
pub(crate) struct INode {
    pub(crate) flags: LeafFlags,
    pub(crate) pgid: PageId,
    pub(crate) key: NodeBytes,
    pub(crate) value: NodeBytes,
}

impl INode {
    pub(crate) fn key(&self) -> &[u8] {
        self.key.as_slice()
    }

    pub(crate) fn value(&self) -> &[u8] {
        self.value.as_slice()
    }
}

/// Mutable image of a branch or leaf page.
#[derive(Debug, Default)]
pub(crate) struct Node {
    pub(crate) is_leaf: bool,
    pub(crate) unbalanced: bool,
    pub(crate) spilled: bool,
    /// Key this node is filed under in its parent.
    pub(crate) key: Vec<u8>,
    /// Source page, or 0 once freed / for a new node.
    pub(crate) pgid: PageId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) depth: usize,
    pub(crate) inodes: Vec<INode>,
}

impl Node {
    /// Materialises a branch or leaf page. Keys and values borrow from `map`
    /// when the page lives there.
    pub(crate) fn read(page: Page<'_>, map: Option<&Arc<Mmap>>) -> Result<Self> {
        let flags = page.flags();
        if flags != PageFlags::BRANCH && flags != PageFlags::LEAF {
            return Err(Error::Corrupted {
                reason: format!("page {} is a {} page, expected branch or leaf", page.id(), flags.kind()),
            });
        }
        if !page.elements_in_bounds() {
            return Err(Error::Corrupted {
                reason: format!("page {} has elements outside its bounds", page.id()),
            });
        }

        let is_leaf = flags == PageFlags::LEAF;
        let inodes: Vec<INode> = (0..page.count() as usize)
            .map(|i| {
                if is_leaf {
                    let elem = page.leaf_element(i);
                    INode {
                        flags: elem.flags,
                        pgid: 0,
                        key: NodeBytes::from_page(elem.key, map),
                        value: NodeBytes::from_page(elem.value, map),
                    }
                } else {
                    let elem = page.branch_element(i);
                    INode {
                        flags: LeafFlags::empty(),
                        pgid: elem.pgid,
                        key: NodeBytes::from_page(elem.key, map),
                        value: NodeBytes::default(),
                    }
                }
            })
            .collect();

        let key = inodes.first().map(|inode| inode.key().to_vec()).unwrap_or_default();
        Ok(Self { is_leaf, pgid: page.id(), key, inodes, ..Self::default() })
    }

    fn element_size(&self) -> usize {
        if self.is_leaf { LEAF_ELEMENT_SIZE } else { BRANCH_ELEMENT_SIZE }
    }

    /// Exact serialised size.
    pub(crate) fn size(&self) -> usize {
        let elem = self.element_size();
        PAGE_HEADER_SIZE
            + self.inodes.iter().map(|inode| elem + inode.key().len() + inode.value().len()).sum::<usize>()
    }

    /// First entry with key ≥ `key`, or whether `key` exists exactly.
    pub(crate) fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.inodes.binary_search_by(|inode| inode.key().cmp(key))
    }

    /// Inserts or replaces the entry filed under `old_key`, storing it under `new_key`.
    pub(crate) fn put(
        &mut self,
        old_key: &[u8],
        new_key: NodeBytes,
        value: NodeBytes,
        pgid: PageId,
        flags: LeafFlags,
    ) {
        let index = match self.search(old_key) {
            Ok(index) => index,
            Err(index) => {
                self.inodes.insert(index, INode::default());
                index
            }
        };
        let inode = &mut self.inodes[index];
        inode.flags = flags;
        inode.key = new_key;
        inode.value = value;
        inode.pgid = pgid;
    }

    /// Removes the entry for `key`. Returns whether it existed.
    pub(crate) fn del(&mut self, key: &[u8]) -> bool {
        match self.search(key) {
            Ok(index) => {
                self.inodes.remove(index);
                self.unbalanced = true;
                true
            }
            Err(_) => false,
        }
    }

    /// Serialises the node into `buf`, which holds the page header id and
    /// overflow already and is at least [`Node::size`] bytes long.
    pub(crate) fn write(&self, buf: &mut [u8]) {
        debug_assert!(self.inodes.len() < u16::MAX as usize, "node with {} entries", self.inodes.len());

        let mut page = PageMut::new(buf);
        let id = page.id();
        let overflow = page.as_page().overflow();
        let flags = if self.is_leaf { PageFlags::LEAF } else { PageFlags::BRANCH };
        page.set_header(&PageHeader { id, flags, count: self.inodes.len() as u16, overflow });

        let mut offset = PAGE_HEADER_SIZE + self.inodes.len() * self.element_size();
        for (i, inode) in self.inodes.iter().enumerate() {
            if self.is_leaf {
                page.put_leaf_element(i, offset, inode.flags, inode.key(), inode.value());
            } else {
                page.put_branch_element(i, offset, inode.key(), inode.pgid);
            }
            offset += inode.key().len() + inode.value().len();
        }
    }

    /// Index of the entry pointing at the child filed under `key`.
    pub(crate) fn child_index(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(index) | Err(index) => index,
        }
    }

    /// Copies every mapped key and value onto the heap. Returns the number of
    /// entries that were still borrowing the map.
    pub(crate) fn dereference(&mut self) -> usize {
        let mut copied = 0;
        for inode in &mut self.inodes {
            let key = inode.key.make_owned();
            let value = inode.value.make_owned();
            if key || value {
                copied += 1;
            }
        }
        copied
    }
}

/// Per-transaction storage for materialised nodes.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    slots: Vec<Option<Node>>,
}

impl NodeArena {
    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        self.slots.push(Some(node));
        self.slots.len() - 1
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id).and_then(Option::as_mut)
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    /// Number of live nodes.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Dereferences every live node. Returns the number of entries copied.
    pub(crate) fn dereference(&mut self) -> usize {
        self.slots.iter_mut().flatten().map(Node::dereference).sum()
    }
}

impl std::ops::Index<NodeId> for NodeArena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("node {id} was removed from the arena"),
        }
    }
}

impl std::ops::IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("node {id} was removed from the arena"),
        }
    }
}
