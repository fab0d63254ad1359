//! Node splitting for the spill phase of a commit.
//!
//! A node whose serialised size exceeds one page is cut, left to right, into
//! siblings that each fill roughly `page_size * fill_percent` bytes. Only the
//! node's own entries are considered; neighbouring pages are never inspected.
//! The first group stays with the original node so its parent entry can be
//! updated by its old key.

use super::node::{INode, Node};
use crate::page::{BRANCH_ELEMENT_SIZE, LEAF_ELEMENT_SIZE, MIN_KEYS_PER_PAGE, PAGE_HEADER_SIZE};

/// Smallest accepted fill percent.
pub const MIN_FILL_PERCENT: f64 = 0.1;

/// Largest accepted fill percent.
pub const MAX_FILL_PERCENT: f64 = 1.0;

/// Fill percent used when a bucket does not set one.
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Clamps a fill percent into the supported range.
pub fn clamp_fill_percent(fill_percent: f64) -> f64 {
    if fill_percent.is_nan() {
        return DEFAULT_FILL_PERCENT;
    }
    fill_percent.clamp(MIN_FILL_PERCENT, MAX_FILL_PERCENT)
}

impl Node {
    /// Splits the node's entries into page-sized groups.
    ///
    /// The node keeps the first group; the remaining groups are returned in
    /// key order, one per new sibling. An empty result means no split.
    pub(crate) fn split(&mut self, page_size: usize, fill_percent: f64) -> Vec<Vec<INode>> {
        let threshold = (page_size as f64 * clamp_fill_percent(fill_percent)) as usize;

        let mut groups = Vec::new();
        let mut rest = std::mem::take(&mut self.inodes);
        loop {
            if !needs_split(self.is_leaf, &rest, page_size) {
                groups.push(rest);
                break;
            }
            let index = split_index(self.is_leaf, &rest, threshold);
            let tail = rest.split_off(index);
            groups.push(rest);
            rest = tail;
        }

        let mut groups = groups.into_iter();
        self.inodes = groups.next().unwrap_or_default();
        groups.collect()
    }
}

fn entry_size(is_leaf: bool, inode: &INode) -> usize {
    let elem = if is_leaf { LEAF_ELEMENT_SIZE } else { BRANCH_ELEMENT_SIZE };
    elem + inode.key().len() + inode.value().len()
}

fn needs_split(is_leaf: bool, inodes: &[INode], page_size: usize) -> bool {
    if inodes.len() <= MIN_KEYS_PER_PAGE * 2 {
        return false;
    }
    let size: usize = PAGE_HEADER_SIZE + inodes.iter().map(|inode| entry_size(is_leaf, inode)).sum::<usize>();
    size > page_size
}

/// Index of the first entry of the next sibling: the current group holds at
/// least [`MIN_KEYS_PER_PAGE`] entries, stops before exceeding `threshold`,
/// and leaves at least [`MIN_KEYS_PER_PAGE`] entries behind.
fn split_index(is_leaf: bool, inodes: &[INode], threshold: usize) -> usize {
    let mut size = PAGE_HEADER_SIZE;
    let last = inodes.len() - MIN_KEYS_PER_PAGE;
    for (i, inode) in inodes.iter().enumerate().take(last) {
        let entry = entry_size(is_leaf, inode);
        if i >= MIN_KEYS_PER_PAGE && size + entry > threshold {
            return i;
        }
        size += entry;
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::NodeBytes;
    use crate::page::LeafFlags;

    fn leaf_with(count: usize, value_len: usize) -> Node {
        let mut node = Node { is_leaf: true, ..Node::default() };
        for i in 0..count {
            let key = format!("{i:08}").into_bytes();
            node.put(&key, NodeBytes::from(key.clone()), vec![b'v'; value_len].into(), 0, LeafFlags::empty());
        }
        node
    }

    #[test]
    fn test_small_node_does_not_split() {
        let mut node = leaf_with(10, 8);
        assert!(node.split(4096, 0.5).is_empty());
        assert_eq!(node.inodes.len(), 10);
    }

    #[test]
    fn test_few_large_entries_do_not_split() {
        // Four entries never split, however large.
        let mut node = leaf_with(MIN_KEYS_PER_PAGE * 2, 5000);
        assert!(node.split(4096, 0.5).is_empty());
    }

    #[test]
    fn test_split_respects_fill_percent() {
        // 100 entries of 16 + 8 + 100 = 124 bytes each.
        let mut node = leaf_with(100, 100);
        let siblings = node.split(4096, 0.5);
        assert!(!siblings.is_empty());

        let threshold = 2048;
        let mut groups = vec![node.inodes.len()];
        groups.extend(siblings.iter().map(Vec::len));
        assert_eq!(groups.iter().sum::<usize>(), 100);

        for group in std::iter::once(&node.inodes).chain(siblings.iter()) {
            assert!(group.len() >= MIN_KEYS_PER_PAGE);
            let size = PAGE_HEADER_SIZE + group.len() * (LEAF_ELEMENT_SIZE + 8 + 100);
            assert!(size <= 4096, "group of {} bytes exceeds a page", size);
        }
        // Every group but the last stops at the threshold.
        let first_size = PAGE_HEADER_SIZE + node.inodes.len() * (LEAF_ELEMENT_SIZE + 108);
        assert!(first_size <= threshold);
    }

    #[test]
    fn test_higher_fill_percent_makes_fewer_siblings() {
        let mut half = leaf_with(200, 100);
        let mut full = leaf_with(200, 100);
        let half_groups = half.split(4096, 0.5).len() + 1;
        let full_groups = full.split(4096, 1.0).len() + 1;
        assert!(full_groups < half_groups, "{full_groups} vs {half_groups}");
    }

    #[test]
    fn test_split_keeps_key_order() {
        let mut node = leaf_with(300, 40);
        let siblings = node.split(4096, 0.5);
        let mut keys: Vec<Vec<u8>> = node.inodes.iter().map(|i| i.key().to_vec()).collect();
        for group in &siblings {
            keys.extend(group.iter().map(|i| i.key().to_vec()));
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 300);
    }

    #[test]
    fn test_large_value_gets_own_group() {
        let mut node = leaf_with(40, 10);
        let big = b"00000020-big".to_vec();
        node.put(&big, NodeBytes::from(big.clone()), vec![0u8; 10_000].into(), 0, LeafFlags::empty());
        let siblings = node.split(4096, 0.5);
        assert!(!siblings.is_empty());
        let total: usize = node.inodes.len() + siblings.iter().map(Vec::len).sum::<usize>();
        assert_eq!(total, 41);
    }

    #[test]
    fn test_clamp_fill_percent() {
        assert_eq!(clamp_fill_percent(0.0), MIN_FILL_PERCENT);
        assert_eq!(clamp_fill_percent(2.0), MAX_FILL_PERCENT);
        assert_eq!(clamp_fill_percent(0.75), 0.75);
        assert_eq!(clamp_fill_percent(f64::NAN), DEFAULT_FILL_PERCENT);
    }
}
