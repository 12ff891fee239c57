//! On-disk node layout and typed field accessors.
//!
//! Every page of the database file is one B+-tree node. A node is an opaque
//! 4096-byte buffer; this module knows where each field lives inside it and
//! exposes byte-range views instead of raw pointer arithmetic.
//!
//! | Property           | Internal node                 | Leaf node           |
//! |--------------------|-------------------------------|---------------------|
//! | Stores             | keys and child page numbers   | keys and rows       |
//! | Number of keys     | up to `INTERNAL_MAX_KEYS`     | as many as will fit |
//! | Number of pointers | number of keys + 1            | none                |
//! | Key purpose        | routing                       | paired with row     |

use crate::storage::pager::{INVALID_PAGE_NUM, PAGE_SIZE};
use crate::storage::row::ROW_SIZE;
use std::fmt::Write;

/// Discriminates the two node shapes sharing the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Internal,
    Leaf,
}

// Common node header layout.
const NODE_TYPE_SIZE: usize = 1;
const NODE_TYPE_OFFSET: usize = 0;
const IS_ROOT_SIZE: usize = 1;
const IS_ROOT_OFFSET: usize = NODE_TYPE_OFFSET + NODE_TYPE_SIZE;
const PARENT_POINTER_SIZE: usize = 4;
const PARENT_POINTER_OFFSET: usize = IS_ROOT_OFFSET + IS_ROOT_SIZE;
pub const COMMON_NODE_HEADER_SIZE: usize = NODE_TYPE_SIZE + IS_ROOT_SIZE + PARENT_POINTER_SIZE;

// Leaf node header layout.
const LEAF_NUM_CELLS_SIZE: usize = 4;
const LEAF_NUM_CELLS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
const LEAF_NEXT_LEAF_SIZE: usize = 4;
const LEAF_NEXT_LEAF_OFFSET: usize = LEAF_NUM_CELLS_OFFSET + LEAF_NUM_CELLS_SIZE;
pub const LEAF_NODE_HEADER_SIZE: usize =
    COMMON_NODE_HEADER_SIZE + LEAF_NUM_CELLS_SIZE + LEAF_NEXT_LEAF_SIZE;

// Leaf node body layout.
const LEAF_KEY_SIZE: usize = 4;
pub const LEAF_NODE_CELL_SIZE: usize = LEAF_KEY_SIZE + ROW_SIZE;
pub const LEAF_NODE_SPACE_FOR_CELLS: usize = PAGE_SIZE - LEAF_NODE_HEADER_SIZE;
pub const LEAF_NODE_MAX_CELLS: u32 = (LEAF_NODE_SPACE_FOR_CELLS / LEAF_NODE_CELL_SIZE) as u32;
pub const LEAF_NODE_RIGHT_SPLIT_COUNT: u32 = (LEAF_NODE_MAX_CELLS + 1) / 2;
pub const LEAF_NODE_LEFT_SPLIT_COUNT: u32 = LEAF_NODE_MAX_CELLS + 1 - LEAF_NODE_RIGHT_SPLIT_COUNT;
/// A non-root leaf that drops below this many cells gets rebalanced.
pub const LEAF_NODE_MIN_CELLS: u32 = LEAF_NODE_LEFT_SPLIT_COUNT;

// Internal node header layout.
const INTERNAL_NUM_KEYS_SIZE: usize = 4;
const INTERNAL_NUM_KEYS_OFFSET: usize = COMMON_NODE_HEADER_SIZE;
const INTERNAL_RIGHT_CHILD_SIZE: usize = 4;
const INTERNAL_RIGHT_CHILD_OFFSET: usize = INTERNAL_NUM_KEYS_OFFSET + INTERNAL_NUM_KEYS_SIZE;
pub const INTERNAL_NODE_HEADER_SIZE: usize =
    COMMON_NODE_HEADER_SIZE + INTERNAL_NUM_KEYS_SIZE + INTERNAL_RIGHT_CHILD_SIZE;

// Internal node body layout.
const INTERNAL_CHILD_SIZE: usize = 4;
const INTERNAL_KEY_SIZE: usize = 4;
pub const INTERNAL_NODE_CELL_SIZE: usize = INTERNAL_CHILD_SIZE + INTERNAL_KEY_SIZE;
/// Kept deliberately small so rebalancing kicks in with few rows.
pub const INTERNAL_NODE_MAX_KEYS: u32 = 3;

/// One 4096-byte node buffer.
#[derive(Clone)]
pub struct Page {
    pub(crate) data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new() -> Self {
        Page {
            data: [0; PAGE_SIZE],
        }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn node_type(&self) -> NodeType {
        match self.data[NODE_TYPE_OFFSET] {
            0 => NodeType::Internal,
            1 => NodeType::Leaf,
            other => panic!("invalid node type byte {other}"),
        }
    }

    pub fn set_node_type(&mut self, node_type: NodeType) {
        self.data[NODE_TYPE_OFFSET] = match node_type {
            NodeType::Internal => 0,
            NodeType::Leaf => 1,
        };
    }

    pub fn is_root(&self) -> bool {
        self.data[IS_ROOT_OFFSET] == 1
    }

    pub fn set_root(&mut self, is_root: bool) {
        self.data[IS_ROOT_OFFSET] = is_root as u8;
    }

    pub fn parent(&self) -> u32 {
        self.read_u32(PARENT_POINTER_OFFSET)
    }

    pub fn set_parent(&mut self, parent: u32) {
        self.write_u32(PARENT_POINTER_OFFSET, parent);
    }

    /// Reset the buffer to an empty non-root leaf.
    pub fn init_leaf(&mut self) {
        self.data.fill(0);
        self.set_node_type(NodeType::Leaf);
        self.set_root(false);
        self.set_leaf_num_cells(0);
        self.set_leaf_next(0); // 0 represents no sibling
    }

    /// Reset the buffer to an empty non-root internal node.
    ///
    /// The right child starts at `INVALID_PAGE_NUM`: page 0 is the root, so a
    /// zeroed right child would silently make this node a parent of the root.
    pub fn init_internal(&mut self) {
        self.data.fill(0);
        self.set_node_type(NodeType::Internal);
        self.set_root(false);
        self.set_internal_num_keys(0);
        self.set_internal_right_child(INVALID_PAGE_NUM);
    }

    // Leaf accessors.

    pub fn leaf_num_cells(&self) -> u32 {
        self.read_u32(LEAF_NUM_CELLS_OFFSET)
    }

    pub fn set_leaf_num_cells(&mut self, num: u32) {
        self.write_u32(LEAF_NUM_CELLS_OFFSET, num);
    }

    pub fn leaf_next(&self) -> u32 {
        self.read_u32(LEAF_NEXT_LEAF_OFFSET)
    }

    pub fn set_leaf_next(&mut self, next: u32) {
        self.write_u32(LEAF_NEXT_LEAF_OFFSET, next);
    }

    fn leaf_cell_offset(cell_num: u32) -> usize {
        assert!(
            cell_num < LEAF_NODE_MAX_CELLS,
            "leaf cell {cell_num} out of bounds"
        );
        LEAF_NODE_HEADER_SIZE + cell_num as usize * LEAF_NODE_CELL_SIZE
    }

    pub fn leaf_cell(&self, cell_num: u32) -> &[u8] {
        let offset = Self::leaf_cell_offset(cell_num);
        &self.data[offset..offset + LEAF_NODE_CELL_SIZE]
    }

    pub fn leaf_cell_mut(&mut self, cell_num: u32) -> &mut [u8] {
        let offset = Self::leaf_cell_offset(cell_num);
        &mut self.data[offset..offset + LEAF_NODE_CELL_SIZE]
    }

    pub fn leaf_key(&self, cell_num: u32) -> u32 {
        self.read_u32(Self::leaf_cell_offset(cell_num))
    }

    pub fn set_leaf_key(&mut self, cell_num: u32, key: u32) {
        self.write_u32(Self::leaf_cell_offset(cell_num), key);
    }

    pub fn leaf_value(&self, cell_num: u32) -> &[u8] {
        &self.leaf_cell(cell_num)[LEAF_KEY_SIZE..]
    }

    pub fn leaf_value_mut(&mut self, cell_num: u32) -> &mut [u8] {
        &mut self.leaf_cell_mut(cell_num)[LEAF_KEY_SIZE..]
    }

    /// Key of the last cell. Callers guarantee the leaf is non-empty.
    pub fn leaf_max_key(&self) -> u32 {
        self.leaf_key(self.leaf_num_cells() - 1)
    }

    /// Shift cells `[from..num_cells)` one slot to the right, opening `from`.
    pub fn leaf_shift_right(&mut self, from: u32) {
        let num_cells = self.leaf_num_cells();
        let start = Self::leaf_cell_offset(from);
        let end = start + (num_cells - from) as usize * LEAF_NODE_CELL_SIZE;
        self.data.copy_within(start..end, start + LEAF_NODE_CELL_SIZE);
    }

    /// Shift cells `[from+1..num_cells)` one slot to the left, dropping `from`.
    pub fn leaf_shift_left(&mut self, from: u32) {
        let num_cells = self.leaf_num_cells();
        let start = Self::leaf_cell_offset(from + 1);
        let end = start + (num_cells - from - 1) as usize * LEAF_NODE_CELL_SIZE;
        self.data.copy_within(start..end, start - LEAF_NODE_CELL_SIZE);
    }

    /// Binary search for `key`: its cell on a hit, the insertion position on
    /// a miss.
    pub fn leaf_find(&self, key: u32) -> u32 {
        let mut min_index = 0;
        let mut one_past_max_index = self.leaf_num_cells();
        while one_past_max_index != min_index {
            let index = (min_index + one_past_max_index) / 2;
            let key_at_index = self.leaf_key(index);
            if key == key_at_index {
                return index;
            }
            if key < key_at_index {
                one_past_max_index = index;
            } else {
                min_index = index + 1;
            }
        }
        min_index
    }

    // Internal accessors.

    pub fn internal_num_keys(&self) -> u32 {
        self.read_u32(INTERNAL_NUM_KEYS_OFFSET)
    }

    pub fn set_internal_num_keys(&mut self, num: u32) {
        self.write_u32(INTERNAL_NUM_KEYS_OFFSET, num);
    }

    pub fn internal_right_child(&self) -> u32 {
        self.read_u32(INTERNAL_RIGHT_CHILD_OFFSET)
    }

    pub fn set_internal_right_child(&mut self, child: u32) {
        self.write_u32(INTERNAL_RIGHT_CHILD_OFFSET, child);
    }

    fn internal_cell_offset(cell_num: u32) -> usize {
        INTERNAL_NODE_HEADER_SIZE + cell_num as usize * INTERNAL_NODE_CELL_SIZE
    }

    /// Child page number at `child_num`. `child_num == num_keys` resolves to
    /// the right child. Following an invalid pointer is a structural failure.
    pub fn internal_child(&self, child_num: u32) -> u32 {
        let num_keys = self.internal_num_keys();
        assert!(
            child_num <= num_keys,
            "tried to access child {child_num} of a node with {num_keys} keys"
        );
        let child = if child_num == num_keys {
            self.internal_right_child()
        } else {
            self.read_u32(Self::internal_cell_offset(child_num))
        };
        assert!(
            child != INVALID_PAGE_NUM,
            "tried to follow an invalid child pointer"
        );
        child
    }

    pub fn set_internal_child(&mut self, cell_num: u32, child: u32) {
        self.write_u32(Self::internal_cell_offset(cell_num), child);
    }

    pub fn internal_key(&self, key_num: u32) -> u32 {
        self.read_u32(Self::internal_cell_offset(key_num) + INTERNAL_CHILD_SIZE)
    }

    pub fn set_internal_key(&mut self, key_num: u32, key: u32) {
        self.write_u32(Self::internal_cell_offset(key_num) + INTERNAL_CHILD_SIZE, key);
    }

    /// Shift cells `[from..num_keys)` one slot to the right.
    pub fn internal_shift_right(&mut self, from: u32) {
        let num_keys = self.internal_num_keys();
        let start = Self::internal_cell_offset(from);
        let end = start + (num_keys - from) as usize * INTERNAL_NODE_CELL_SIZE;
        self.data
            .copy_within(start..end, start + INTERNAL_NODE_CELL_SIZE);
    }

    /// Shift cells `[from+1..num_keys)` one slot to the left, dropping `from`.
    pub fn internal_shift_left(&mut self, from: u32) {
        let num_keys = self.internal_num_keys();
        let start = Self::internal_cell_offset(from + 1);
        let end = start + (num_keys - from - 1) as usize * INTERNAL_NODE_CELL_SIZE;
        self.data
            .copy_within(start..end, start - INTERNAL_NODE_CELL_SIZE);
    }

    /// Index of the child whose subtree should contain `key`: the smallest
    /// cell whose key is >= `key`, or `num_keys` for the right child.
    pub fn internal_find_child(&self, key: u32) -> u32 {
        let num_keys = self.internal_num_keys();
        let mut min_index = 0;
        let mut max_index = num_keys; // one more child than key
        while min_index != max_index {
            let index = (min_index + max_index) / 2;
            if self.internal_key(index) >= key {
                max_index = index;
            } else {
                min_index = index + 1;
            }
        }
        min_index
    }

    /// Rewrite the cell key that routed to `old_key` with `new_key`.
    pub fn update_internal_key(&mut self, old_key: u32, new_key: u32) {
        let index = self.internal_find_child(old_key);
        self.set_internal_key(index, new_key);
    }
}

/// Layout summary for the `.constants` meta command.
pub fn layout_report() -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ROW_SIZE: {}", ROW_SIZE);
    let _ = writeln!(out, "COMMON_NODE_HEADER_SIZE: {}", COMMON_NODE_HEADER_SIZE);
    let _ = writeln!(out, "LEAF_NODE_HEADER_SIZE: {}", LEAF_NODE_HEADER_SIZE);
    let _ = writeln!(out, "LEAF_NODE_CELL_SIZE: {}", LEAF_NODE_CELL_SIZE);
    let _ = writeln!(out, "LEAF_NODE_SPACE_FOR_CELLS: {}", LEAF_NODE_SPACE_FOR_CELLS);
    let _ = writeln!(out, "LEAF_NODE_MAX_CELLS: {}", LEAF_NODE_MAX_CELLS);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::row::Row;

    #[test]
    fn layout_constants_match_the_file_format() {
        assert_eq!(COMMON_NODE_HEADER_SIZE, 6);
        assert_eq!(LEAF_NODE_HEADER_SIZE, 14);
        assert_eq!(LEAF_NODE_CELL_SIZE, 297);
        assert_eq!(LEAF_NODE_MAX_CELLS, 13);
        assert_eq!(LEAF_NODE_LEFT_SPLIT_COUNT, 7);
        assert_eq!(LEAF_NODE_RIGHT_SPLIT_COUNT, 7);
        assert_eq!(INTERNAL_NODE_HEADER_SIZE, 14);
        assert_eq!(INTERNAL_NODE_CELL_SIZE, 8);
    }

    #[test]
    fn leaf_cells_roundtrip() {
        let mut page = Page::new();
        page.init_leaf();
        let row = Row::new(7, "carol", "carol@example.com").unwrap();
        page.set_leaf_num_cells(1);
        page.set_leaf_key(0, 7);
        row.serialize(page.leaf_value_mut(0));
        assert_eq!(page.leaf_key(0), 7);
        assert_eq!(Row::deserialize(page.leaf_value(0)), row);
        assert_eq!(page.leaf_max_key(), 7);
    }

    #[test]
    fn fresh_internal_node_has_invalid_right_child() {
        let mut page = Page::new();
        page.init_internal();
        assert_eq!(page.node_type(), NodeType::Internal);
        assert_eq!(page.internal_right_child(), INVALID_PAGE_NUM);
        assert_eq!(page.internal_num_keys(), 0);
    }

    #[test]
    fn internal_find_child_routes_by_key() {
        let mut page = Page::new();
        page.init_internal();
        page.set_internal_num_keys(2);
        page.set_internal_child(0, 3);
        page.set_internal_key(0, 10);
        page.set_internal_child(1, 4);
        page.set_internal_key(1, 20);
        page.set_internal_right_child(5);

        assert_eq!(page.internal_find_child(1), 0);
        assert_eq!(page.internal_find_child(10), 0);
        assert_eq!(page.internal_find_child(11), 1);
        assert_eq!(page.internal_find_child(20), 1);
        assert_eq!(page.internal_find_child(21), 2);
        assert_eq!(page.internal_child(2), 5);
    }

    #[test]
    fn leaf_find_returns_hit_or_insertion_point() {
        let mut page = Page::new();
        page.init_leaf();
        page.set_leaf_num_cells(3);
        for (i, key) in [10, 20, 30].iter().enumerate() {
            page.set_leaf_key(i as u32, *key);
        }
        assert_eq!(page.leaf_find(20), 1);
        assert_eq!(page.leaf_find(5), 0);
        assert_eq!(page.leaf_find(25), 2);
        assert_eq!(page.leaf_find(35), 3);
    }

    #[test]
    fn shifts_preserve_neighbouring_cells() {
        let mut page = Page::new();
        page.init_leaf();
        page.set_leaf_num_cells(3);
        for (i, key) in [10, 20, 30].iter().enumerate() {
            page.set_leaf_key(i as u32, *key);
        }
        page.leaf_shift_right(1);
        page.set_leaf_num_cells(4);
        page.set_leaf_key(1, 15);
        let keys: Vec<u32> = (0..4).map(|i| page.leaf_key(i)).collect();
        assert_eq!(keys, vec![10, 15, 20, 30]);

        page.leaf_shift_left(1);
        page.set_leaf_num_cells(3);
        let keys: Vec<u32> = (0..3).map(|i| page.leaf_key(i)).collect();
        assert_eq!(keys, vec![10, 20, 30]);
    }

    #[test]
    #[should_panic(expected = "invalid child pointer")]
    fn following_an_invalid_right_child_panics() {
        let mut page = Page::new();
        page.init_internal();
        page.internal_child(0);
    }
}
