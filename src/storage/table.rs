//! The table and its B+-tree.
//!
//! All tree surgery lives here: descent is in `cursor`, byte layout in
//! `node`, page residency in `pager`. Nodes refer to each other by page
//! number only; every traversal step goes back through the pager, which keeps
//! the working set bounded no matter how large the tree grows.
//!
//! Splits move cells rightward into a freshly allocated sibling and push one
//! routing key up, growing the tree at the root so page 0 stays the root
//! forever. Deletion is the mirror image: an underfull node borrows from or
//! folds into a sibling, parents shed keys, and the root collapses back into
//! a single leaf when only one child remains. Whenever the largest key of a
//! subtree changes, the one ancestor cell that routed on it is rewritten.

use crate::errors::{DbError, DbResult};
use crate::storage::cursor::Cursor;
use crate::storage::node::{
    NodeType, INTERNAL_NODE_MAX_KEYS, LEAF_NODE_LEFT_SPLIT_COUNT, LEAF_NODE_MAX_CELLS,
    LEAF_NODE_MIN_CELLS, LEAF_NODE_RIGHT_SPLIT_COUNT,
};
use crate::storage::pager::{Pager, PinScope, INVALID_PAGE_NUM, MAX_LOADED_PAGES};
use crate::storage::row::Row;
use std::path::Path;
use tracing::debug;

pub struct Table {
    pub(crate) pager: Pager,
    pub(crate) root_page_num: u32,
}

impl Table {
    pub fn open(path: &Path) -> DbResult<Self> {
        Self::open_with_capacity(path, MAX_LOADED_PAGES)
    }

    /// Open with a reduced buffer pool, used by tests to force eviction.
    pub fn open_with_capacity(path: &Path, capacity: usize) -> DbResult<Self> {
        let pager = Pager::open_with_capacity(path, capacity)?;
        let mut table = Table {
            pager,
            root_page_num: 0,
        };
        if table.pager.num_pages() == 0 {
            // Brand new database: page 0 starts life as an empty root leaf.
            table.with_scope(|table, scope| {
                let root = table.pager.get(0, scope)?;
                let mut node = root.borrow_mut();
                node.init_leaf();
                node.set_root(true);
                Ok(())
            })?;
        }
        Ok(table)
    }

    /// Flush everything and close the file.
    pub fn close(self) -> DbResult<()> {
        self.pager.close()
    }

    /// Run `f` with a fresh pin scope and bulk-unpin on every exit path.
    pub(crate) fn with_scope<T>(
        &mut self,
        f: impl FnOnce(&mut Table, &mut PinScope) -> DbResult<T>,
    ) -> DbResult<T> {
        let mut scope = PinScope::default();
        let result = f(self, &mut scope);
        self.pager.unpin_all(scope);
        result
    }

    /// Insert a row keyed by its id. Rejects an id that is already present.
    pub fn insert(&mut self, row: &Row) -> DbResult<()> {
        let key = row.id;
        let cursor = self.find(key)?;
        let duplicate = self.with_scope(|table, scope| {
            let page = table.pager.get(cursor.page_num, scope)?;
            let node = page.borrow();
            Ok(cursor.cell_num < node.leaf_num_cells() && node.leaf_key(cursor.cell_num) == key)
        })?;
        if duplicate {
            return Err(DbError::DuplicateKey(key));
        }
        self.leaf_insert(cursor, key, row)
    }

    /// Remove the row with the given key.
    pub fn delete(&mut self, key: u32) -> DbResult<()> {
        let cursor = self.find(key)?;
        let present = self.with_scope(|table, scope| {
            let page = table.pager.get(cursor.page_num, scope)?;
            let node = page.borrow();
            Ok(cursor.cell_num < node.leaf_num_cells() && node.leaf_key(cursor.cell_num) == key)
        })?;
        if !present {
            return Err(DbError::KeyNotFound(key));
        }
        self.leaf_delete(cursor)
    }

    /// Every row in ascending key order.
    pub fn select(&mut self) -> DbResult<Vec<Row>> {
        let mut rows = Vec::new();
        let mut cursor = self.start()?;
        while !cursor.end_of_table {
            rows.push(self.row_at(&cursor)?);
            self.advance(&mut cursor)?;
        }
        Ok(rows)
    }

    /// Largest key reachable from `page_num`: the last cell of the rightmost
    /// leaf below it.
    fn max_key(&mut self, page_num: u32) -> DbResult<u32> {
        self.with_scope(|table, scope| {
            let mut current = page_num;
            loop {
                let page = table.pager.get(current, scope)?;
                let node = page.borrow();
                match node.node_type() {
                    NodeType::Leaf => return Ok(node.leaf_max_key()),
                    NodeType::Internal => {
                        let right = node.internal_right_child();
                        assert!(
                            right != INVALID_PAGE_NUM,
                            "tried to follow an invalid child pointer"
                        );
                        drop(node);
                        current = right;
                    }
                }
            }
        })
    }

    /// Rewrite one node's parent pointer under its own short-lived pin, so
    /// bulk pointer fixups never crowd the frame pool.
    fn set_parent_of(&mut self, page_num: u32, parent: u32) -> DbResult<()> {
        self.with_scope(|table, scope| {
            let page = table.pager.get(page_num, scope)?;
            page.borrow_mut().set_parent(parent);
            Ok(())
        })
    }

    /// After the max key of the subtree rooted at `start_page` changed from
    /// `old_max` to `new_max`, rewrite the one ancestor cell that routed on
    /// it. Climb while the current node is its parent's right child; at the
    /// root there is nothing to update, since no cell records a global max.
    fn update_ancestor_keys(&mut self, start_page: u32, old_max: u32, new_max: u32) -> DbResult<()> {
        self.with_scope(|table, scope| {
            let mut child_num = start_page;
            loop {
                let parent_num = {
                    let page = table.pager.get(child_num, scope)?;
                    let node = page.borrow();
                    if node.is_root() {
                        return Ok(());
                    }
                    node.parent()
                };
                let parent_page = table.pager.get(parent_num, scope)?;
                let mut parent = parent_page.borrow_mut();
                if parent.internal_right_child() == child_num {
                    drop(parent);
                    child_num = parent_num;
                } else {
                    parent.update_internal_key(old_max, new_max);
                    return Ok(());
                }
            }
        })
    }

    // Insertion.

    fn leaf_insert(&mut self, cursor: Cursor, key: u32, row: &Row) -> DbResult<()> {
        self.with_scope(|table, scope| {
            let page = table.pager.get(cursor.page_num, scope)?;
            let num_cells = page.borrow().leaf_num_cells();
            if num_cells >= LEAF_NODE_MAX_CELLS {
                return table.leaf_split_and_insert(cursor, key, row);
            }
            let mut node = page.borrow_mut();
            if cursor.cell_num < num_cells {
                node.leaf_shift_right(cursor.cell_num);
            }
            node.set_leaf_num_cells(num_cells + 1);
            node.set_leaf_key(cursor.cell_num, key);
            row.serialize(node.leaf_value_mut(cursor.cell_num));
            Ok(())
        })
    }

    /// Split a full leaf around an insertion point: allocate a right
    /// sibling, spread the thirteen existing cells plus the new one evenly
    /// across both, then grow the parent.
    fn leaf_split_and_insert(&mut self, cursor: Cursor, key: u32, row: &Row) -> DbResult<()> {
        debug!(page_num = cursor.page_num, key, "splitting leaf node");
        let old_max = self.max_key(cursor.page_num)?;
        let new_page_num = self.pager.allocate_page();
        self.with_scope(|table, scope| {
            let old_page = table.pager.get(cursor.page_num, scope)?;
            let new_page = table.pager.get(new_page_num, scope)?;
            {
                let mut new_node = new_page.borrow_mut();
                let mut old_node = old_page.borrow_mut();
                new_node.init_leaf();
                new_node.set_parent(old_node.parent());
                // The old leaf's successor becomes the new leaf, which
                // inherits the old successor.
                new_node.set_leaf_next(old_node.leaf_next());
                old_node.set_leaf_next(new_page_num);

                // Walk the conceptual fourteen-cell sequence from the top,
                // dropping each element into slot i mod 7 of its half.
                let snapshot = old_node.clone();
                for i in (0..=LEAF_NODE_MAX_CELLS).rev() {
                    let dest = if i >= LEAF_NODE_LEFT_SPLIT_COUNT {
                        &mut *new_node
                    } else {
                        &mut *old_node
                    };
                    let index_within = i % LEAF_NODE_LEFT_SPLIT_COUNT;
                    if i == cursor.cell_num {
                        dest.set_leaf_key(index_within, key);
                        row.serialize(dest.leaf_value_mut(index_within));
                    } else if i > cursor.cell_num {
                        dest.leaf_cell_mut(index_within)
                            .copy_from_slice(snapshot.leaf_cell(i - 1));
                    } else {
                        dest.leaf_cell_mut(index_within)
                            .copy_from_slice(snapshot.leaf_cell(i));
                    }
                }
                old_node.set_leaf_num_cells(LEAF_NODE_LEFT_SPLIT_COUNT);
                new_node.set_leaf_num_cells(LEAF_NODE_RIGHT_SPLIT_COUNT);
            }

            if old_page.borrow().is_root() {
                table.create_new_root(new_page_num)
            } else {
                let parent_page_num = old_page.borrow().parent();
                let new_max = table.max_key(cursor.page_num)?;
                {
                    let parent = table.pager.get(parent_page_num, scope)?;
                    parent.borrow_mut().update_internal_key(old_max, new_max);
                }
                table.internal_insert(parent_page_num, new_page_num)
            }
        })
    }

    /// Grow the tree at the root: the old root's bytes move wholesale to a
    /// new left child, and page 0 becomes an internal node with exactly the
    /// left and right children.
    fn create_new_root(&mut self, right_child_page_num: u32) -> DbResult<()> {
        debug!(right_child_page_num, "creating new root");
        let root_page_num = self.root_page_num;
        let left_child_page_num = self.pager.allocate_page();
        self.with_scope(|table, scope| {
            let root = table.pager.get(root_page_num, scope)?;
            let right_child = table.pager.get(right_child_page_num, scope)?;
            let left_child = table.pager.get(left_child_page_num, scope)?;

            let root_was_internal = root.borrow().node_type() == NodeType::Internal;
            if root_was_internal {
                // An internal split hands us a still-empty right sibling.
                right_child.borrow_mut().init_internal();
            }

            // Copy first, then fix the flags on the copy.
            {
                let root_node = root.borrow();
                let mut left = left_child.borrow_mut();
                left.data.copy_from_slice(&root_node.data);
                left.set_root(false);
            }

            if root_was_internal {
                let children: Vec<u32> = {
                    let left = left_child.borrow();
                    (0..=left.internal_num_keys())
                        .map(|i| left.internal_child(i))
                        .collect()
                };
                for child_num in children {
                    table.set_parent_of(child_num, left_child_page_num)?;
                }
            }

            let left_child_max = table.max_key(left_child_page_num)?;
            {
                let mut root_node = root.borrow_mut();
                root_node.init_internal();
                root_node.set_root(true);
                root_node.set_internal_num_keys(1);
                root_node.set_internal_child(0, left_child_page_num);
                root_node.set_internal_key(0, left_child_max);
                root_node.set_internal_right_child(right_child_page_num);
            }
            left_child.borrow_mut().set_parent(root_page_num);
            right_child.borrow_mut().set_parent(root_page_num);
            Ok(())
        })
    }

    /// Record `child_page` in `parent_page`, keyed by the child's max key.
    fn internal_insert(&mut self, parent_page_num: u32, child_page_num: u32) -> DbResult<()> {
        self.with_scope(|table, scope| {
            let (num_keys, right_child_page_num) = {
                let parent = table.pager.get(parent_page_num, scope)?;
                let node = parent.borrow();
                (node.internal_num_keys(), node.internal_right_child())
            };
            if num_keys >= INTERNAL_NODE_MAX_KEYS {
                return table.internal_split_and_insert(parent_page_num, child_page_num);
            }
            // An internal node whose right child is the invalid sentinel is
            // freshly initialized and empty.
            if right_child_page_num == INVALID_PAGE_NUM {
                let parent = table.pager.get(parent_page_num, scope)?;
                parent.borrow_mut().set_internal_right_child(child_page_num);
                return Ok(());
            }

            let child_max = table.max_key(child_page_num)?;
            let right_child_max = table.max_key(right_child_page_num)?;

            let parent = table.pager.get(parent_page_num, scope)?;
            let mut node = parent.borrow_mut();
            let index = node.internal_find_child(child_max);
            // Reserve the slot up front; the key written there is replaced
            // before the borrow ends.
            node.set_internal_num_keys(num_keys + 1);

            if child_max > right_child_max {
                // The new child outranks the right child, which is demoted
                // into the last cell.
                node.set_internal_child(num_keys, right_child_page_num);
                node.set_internal_key(num_keys, right_child_max);
                node.set_internal_right_child(child_page_num);
            } else {
                node.internal_shift_right(index);
                node.set_internal_child(index, child_page_num);
                node.set_internal_key(index, child_max);
            }
            Ok(())
        })
    }

    /// Split a full internal node while adding `child_page`. The upper keys
    /// migrate into a new sibling, the key below the middle is promoted, and
    /// the incoming child lands on whichever side now covers it.
    fn internal_split_and_insert(&mut self, parent_page_num: u32, child_page_num: u32) -> DbResult<()> {
        debug!(parent_page_num, child_page_num, "splitting internal node");
        let mut old_page_num = parent_page_num;
        let old_max = self.max_key(old_page_num)?;
        let child_max = self.max_key(child_page_num)?;
        let new_page_num = self.pager.allocate_page();
        let root_page_num = self.root_page_num;

        self.with_scope(|table, scope| {
            let splitting_root = {
                let old = table.pager.get(old_page_num, scope)?;
                let is_root = old.borrow().is_root();
                is_root
            };
            if splitting_root {
                table.create_new_root(new_page_num)?;
                // The descent target becomes the new root's left child; the
                // new page is already wired in as its right child.
                old_page_num = {
                    let root = table.pager.get(root_page_num, scope)?;
                    let left = root.borrow().internal_child(0);
                    left
                };
            } else {
                let new_page = table.pager.get(new_page_num, scope)?;
                new_page.borrow_mut().init_internal();
            }

            // The old right child moves over first.
            let old_right = {
                let old = table.pager.get(old_page_num, scope)?;
                let right = old.borrow().internal_right_child();
                right
            };
            table.internal_insert(new_page_num, old_right)?;
            table.set_parent_of(old_right, new_page_num)?;
            {
                let old = table.pager.get(old_page_num, scope)?;
                old.borrow_mut().set_internal_right_child(INVALID_PAGE_NUM);
            }

            // Keys above the middle follow it into the new node.
            for i in (INTERNAL_NODE_MAX_KEYS / 2 + 1..INTERNAL_NODE_MAX_KEYS).rev() {
                let moved = {
                    let old = table.pager.get(old_page_num, scope)?;
                    let child = old.borrow().internal_child(i);
                    child
                };
                table.internal_insert(new_page_num, moved)?;
                table.set_parent_of(moved, new_page_num)?;
                {
                    let old = table.pager.get(old_page_num, scope)?;
                    let mut node = old.borrow_mut();
                    let keys = node.internal_num_keys();
                    node.set_internal_num_keys(keys - 1);
                }
            }

            // The child just below the middle becomes the old node's right
            // child.
            {
                let old = table.pager.get(old_page_num, scope)?;
                let mut node = old.borrow_mut();
                let keys = node.internal_num_keys();
                let promoted = node.internal_child(keys - 1);
                node.set_internal_right_child(promoted);
                node.set_internal_num_keys(keys - 1);
            }

            // Place the incoming child on whichever side now covers its key.
            let max_after_split = table.max_key(old_page_num)?;
            let destination = if child_max < max_after_split {
                old_page_num
            } else {
                new_page_num
            };
            table.internal_insert(destination, child_page_num)?;
            table.set_parent_of(child_page_num, destination)?;

            // The old node shrank; its routing key above must follow.
            let parent_num = if splitting_root {
                root_page_num
            } else {
                let old = table.pager.get(old_page_num, scope)?;
                let parent = old.borrow().parent();
                parent
            };
            let new_old_max = table.max_key(old_page_num)?;
            {
                let parent = table.pager.get(parent_num, scope)?;
                parent.borrow_mut().update_internal_key(old_max, new_old_max);
            }
            if !splitting_root {
                table.internal_insert(parent_num, new_page_num)?;
                table.set_parent_of(new_page_num, parent_num)?;
            }
            Ok(())
        })
    }

    // Deletion.

    fn leaf_delete(&mut self, cursor: Cursor) -> DbResult<()> {
        self.with_scope(|table, scope| {
            let page = table.pager.get(cursor.page_num, scope)?;
            let (num_cells, is_root) = {
                let node = page.borrow();
                (node.leaf_num_cells(), node.is_root())
            };

            if cursor.cell_num + 1 < num_cells {
                // Interior cell: close the gap.
                page.borrow_mut().leaf_shift_left(cursor.cell_num);
            } else if cursor.cell_num + 1 == num_cells && !is_root && num_cells >= 2 {
                // The leaf's max shrinks; the ancestor that routed on it
                // must follow before the cell disappears.
                let (old_max, new_max) = {
                    let node = page.borrow();
                    (node.leaf_key(cursor.cell_num), node.leaf_key(cursor.cell_num - 1))
                };
                table.update_ancestor_keys(cursor.page_num, old_max, new_max)?;
            }

            let remaining = {
                let mut node = page.borrow_mut();
                let cells = node.leaf_num_cells() - 1;
                node.set_leaf_num_cells(cells);
                cells
            };

            if remaining < LEAF_NODE_MIN_CELLS && !is_root {
                table.leaf_merge(cursor)?;
            }
            Ok(())
        })
    }

    /// Refill or retire an underfull leaf using the nearest sibling.
    fn leaf_merge(&mut self, cursor: Cursor) -> DbResult<()> {
        debug!(page_num = cursor.page_num, "rebalancing underfull leaf");
        self.with_scope(|table, scope| {
            let node_page_num = cursor.page_num;
            let node_max = table.max_key(node_page_num)?;
            let parent_page_num = {
                let page = table.pager.get(node_page_num, scope)?;
                let parent = page.borrow().parent();
                parent
            };
            let (index, parent_num_keys, parent_is_root) = {
                let parent = table.pager.get(parent_page_num, scope)?;
                let node = parent.borrow();
                (
                    node.internal_find_child(node_max),
                    node.internal_num_keys(),
                    node.is_root(),
                )
            };
            // The rightmost child leans on its left neighbour; everyone else
            // leans right.
            let sibling_index = if index == parent_num_keys {
                index - 1
            } else {
                index + 1
            };
            let sibling_page_num = {
                let parent = table.pager.get(parent_page_num, scope)?;
                let sibling = parent.borrow().internal_child(sibling_index);
                sibling
            };
            let sibling_cells = {
                let sibling = table.pager.get(sibling_page_num, scope)?;
                let cells = sibling.borrow().leaf_num_cells();
                cells
            };

            if sibling_cells > LEAF_NODE_MIN_CELLS {
                // Borrow the boundary cell from the richer sibling.
                let sibling_cell_num = if sibling_index + 1 == index {
                    sibling_cells - 1
                } else {
                    0
                };
                let (key, row) = {
                    let sibling = table.pager.get(sibling_page_num, scope)?;
                    let node = sibling.borrow();
                    (
                        node.leaf_key(sibling_cell_num),
                        Row::deserialize(node.leaf_value(sibling_cell_num)),
                    )
                };
                let dest_cell = {
                    let page = table.pager.get(node_page_num, scope)?;
                    let cell = page.borrow().leaf_find(key);
                    cell
                };
                table.leaf_insert(
                    Cursor {
                        page_num: node_page_num,
                        cell_num: dest_cell,
                        end_of_table: false,
                    },
                    key,
                    &row,
                )?;
                let new_max = table.max_key(node_page_num)?;
                table.update_ancestor_keys(node_page_num, node_max, new_max)?;

                let sibling_cell = {
                    let sibling = table.pager.get(sibling_page_num, scope)?;
                    let cell = sibling.borrow().leaf_find(key);
                    cell
                };
                table.leaf_delete(Cursor {
                    page_num: sibling_page_num,
                    cell_num: sibling_cell,
                    end_of_table: false,
                })?;
            } else {
                // The sibling sits at the minimum: fold this leaf into it.
                let old_sibling_max = table.max_key(sibling_page_num)?;
                let node_cells = {
                    let page = table.pager.get(node_page_num, scope)?;
                    let cells = page.borrow().leaf_num_cells();
                    cells
                };
                for i in 0..node_cells {
                    let (key, row) = {
                        let page = table.pager.get(node_page_num, scope)?;
                        let node = page.borrow();
                        (node.leaf_key(i), Row::deserialize(node.leaf_value(i)))
                    };
                    let dest_cell = {
                        let sibling = table.pager.get(sibling_page_num, scope)?;
                        let cell = sibling.borrow().leaf_find(key);
                        cell
                    };
                    table.leaf_insert(
                        Cursor {
                            page_num: sibling_page_num,
                            cell_num: dest_cell,
                            end_of_table: false,
                        },
                        key,
                        &row,
                    )?;
                }

                if parent_num_keys == 1 && parent_is_root {
                    // Two leaves under the root fold back into a single
                    // root leaf on page 0.
                    {
                        let parent = table.pager.get(parent_page_num, scope)?;
                        let sibling = table.pager.get(sibling_page_num, scope)?;
                        let mut root = parent.borrow_mut();
                        let merged = sibling.borrow();
                        root.data.copy_from_slice(&merged.data);
                        root.set_root(true);
                        root.set_leaf_next(0);
                    }
                    table.pager.free_page(sibling_page_num);
                    table.pager.free_page(node_page_num);
                } else {
                    let new_sibling_max = table.max_key(sibling_page_num)?;
                    table.update_ancestor_keys(
                        sibling_page_num,
                        old_sibling_max,
                        new_sibling_max,
                    )?;
                    if index == parent_num_keys {
                        // The left sibling absorbed the rightmost leaf and
                        // inherits its successor.
                        let next = {
                            let page = table.pager.get(node_page_num, scope)?;
                            let next = page.borrow().leaf_next();
                            next
                        };
                        let sibling = table.pager.get(sibling_page_num, scope)?;
                        sibling.borrow_mut().set_leaf_next(next);
                    } else {
                        table.repoint_predecessor_leaf(node_page_num, sibling_page_num)?;
                    }
                    table.internal_delete(parent_page_num, node_page_num, index)?;
                }
            }
            Ok(())
        })
    }

    /// Walk the leaf chain from the first leaf and repoint the predecessor
    /// of `node_page` at `replacement`. Each step pins only the leaf it is
    /// standing on, so arbitrarily long chains stay within the pool.
    fn repoint_predecessor_leaf(&mut self, node_page: u32, replacement: u32) -> DbResult<()> {
        let mut current = self.find(0)?.page_num;
        if current == node_page {
            return Ok(());
        }
        loop {
            let mut step = PinScope::default();
            let result = (|| -> DbResult<Option<u32>> {
                let page = self.pager.get(current, &mut step)?;
                let next = page.borrow().leaf_next();
                if next == node_page {
                    page.borrow_mut().set_leaf_next(replacement);
                    return Ok(None);
                }
                Ok(Some(next))
            })();
            self.pager.unpin_all(step);
            match result? {
                None | Some(0) => return Ok(()),
                Some(next) => current = next,
            }
        }
    }

    /// Remove the child at `index` from `parent_page` and reclaim its page.
    fn internal_delete(&mut self, parent_page_num: u32, child_page_num: u32, index: u32) -> DbResult<()> {
        self.with_scope(|table, scope| {
            let num_keys = {
                let parent = table.pager.get(parent_page_num, scope)?;
                let keys = parent.borrow().internal_num_keys();
                keys
            };
            if index == num_keys {
                // The right child goes away; its left neighbour takes over
                // and the subtree max shrinks with it.
                let old_max = table.max_key(child_page_num)?;
                let promoted = {
                    let parent = table.pager.get(parent_page_num, scope)?;
                    let promoted = parent.borrow().internal_child(num_keys - 1);
                    promoted
                };
                {
                    let parent = table.pager.get(parent_page_num, scope)?;
                    parent.borrow_mut().set_internal_right_child(promoted);
                }
                let new_max = table.max_key(promoted)?;
                table.update_ancestor_keys(parent_page_num, old_max, new_max)?;
            } else {
                let parent = table.pager.get(parent_page_num, scope)?;
                parent.borrow_mut().internal_shift_left(index);
            }

            let (remaining, parent_is_root) = {
                let parent = table.pager.get(parent_page_num, scope)?;
                let mut node = parent.borrow_mut();
                let keys = node.internal_num_keys() - 1;
                node.set_internal_num_keys(keys);
                (keys, node.is_root())
            };
            table.pager.free_page(child_page_num);

            if remaining < 1 && !parent_is_root {
                table.internal_merge(parent_page_num)?;
            }
            Ok(())
        })
    }

    /// Refill or retire an internal node left without keys. Mirrors
    /// `leaf_merge` one level up: borrow a child from a richer sibling, or
    /// fold our sole child into it and vanish.
    fn internal_merge(&mut self, page_num: u32) -> DbResult<()> {
        debug!(page_num, "rebalancing underfull internal node");
        self.with_scope(|table, scope| {
            let node_max = table.max_key(page_num)?;
            let (parent_page_num, child_page_num) = {
                let page = table.pager.get(page_num, scope)?;
                let node = page.borrow();
                (node.parent(), node.internal_right_child())
            };
            let (index, parent_num_keys, parent_is_root) = {
                let parent = table.pager.get(parent_page_num, scope)?;
                let node = parent.borrow();
                (
                    node.internal_find_child(node_max),
                    node.internal_num_keys(),
                    node.is_root(),
                )
            };
            let sibling_index = if index == parent_num_keys {
                index - 1
            } else {
                index + 1
            };
            let sibling_page_num = {
                let parent = table.pager.get(parent_page_num, scope)?;
                let sibling = parent.borrow().internal_child(sibling_index);
                sibling
            };
            let sibling_keys = {
                let sibling = table.pager.get(sibling_page_num, scope)?;
                let keys = sibling.borrow().internal_num_keys();
                keys
            };

            if sibling_keys > 1 {
                // Borrow the boundary child from the richer sibling: its
                // right child when the sibling is on our left, its first
                // cell child when it is on our right.
                let sibling_cell_num = if sibling_index + 1 == index {
                    sibling_keys
                } else {
                    0
                };
                let source_page_num = {
                    let sibling = table.pager.get(sibling_page_num, scope)?;
                    let source = sibling.borrow().internal_child(sibling_cell_num);
                    source
                };
                table.set_parent_of(source_page_num, page_num)?;
                if sibling_index == index + 1 {
                    // The child arrives from the right and outranks ours,
                    // which drops into cell 0.
                    let old_max = table.max_key(child_page_num)?;
                    {
                        let page = table.pager.get(page_num, scope)?;
                        let mut node = page.borrow_mut();
                        node.set_internal_num_keys(1);
                        node.set_internal_child(0, child_page_num);
                        node.set_internal_key(0, old_max);
                        node.set_internal_right_child(source_page_num);
                    }
                    let new_max = table.max_key(source_page_num)?;
                    table.update_ancestor_keys(page_num, old_max, new_max)?;
                } else {
                    // The child arrives from the left and slots in under
                    // ours.
                    let source_max = table.max_key(source_page_num)?;
                    let page = table.pager.get(page_num, scope)?;
                    let mut node = page.borrow_mut();
                    node.set_internal_num_keys(1);
                    node.set_internal_child(0, source_page_num);
                    node.set_internal_key(0, source_max);
                }
                table.internal_delete(sibling_page_num, source_page_num, sibling_cell_num)?;
                // The transferred child is still live; take it back off the
                // free stack.
                let reclaimed = table.pager.pop_free();
                debug_assert_eq!(reclaimed, Some(source_page_num));
            } else if parent_num_keys == 1 && parent_is_root {
                // One key on each side under the root: the sibling absorbs
                // our sole child and then moves onto the root page.
                table.internal_insert(sibling_page_num, child_page_num)?;
                let children: Vec<u32> = {
                    let sibling = table.pager.get(sibling_page_num, scope)?;
                    let node = sibling.borrow();
                    (0..=node.internal_num_keys())
                        .map(|i| node.internal_child(i))
                        .collect()
                };
                for child in children {
                    table.set_parent_of(child, parent_page_num)?;
                }
                {
                    let parent = table.pager.get(parent_page_num, scope)?;
                    let sibling = table.pager.get(sibling_page_num, scope)?;
                    let mut root = parent.borrow_mut();
                    let merged = sibling.borrow();
                    root.data.copy_from_slice(&merged.data);
                    root.set_root(true);
                }
                table.pager.free_page(sibling_page_num);
                table.pager.free_page(page_num);
            } else {
                // Absorb our sole child into the sibling and remove
                // ourselves from the parent.
                table.internal_insert(sibling_page_num, child_page_num)?;
                table.set_parent_of(child_page_num, sibling_page_num)?;
                table.internal_delete(parent_page_num, page_num, index)?;
            }
            Ok(())
        })
    }

    // Diagnostics.

    /// Recursive tree dump for the `.btree` meta command.
    pub fn tree_dump(&mut self) -> DbResult<String> {
        let mut out = String::new();
        self.dump_node(self.root_page_num, 0, &mut out)?;
        Ok(out)
    }

    fn dump_node(&mut self, page_num: u32, depth: usize, out: &mut String) -> DbResult<()> {
        enum Dump {
            Leaf(Vec<u32>),
            Internal { keys: Vec<u32>, children: Vec<u32> },
        }
        let dump = self.with_scope(|table, scope| {
            let page = table.pager.get(page_num, scope)?;
            let node = page.borrow();
            Ok(match node.node_type() {
                NodeType::Leaf => {
                    Dump::Leaf((0..node.leaf_num_cells()).map(|i| node.leaf_key(i)).collect())
                }
                NodeType::Internal => {
                    let num_keys = node.internal_num_keys();
                    Dump::Internal {
                        keys: (0..num_keys).map(|i| node.internal_key(i)).collect(),
                        children: if num_keys == 0 {
                            Vec::new()
                        } else {
                            (0..=num_keys).map(|i| node.internal_child(i)).collect()
                        },
                    }
                }
            })
        })?;

        let pad = "  ".repeat(depth);
        match dump {
            Dump::Leaf(keys) => {
                out.push_str(&format!("{pad}- leaf (size {})\n", keys.len()));
                for key in keys {
                    out.push_str(&format!("{pad}  - {key}\n"));
                }
            }
            Dump::Internal { keys, children } => {
                out.push_str(&format!("{pad}- internal (size {})\n", keys.len()));
                for (i, key) in keys.iter().enumerate() {
                    self.dump_node(children[i], depth + 1, out)?;
                    out.push_str(&format!("{pad}  - key {key}\n"));
                }
                if let Some(right) = children.last() {
                    self.dump_node(*right, depth + 1, out)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn open_table() -> (TempDir, Table) {
        let dir = TempDir::new().unwrap();
        let table = Table::open(&dir.path().join("test.db")).unwrap();
        (dir, table)
    }

    fn sample_row(id: u32) -> Row {
        Row::new(id, &format!("user{id}"), &format!("user{id}@example.com")).unwrap()
    }

    fn insert_ids(table: &mut Table, ids: impl IntoIterator<Item = u32>) {
        for id in ids {
            table.insert(&sample_row(id)).unwrap();
        }
    }

    fn scan_ids(table: &mut Table) -> Vec<u32> {
        table.select().unwrap().iter().map(|row| row.id).collect()
    }

    enum Snapshot {
        Leaf {
            parent: u32,
            is_root: bool,
            keys: Vec<u32>,
            next: u32,
        },
        Internal {
            parent: u32,
            is_root: bool,
            keys: Vec<u32>,
            children: Vec<u32>,
        },
    }

    fn snapshot(table: &mut Table, page_num: u32) -> Snapshot {
        table
            .with_scope(|table, scope| {
                let page = table.pager.get(page_num, scope)?;
                let node = page.borrow();
                Ok(match node.node_type() {
                    NodeType::Leaf => Snapshot::Leaf {
                        parent: node.parent(),
                        is_root: node.is_root(),
                        keys: (0..node.leaf_num_cells()).map(|i| node.leaf_key(i)).collect(),
                        next: node.leaf_next(),
                    },
                    NodeType::Internal => {
                        let num_keys = node.internal_num_keys();
                        Snapshot::Internal {
                            parent: node.parent(),
                            is_root: node.is_root(),
                            keys: (0..num_keys).map(|i| node.internal_key(i)).collect(),
                            children: (0..=num_keys).map(|i| node.internal_child(i)).collect(),
                        }
                    }
                })
            })
            .unwrap()
    }

    /// Returns the subtree's max key while checking key order, parent
    /// pointers, fill minimums, and collecting leaves in tree order.
    fn check_subtree(
        table: &mut Table,
        page_num: u32,
        expected_parent: Option<u32>,
        leaves: &mut Vec<u32>,
    ) -> u32 {
        match snapshot(table, page_num) {
            Snapshot::Leaf {
                parent,
                is_root,
                keys,
                ..
            } => {
                match expected_parent {
                    Some(expected) => {
                        assert!(!is_root, "leaf {page_num} wrongly marked root");
                        assert_eq!(parent, expected, "leaf {page_num} parent pointer");
                        assert!(
                            keys.len() as u32 >= LEAF_NODE_MIN_CELLS,
                            "leaf {page_num} underfull"
                        );
                    }
                    None => assert!(is_root),
                }
                assert!(
                    keys.windows(2).all(|pair| pair[0] < pair[1]),
                    "leaf {page_num} keys out of order"
                );
                leaves.push(page_num);
                *keys.last().expect("checked leaves are never empty")
            }
            Snapshot::Internal {
                parent,
                is_root,
                keys,
                children,
            } => {
                match expected_parent {
                    Some(expected) => {
                        assert!(!is_root);
                        assert_eq!(parent, expected, "internal {page_num} parent pointer");
                        assert!(!keys.is_empty(), "internal {page_num} underfull");
                    }
                    None => assert!(is_root),
                }
                assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
                let mut previous_max = None;
                for (i, key) in keys.iter().enumerate() {
                    let child_max = check_subtree(table, children[i], Some(page_num), leaves);
                    assert_eq!(
                        child_max, *key,
                        "internal {page_num} cell {i} key does not match child max"
                    );
                    if let Some(previous) = previous_max {
                        assert!(previous < child_max);
                    }
                    previous_max = Some(child_max);
                }
                let right_max =
                    check_subtree(table, *children.last().unwrap(), Some(page_num), leaves);
                if let Some(previous) = previous_max {
                    assert!(previous < right_max);
                }
                right_max
            }
        }
    }

    /// Full structural audit: ordering, parent pointers, and the leaf chain
    /// visiting every leaf exactly once in tree order.
    fn check_tree(table: &mut Table) {
        if let Snapshot::Leaf { keys, next, .. } = snapshot(table, 0) {
            assert_eq!(next, 0);
            assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
            return;
        }
        let mut leaves = Vec::new();
        check_subtree(table, 0, None, &mut leaves);

        let mut chained = Vec::new();
        let mut current = leaves[0];
        loop {
            chained.push(current);
            match snapshot(table, current) {
                Snapshot::Leaf { next: 0, .. } => break,
                Snapshot::Leaf { next, .. } => current = next,
                _ => panic!("leaf chain reached a non-leaf page"),
            }
        }
        assert_eq!(chained, leaves, "leaf chain disagrees with tree order");
    }

    struct XorShift(u32);

    impl XorShift {
        fn next(&mut self) -> u32 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            self.0 = x;
            x
        }
    }

    fn shuffle(items: &mut [u32], rng: &mut XorShift) {
        for i in (1..items.len()).rev() {
            let j = rng.next() as usize % (i + 1);
            items.swap(i, j);
        }
    }

    #[test]
    fn three_rows_fit_one_leaf() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, [1, 2, 3]);
        assert_eq!(
            table.tree_dump().unwrap(),
            "- leaf (size 3)\n  - 1\n  - 2\n  - 3\n"
        );
        assert_eq!(scan_ids(&mut table), vec![1, 2, 3]);
    }

    #[test]
    fn fourteenth_insert_splits_the_root_leaf() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, 1..=14);
        let dump = table.tree_dump().unwrap();
        let mut expected = String::from("- internal (size 1)\n  - leaf (size 7)\n");
        for key in 1..=7 {
            expected.push_str(&format!("    - {key}\n"));
        }
        expected.push_str("  - key 7\n  - leaf (size 7)\n");
        for key in 8..=14 {
            expected.push_str(&format!("    - {key}\n"));
        }
        assert_eq!(dump, expected);
        assert_eq!(scan_ids(&mut table), (1..=14).collect::<Vec<_>>());
        check_tree(&mut table);
    }

    #[test]
    fn fifteen_rows_make_leaves_of_seven_and_eight() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, 1..=15);
        let dump = table.tree_dump().unwrap();
        assert!(dump.starts_with("- internal (size 1)\n"));
        assert!(dump.contains("- leaf (size 7)\n"));
        assert!(dump.contains("- leaf (size 8)\n"));
        assert_eq!(scan_ids(&mut table), (1..=15).collect::<Vec<_>>());
        check_tree(&mut table);
    }

    #[test]
    fn descending_inserts_scan_in_order() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, (1..=15).rev());
        assert_eq!(scan_ids(&mut table), (1..=15).collect::<Vec<_>>());
        check_tree(&mut table);
    }

    #[test]
    fn duplicate_key_is_rejected_without_damage() {
        let (_dir, mut table) = open_table();
        table.insert(&sample_row(5)).unwrap();
        let imposter = Row::new(5, "mallory", "mallory@example.com").unwrap();
        assert!(matches!(
            table.insert(&imposter),
            Err(DbError::DuplicateKey(5))
        ));
        let rows = table.select().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].username(), "user5");
        assert_eq!(rows[0].email(), "user5@example.com");
    }

    #[test]
    fn deleting_a_missing_key_reports_not_found() {
        let (_dir, mut table) = open_table();
        assert!(matches!(table.delete(9), Err(DbError::KeyNotFound(9))));
        insert_ids(&mut table, [1, 2, 3]);
        assert!(matches!(table.delete(9), Err(DbError::KeyNotFound(9))));
        assert_eq!(scan_ids(&mut table), vec![1, 2, 3]);
    }

    #[test]
    fn rows_round_trip_byte_for_byte() {
        let (_dir, mut table) = open_table();
        let row = Row::new(77, "x".repeat(32).as_str(), "y".repeat(255).as_str()).unwrap();
        table.insert(&row).unwrap();
        let rows = table.select().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], row);
    }

    #[test]
    fn delete_range_from_thirty_rows() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, 1..=30);
        for id in 8..=22 {
            table.delete(id).unwrap();
        }
        let expected: Vec<u32> = (1..=7).chain(23..=30).collect();
        assert_eq!(scan_ids(&mut table), expected);
        assert!(table.pager.freed_count() > 0, "no pages were reclaimed");
        check_tree(&mut table);
    }

    #[test]
    fn tree_collapses_to_a_root_leaf_and_reuses_pages() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, 1..=14);
        table.delete(14).unwrap();
        assert!(table.tree_dump().unwrap().starts_with("- leaf (size 13)\n"));
        assert_eq!(table.pager.freed_count(), 2);
        assert_eq!(scan_ids(&mut table), (1..=13).collect::<Vec<_>>());

        // The next split must consume both reclaimed pages before the file
        // grows again.
        let pages_before = table.pager.num_pages();
        insert_ids(&mut table, [14, 15]);
        assert_eq!(table.pager.freed_count(), 0);
        assert_eq!(table.pager.num_pages(), pages_before);
        assert_eq!(scan_ids(&mut table), (1..=15).collect::<Vec<_>>());
        check_tree(&mut table);
    }

    #[test]
    fn deleting_the_rightmost_keys_across_levels_keeps_routing_sound() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, 1..=50);
        check_tree(&mut table);
        for id in (30..=50).rev() {
            table.delete(id).unwrap();
            assert_eq!(scan_ids(&mut table), (1..id).collect::<Vec<_>>());
            check_tree(&mut table);
        }
    }

    #[test]
    fn randomized_inserts_and_deletes_keep_set_semantics() {
        let (_dir, mut table) = open_table();
        let mut rng = XorShift(0x9E37_79B9);
        let mut ids: Vec<u32> = (1..=80).collect();
        shuffle(&mut ids, &mut rng);

        let mut model = BTreeSet::new();
        for id in &ids {
            table.insert(&sample_row(*id)).unwrap();
            model.insert(*id);
        }
        check_tree(&mut table);

        let mut doomed = ids.clone();
        shuffle(&mut doomed, &mut rng);
        for id in doomed.iter().take(50) {
            table.delete(*id).unwrap();
            model.remove(id);
        }
        check_tree(&mut table);
        assert_eq!(
            scan_ids(&mut table),
            model.iter().copied().collect::<Vec<_>>()
        );
    }

    #[test]
    fn emptying_the_table_leaves_an_empty_root_leaf() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, 1..=20);
        for id in 1..=20 {
            table.delete(id).unwrap();
        }
        assert_eq!(scan_ids(&mut table), Vec::<u32>::new());
        assert!(table.pager.freed_count() > 0);
        let cursor = table.start().unwrap();
        assert!(cursor.end_of_table);

        // The freed pages feed later growth.
        insert_ids(&mut table, 1..=20);
        assert_eq!(scan_ids(&mut table), (1..=20).collect::<Vec<_>>());
        check_tree(&mut table);
    }

    #[test]
    fn height_stays_logarithmic() {
        let (_dir, mut table) = open_table();
        insert_ids(&mut table, 1..=100);
        let mut height = 1;
        let mut current = 0;
        loop {
            match snapshot(&mut table, current) {
                Snapshot::Internal { children, .. } => {
                    height += 1;
                    current = children[0];
                }
                Snapshot::Leaf { .. } => break,
            }
        }
        // ceil(log2(100)) = 7, with a small constant of slack.
        assert!(height <= 10, "tree height {height} exceeds the bound");
        assert_eq!(scan_ids(&mut table), (1..=100).collect::<Vec<_>>());
        check_tree(&mut table);
    }

    #[test]
    fn a_tiny_buffer_pool_still_supports_big_trees() {
        let dir = TempDir::new().unwrap();
        let mut table = Table::open_with_capacity(&dir.path().join("test.db"), 8).unwrap();
        insert_ids(&mut table, 1..=60);
        assert_eq!(scan_ids(&mut table), (1..=60).collect::<Vec<_>>());
        for id in 20..=40 {
            table.delete(id).unwrap();
        }
        let expected: Vec<u32> = (1..=19).chain(41..=60).collect();
        assert_eq!(scan_ids(&mut table), expected);
        check_tree(&mut table);
    }
}
