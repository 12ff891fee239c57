//! Cursors: logical positions inside the table.
//!
//! A cursor names a leaf page and a cell index within it. It carries no
//! borrow of the tree; operations that move or read through a cursor re-pin
//! the leaf for exactly as long as they touch it.

use crate::errors::DbResult;
use crate::storage::node::NodeType;
use crate::storage::row::Row;
use crate::storage::table::Table;

/// A position at a specific (leaf page, cell index), possibly one past the
/// last element.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    pub page_num: u32,
    pub cell_num: u32,
    pub end_of_table: bool,
}

impl Table {
    /// Position of `key`, or of the slot where it would be inserted.
    pub fn find(&mut self, key: u32) -> DbResult<Cursor> {
        let root = self.root_page_num;
        self.with_scope(|table, scope| {
            let mut page_num = root;
            loop {
                let page = table.pager.get(page_num, scope)?;
                let node = page.borrow();
                match node.node_type() {
                    NodeType::Leaf => {
                        return Ok(Cursor {
                            page_num,
                            cell_num: node.leaf_find(key),
                            end_of_table: false,
                        });
                    }
                    NodeType::Internal => {
                        let child_index = node.internal_find_child(key);
                        let child = node.internal_child(child_index);
                        drop(node);
                        page_num = child;
                    }
                }
            }
        })
    }

    /// Cursor at the first row; `end_of_table` when the table is empty.
    pub fn start(&mut self) -> DbResult<Cursor> {
        let mut cursor = self.find(0)?;
        let num_cells = self.with_scope(|table, scope| {
            let page = table.pager.get(cursor.page_num, scope)?;
            let n = page.borrow().leaf_num_cells();
            Ok(n)
        })?;
        cursor.end_of_table = num_cells == 0;
        Ok(cursor)
    }

    /// Step to the next cell, following the leaf chain across pages.
    pub fn advance(&mut self, cursor: &mut Cursor) -> DbResult<()> {
        self.with_scope(|table, scope| {
            let page = table.pager.get(cursor.page_num, scope)?;
            let node = page.borrow();
            cursor.cell_num += 1;
            if cursor.cell_num >= node.leaf_num_cells() {
                match node.leaf_next() {
                    0 => cursor.end_of_table = true, // rightmost leaf
                    next => {
                        cursor.page_num = next;
                        cursor.cell_num = 0;
                    }
                }
            }
            Ok(())
        })
    }

    /// Deserialize the row under the cursor.
    pub fn row_at(&mut self, cursor: &Cursor) -> DbResult<Row> {
        self.with_scope(|table, scope| {
            let page = table.pager.get(cursor.page_num, scope)?;
            let node = page.borrow();
            Ok(Row::deserialize(node.leaf_value(cursor.cell_num)))
        })
    }
}
