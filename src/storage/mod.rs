//! Storage engine: pager, node layout, and the B+-tree table.

pub mod cursor;
pub mod node;
pub mod pager;
pub mod row;
pub mod table;

pub use cursor::Cursor;
pub use pager::{Pager, PinScope};
pub use row::Row;
pub use table::Table;
