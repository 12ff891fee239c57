//! Statement parsing and input validation.
//!
//! The command surface is three literal statements. Anything malformed is
//! rejected here, before the storage layer sees it.

use crate::errors::{DbError, DbResult};
use crate::storage::row::Row;
use once_cell::sync::Lazy;
use regex::Regex;

static INSERT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^insert\s+(-?\d+)\s+(\S+)\s+(\S+)$").unwrap());
static DELETE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^delete\s+(-?\d+)$").unwrap());

#[derive(Debug)]
pub enum Statement {
    Insert(Row),
    Select,
    Delete(u32),
}

pub fn parse(input: &str) -> DbResult<Statement> {
    let input = input.trim();
    if input == "select" {
        return Ok(Statement::Select);
    }
    if input.starts_with("insert") {
        let captures = INSERT_RE
            .captures(input)
            .ok_or_else(|| DbError::Syntax("could not parse insert".into()))?;
        let id = parse_id(&captures[1])?;
        let row = Row::new(id, &captures[2], &captures[3])?;
        return Ok(Statement::Insert(row));
    }
    if input.starts_with("delete") {
        let captures = DELETE_RE
            .captures(input)
            .ok_or_else(|| DbError::Syntax("could not parse delete".into()))?;
        return Ok(Statement::Delete(parse_id(&captures[1])?));
    }
    Err(DbError::Unrecognized(input.to_string()))
}

/// Ids are signed on input, unsigned in storage: [0, 2^31).
fn parse_id(text: &str) -> DbResult<u32> {
    if text.starts_with('-') {
        return Err(DbError::NegativeId);
    }
    let id: i64 = text
        .parse()
        .map_err(|_| DbError::Syntax(format!("invalid id '{text}'")))?;
    if id > i32::MAX as i64 {
        return Err(DbError::Syntax(format!("id {id} out of range")));
    }
    Ok(id as u32)
}
