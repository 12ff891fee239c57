//! Line-based REPL driving the table.
//!
//! Recoverable errors are printed and the loop continues; fatal errors
//! propagate out so the process can exit non-zero. EOF on stdin closes the
//! database the same way `.exit` does.

use crate::errors::{DbError, DbResult};
use crate::sql::{self, Statement};
use crate::storage::node::layout_report;
use crate::storage::table::Table;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing::info;

pub fn start(path: &Path) -> DbResult<()> {
    let mut table = Table::open(path)?;
    info!(path = %path.display(), "database ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        print!("db > ");
        stdout.flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('.') {
            match input {
                ".exit" => break,
                ".btree" => {
                    println!("Tree:");
                    print!("{}", table.tree_dump()?);
                }
                ".constants" => {
                    println!("Constants:");
                    print!("{}", layout_report());
                }
                _ => println!("Unrecognized command: '{input}'"),
            }
            continue;
        }

        match sql::parse(input) {
            Ok(statement) => execute(&mut table, statement)?,
            Err(DbError::NegativeId) => println!("ID must be positive."),
            Err(DbError::StringTooLong) => println!("String is too long."),
            Err(DbError::Syntax(_)) => println!("Syntax error. Could not parse statement."),
            Err(DbError::Unrecognized(_)) => {
                println!("Unrecognized keyword at start of '{input}'.")
            }
            Err(fatal) => return Err(fatal),
        }
    }

    table.close()
}

fn execute(table: &mut Table, statement: Statement) -> DbResult<()> {
    match statement {
        Statement::Insert(row) => match table.insert(&row) {
            Ok(()) => println!("Executed."),
            Err(DbError::DuplicateKey(_)) => println!("Error: Duplicate key."),
            Err(fatal) => return Err(fatal),
        },
        Statement::Select => {
            for row in table.select()? {
                println!("{row}");
            }
            println!("Executed.");
        }
        Statement::Delete(id) => match table.delete(id) {
            Ok(()) => println!("Executed."),
            Err(DbError::KeyNotFound(_)) => println!("Error: Key not found."),
            Err(fatal) => return Err(fatal),
        },
    }
    Ok(())
}
