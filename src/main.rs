use clap::Parser;
use microdb::{errors::DbError, repl};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "microdb",
    version = VERSION,
    about = "Tiny embedded single-table database."
)]
struct Cli {
    /// Path to the database file, created on first use.
    file: PathBuf,
    /// Where to write the trace log.
    #[arg(long, env = "MICRODB_LOG", default_value = "microdb.log")]
    log: PathBuf,
}

fn main() {
    let cli = Cli::parse();

    let log_file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&cli.log)
        .expect("Failed to open log file");
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(error) = repl::start(&cli.file) {
        match error {
            DbError::Io(e) => eprintln!("Fatal I/O error: {e}"),
            other => eprintln!("Fatal error: {other}"),
        }
        process::exit(1);
    }
}
