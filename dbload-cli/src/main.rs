//! The `dbload` binary.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

use anyhow::Result;

fn main() -> Result<()> {
    dbload_cli::cli::execute()
}
