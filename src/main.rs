mod analysis;
mod archive_tool;
mod classifier;
mod cli;
mod command;
mod config;
mod content_tree;
mod error;
mod executor;
mod logging;
mod merge_tool;
mod processor;
mod prompt;
mod reference;
mod report;
mod session;
#[cfg(test)]
mod testing;

use anyhow::Result;
use std::process::ExitCode;

fn main() -> Result<ExitCode> {
    cli::run()
}
