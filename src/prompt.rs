use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};
use tracing::warn;

/// Asks where the merged archive should go. `None` means the user backed out.
pub trait DestinationPrompt {
    fn choose_destination(&mut self, suggested_name: &str) -> Option<PathBuf>;
}

/// Destination given up front (`--dest`); never asks.
#[derive(Debug, Clone)]
pub struct FixedDestination(pub PathBuf);

impl DestinationPrompt for FixedDestination {
    fn choose_destination(&mut self, _suggested_name: &str) -> Option<PathBuf> {
        Some(self.0.clone())
    }
}

/// Line-based prompt. An empty line or end of input cancels; a path that
/// is not an existing directory asks again.
pub struct LinePrompt<R, W> {
    input: R,
    output: W,
}

impl LinePrompt<io::StdinLock<'static>, io::Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> DestinationPrompt for LinePrompt<R, W> {
    fn choose_destination(&mut self, suggested_name: &str) -> Option<PathBuf> {
        loop {
            let _ = write!(
                self.output,
                "Destination directory for {suggested_name} (empty to cancel): "
            );
            let _ = self.output.flush();

            let mut line = String::new();
            match self.input.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => {
                    warn!("reading destination failed: {err}");
                    return None;
                }
            }
            let answer = line.trim();
            if answer.is_empty() {
                return None;
            }
            let path = PathBuf::from(answer);
            if path.is_dir() {
                return Some(path);
            }
            let _ = writeln!(self.output, "Not a directory: {}", path.display());
        }
    }
}
