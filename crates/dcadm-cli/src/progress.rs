//! Human progress output and confirmation prompts.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};

use dcadm_core::Reporter;

/// Progress goes to stdout as plain lines; warnings and errors to stderr.
pub struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        println!("{msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("error: {msg}");
    }
}

/// Ask a yes/no question on the terminal; anything but `y`/`yes` is no.
pub fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    io::stdout().flush().context("failed to flush stdout")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
