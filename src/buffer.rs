//! Output buffer backing the `WRITE_*` builtins.
//!
//! User code accumulates report text here and flushes it to stdout or to
//! files. File writes append, so several rules can share one report file.

use std::fs::OpenOptions;
use std::io::Write as _;

use anyhow::Context as _;

#[derive(Debug, Default)]
pub struct OutputBuffer {
    text: String,
}

impl OutputBuffer {
    pub fn write(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn clear(&mut self) {
        self.text.clear();
    }

    pub fn contents(&self) -> &str {
        &self.text
    }

    pub fn to_stdout(&self) {
        print!("{}", self.text);
    }

    /// Append the buffer to each file in `paths`.
    pub fn to_files(&self, paths: &[String]) -> anyhow::Result<()> {
        for path in paths {
            append_to_file(path, &self.text)?;
        }
        Ok(())
    }
}

pub fn append_to_file(path: &str, text: &str) -> anyhow::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open '{path}' for append"))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("cannot write to '{path}'"))
}

/// Print each list element on its own line.
pub fn list_to_stdout(items: &[String]) {
    for item in items {
        println!("{item}");
    }
}

/// Append each list element, newline-terminated, to every file.
pub fn list_to_files(items: &[String], paths: &[String]) -> anyhow::Result<()> {
    let mut text = String::new();
    for item in items {
        text.push_str(item);
        text.push('\n');
    }
    for path in paths {
        append_to_file(path, &text)?;
    }
    Ok(())
}

/// Join list elements with `sep` (the `XLAT_AR_TO_STRING` builtin).
pub fn xlat_list_to_string(items: &[String], sep: &str) -> String {
    items.join(sep)
}
