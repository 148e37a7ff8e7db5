//! Log input: files and stdin, read line by line.
//!
//! Each source is consumed fully before the next starts; the engine keeps
//! the global line id. Tail mode (`--forever`) has no readiness poll — the
//! reader simply re-issues blocking reads after a short sleep, which picks
//! up appended data on a grown file.

use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context as _;

/// Order applied to the accumulated logfile list before scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    Desc,
    #[default]
    None,
}

impl SortOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// One log source as requested on the command line.
#[derive(Debug, Clone)]
pub struct LogSpec {
    pub source: LogSource,
    /// Keep the handle open at EOF and poll for more data.
    pub forever: bool,
}

#[derive(Debug, Clone)]
pub enum LogSource {
    File(PathBuf),
    Stdin,
}

impl LogSpec {
    pub fn display_name(&self) -> String {
        match &self.source {
            LogSource::File(path) => path.display().to_string(),
            LogSource::Stdin => "<stdin>".to_string(),
        }
    }
}

/// One line handed to the engine: source name, 1-based line number within
/// that source, and the text without its terminator.
#[derive(Debug, Clone)]
pub struct LineRecord {
    pub file: String,
    pub file_line: u64,
    pub text: String,
}

/// An open log source.
pub struct LogReader {
    pub name: String,
    inner: Box<dyn BufRead>,
}

/// Open a source with the requested buffer capacity (in KB).
pub fn open(spec: &LogSpec, buffer_kb: usize) -> anyhow::Result<LogReader> {
    let capacity = buffer_kb.max(1) * 1024;
    let name = spec.display_name();
    let inner: Box<dyn BufRead> = match &spec.source {
        LogSource::File(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("cannot open logfile '{}'", path.display()))?;
            Box::new(BufReader::with_capacity(capacity, file))
        }
        LogSource::Stdin => Box::new(BufReader::with_capacity(capacity, io::stdin())),
    };
    Ok(LogReader { name, inner })
}

impl LogReader {
    /// Next line without its `\n`/`\r\n` terminator; `None` at EOF.
    /// In tail mode the caller sleeps and calls again — a grown file
    /// yields fresh data on the next read.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut buf = String::new();
        let n = self.inner.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }
}

/// Sort the file specs by display name; `None` keeps command-line order.
pub fn sort_specs(specs: &mut [LogSpec], order: SortOrder) {
    match order {
        SortOrder::Asc => specs.sort_by_key(LogSpec::display_name),
        SortOrder::Desc => {
            specs.sort_by(|a, b| b.display_name().cmp(&a.display_name()));
        }
        SortOrder::None => {}
    }
}
