//! INI-like rule script loader.
//!
//! Scripts are line-oriented: `[SECTION]` headers open sections, other
//! non-blank lines are `lvalue=rvalue` entries. Lines starting with `#` or
//! `;` are comments, a trailing `\` splices the next physical line, and
//! `INCLUDE=path` entries pull in another script (re-includes of the same
//! basename are silently skipped). The loader preserves section and entry
//! order and reports every problem it finds instead of stopping at the
//! first one.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

/// Position of a line in a loaded script, carried through compilation so
/// every diagnostic can point back at its source.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A script error with enough context to print `E: <file>:<line>: ...`.
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub loc: SourceLoc,
    /// Rule section the error occurred in, when known.
    pub rule: Option<String>,
    /// Clause label like `BEGIN[2]`, when the error is clause-scoped.
    pub clause: Option<String>,
    pub message: String,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E: {}: ", self.loc)?;
        if let Some(ref rule) = self.rule {
            write!(f, "{rule}: ")?;
        }
        if let Some(ref clause) = self.clause {
            write!(f, "{clause}: ")?;
        }
        write!(f, "{}", self.message)
    }
}

/// Collected diagnostics for a load + compile pass.
///
/// Loading and compilation keep going after an error so a script author
/// sees every problem in one run; callers check [`Diagnostics::has_errors`]
/// before starting the matching loop.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub errors: Vec<ScriptError>,
    pub warnings: Vec<String>,
}

impl Diagnostics {
    pub fn error(&mut self, loc: SourceLoc, message: impl Into<String>) {
        self.errors.push(ScriptError {
            loc,
            rule: None,
            clause: None,
            message: message.into(),
        });
    }

    pub fn rule_error(&mut self, loc: SourceLoc, rule: &str, message: impl Into<String>) {
        self.errors.push(ScriptError {
            loc,
            rule: Some(rule.to_string()),
            clause: None,
            message: message.into(),
        });
    }

    pub fn clause_error(
        &mut self,
        loc: SourceLoc,
        rule: &str,
        clause: &str,
        message: impl Into<String>,
    ) {
        self.errors.push(ScriptError {
            loc,
            rule: Some(rule.to_string()),
            clause: Some(clause.to_string()),
            message: message.into(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Print every diagnostic to stderr, errors first.
    pub fn report(&self) {
        for e in &self.errors {
            eprintln!("{e}");
        }
        for w in &self.warnings {
            eprintln!("[logengine] W: {w}");
        }
    }
}

/// One `lvalue=rvalue` entry. The key is stored upper-cased (names are
/// case-insensitive globally); the value keeps its original spelling.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub value: String,
    pub loc: SourceLoc,
}

/// A `[NAME]` section and its entries, in declaration order.
#[derive(Debug, Clone)]
pub struct Section {
    /// Upper-cased section name.
    pub name: String,
    pub loc: SourceLoc,
    pub entries: Vec<Entry>,
}

/// All sections from every loaded script, in encounter order, plus the raw
/// source text of each script (kept for the `--user` referenced-check).
#[derive(Debug, Default)]
pub struct ScriptSet {
    pub sections: Vec<Section>,
    pub sources: Vec<(String, String)>,
}

/// A script to load: a file path or already-read text (stdin).
#[derive(Debug, Clone)]
pub enum ScriptSource {
    File(PathBuf),
    Text { name: String, content: String },
}

struct Loader {
    set: ScriptSet,
    /// Lower-cased basenames already loaded; re-includes are skipped.
    seen: HashSet<String>,
    /// Index into `set.sections` of the currently open section, if any.
    open: Option<usize>,
}

/// Load `sources` and everything they INCLUDE into one [`ScriptSet`].
///
/// Problems are pushed onto `diags`; the returned set contains whatever
/// parsed cleanly so compilation can gather further diagnostics.
pub fn load_scripts(sources: &[ScriptSource], diags: &mut Diagnostics) -> ScriptSet {
    let mut loader = Loader {
        set: ScriptSet::default(),
        seen: HashSet::new(),
        open: None,
    };
    for source in sources {
        match source {
            ScriptSource::File(path) => loader.load_file(path, None, diags),
            ScriptSource::Text { name, content } => {
                if loader.mark_seen(name) {
                    loader.load_text(name, content.clone(), diags);
                }
            }
        }
    }
    loader.set
}

impl Loader {
    /// Register a script by basename; returns false when it was already
    /// loaded (the one-shot "processed" flag).
    fn mark_seen(&mut self, name: &str) -> bool {
        let base = Path::new(name)
            .file_name()
            .map_or_else(|| name.to_lowercase(), |b| b.to_string_lossy().to_lowercase());
        self.seen.insert(base)
    }

    fn load_file(&mut self, path: &Path, include_from: Option<&SourceLoc>, diags: &mut Diagnostics) {
        let name = path.display().to_string();
        if !self.mark_seen(&name) {
            return;
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open script '{name}'"));
        match content {
            Ok(text) => self.load_text(&name, text, diags),
            Err(e) => {
                let loc = include_from.cloned().unwrap_or(SourceLoc {
                    file: name.clone(),
                    line: 0,
                });
                diags.error(loc, format!("{e:#}"));
            }
        }
    }

    fn load_text(&mut self, name: &str, content: String, diags: &mut Diagnostics) {
        let mut lines = content.lines().enumerate();
        while let Some((idx, raw)) = lines.next() {
            let loc = SourceLoc {
                file: name.to_string(),
                line: idx as u32 + 1,
            };
            // Splice continuations. A comment line inside a spliced block
            // contributes nothing, but its trailing `\` still continues
            // the block.
            let mut logical = String::new();
            let mut cont = raw.trim().ends_with('\\');
            push_content(&mut logical, raw);
            while cont {
                match lines.next() {
                    Some((_, next)) => {
                        cont = next.trim().ends_with('\\');
                        push_content(&mut logical, next);
                    }
                    None => cont = false,
                }
            }
            let logical = logical.trim().to_string();
            if logical.is_empty() {
                continue;
            }
            self.dispatch_line(&logical, loc, diags);
        }
        self.set.sources.push((name.to_string(), content));
    }

    fn dispatch_line(&mut self, line: &str, loc: SourceLoc, diags: &mut Diagnostics) {
        if let Some(rest) = line.strip_prefix('[') {
            let Some(section_name) = rest.strip_suffix(']') else {
                diags.error(loc, format!("malformed section header '{line}'"));
                return;
            };
            let section_name = section_name.trim();
            if section_name.is_empty() {
                diags.error(loc, "empty section name");
                return;
            }
            self.set.sections.push(Section {
                name: section_name.to_uppercase(),
                loc,
                entries: Vec::new(),
            });
            self.open = Some(self.set.sections.len() - 1);
            return;
        }

        let Some(eq) = line.find('=') else {
            diags.error(loc, format!("malformed line '{line}' (expected lvalue=rvalue)"));
            return;
        };
        let key = line[..eq].trim().to_uppercase();
        let value = line[eq + 1..].trim().to_string();
        if key.is_empty() {
            diags.error(loc, "empty lvalue");
            return;
        }

        if key == "INCLUDE" {
            let target = resolve_include(&loc.file, &value);
            // The including file's open section survives the include.
            let open = self.open;
            self.load_file(&target, Some(&loc), diags);
            self.open = open;
            return;
        }

        let Some(open) = self.open else {
            diags.error(loc, format!("entry '{key}' outside any [SECTION]"));
            return;
        };
        self.set.sections[open].entries.push(Entry { key, value, loc });
    }
}

/// Append one physical line's contribution to the logical line. A line
/// whose first non-blank character is `#` or `;` is a comment and
/// contributes nothing; anything mid-line (regexes and action bodies use
/// both characters freely) is content.
fn push_content(out: &mut String, raw: &str) {
    let mut text = raw.trim();
    if text.starts_with('#') || text.starts_with(';') {
        return;
    }
    if let Some(stripped) = text.strip_suffix('\\') {
        text = stripped.trim_end();
    }
    out.push_str(text);
}

/// INCLUDE paths resolve relative to the including file's directory first,
/// then fall back to the path as given (CWD-relative).
fn resolve_include(from_file: &str, target: &str) -> PathBuf {
    let candidate = Path::new(from_file)
        .parent()
        .map(|dir| dir.join(target))
        .filter(|p| p.is_file());
    candidate.unwrap_or_else(|| PathBuf::from(target))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn load_one(content: &str) -> (ScriptSet, Diagnostics) {
        let mut diags = Diagnostics::default();
        let set = load_scripts(
            &[ScriptSource::Text {
                name: "test.rules".to_string(),
                content: content.to_string(),
            }],
            &mut diags,
        );
        (set, diags)
    }

    #[test]
    fn sections_and_entries() {
        let (set, diags) = load_one("[RULE1]\nBEGIN=abc\nEND=def\n[rule2]\nBEGIN=x\n");
        assert!(!diags.has_errors());
        assert_eq!(set.sections.len(), 2);
        assert_eq!(set.sections[0].name, "RULE1");
        assert_eq!(set.sections[0].entries.len(), 2);
        assert_eq!(set.sections[0].entries[0].key, "BEGIN");
        assert_eq!(set.sections[0].entries[0].value, "abc");
        assert_eq!(set.sections[1].name, "RULE2");
    }

    #[test]
    fn comments_and_blanks_skipped() {
        let (set, diags) = load_one("# header\n\n[R]\n; note\nBEGIN=abc\n");
        assert!(!diags.has_errors());
        assert_eq!(set.sections[0].entries.len(), 1);
        assert_eq!(set.sections[0].entries[0].value, "abc");
    }

    #[test]
    fn mid_line_comment_chars_are_content() {
        // Regexes and action bodies use both characters freely.
        let (set, _) = load_one("[R]\nBEGIN=a#b\nACTION.COMPLETE=f(); g()\n");
        assert_eq!(set.sections[0].entries[0].value, "a#b");
        assert_eq!(set.sections[0].entries[1].value, "f(); g()");
    }

    #[test]
    fn continuation_splices() {
        let (set, diags) = load_one("[R]\nBEGIN=abc\\\ndef\n");
        assert!(!diags.has_errors());
        assert_eq!(set.sections[0].entries[0].value, "abcdef");
    }

    #[test]
    fn continuation_through_comment() {
        // The comment line contributes nothing, but its trailing
        // backslash keeps the block going.
        let (set, diags) = load_one("[R]\nBEGIN=abc\\\n# note \\\ndef\n");
        assert!(!diags.has_errors());
        assert_eq!(set.sections[0].entries[0].value, "abcdef");
    }

    #[test]
    fn key_upper_cased_value_kept() {
        let (set, _) = load_one("[r]\nbegin=CaseKept\n");
        assert_eq!(set.sections[0].entries[0].key, "BEGIN");
        assert_eq!(set.sections[0].entries[0].value, "CaseKept");
    }

    #[test]
    fn malformed_line_reported() {
        let (_, diags) = load_one("[R]\nno equals sign\n");
        assert!(diags.has_errors());
        assert!(diags.errors[0].to_string().contains("test.rules:2"));
    }

    #[test]
    fn empty_section_name_reported() {
        let (_, diags) = load_one("[]\n");
        assert!(diags.has_errors());
    }

    #[test]
    fn entry_outside_section_reported() {
        let (_, diags) = load_one("BEGIN=abc\n");
        assert!(diags.has_errors());
    }

    #[test]
    fn unopenable_include_reported() {
        let (_, diags) = load_one("[R]\nINCLUDE=/nonexistent/path/more.rules\n");
        assert!(diags.has_errors());
        assert!(diags.errors[0].to_string().contains("cannot open"));
    }

    #[test]
    fn include_loads_and_dedups_by_basename() {
        let dir = tempfile::tempdir().unwrap();
        let inc = dir.path().join("common.rules");
        std::fs::write(&inc, "[SHARED]\nX=1\n").unwrap();
        let main = dir.path().join("main.rules");
        std::fs::write(
            &main,
            format!(
                "[R]\nBEGIN=a\nINCLUDE={inc}\nINCLUDE={inc}\n",
                inc = inc.display()
            ),
        )
        .unwrap();

        let mut diags = Diagnostics::default();
        let set = load_scripts(&[ScriptSource::File(main)], &mut diags);
        assert!(!diags.has_errors());
        // Second include silently skipped: SHARED appears once.
        let shared: Vec<_> = set.sections.iter().filter(|s| s.name == "SHARED").collect();
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn include_relative_to_including_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inc.rules"), "[INCLUDED]\nY=2\n").unwrap();
        let main = dir.path().join("main.rules");
        std::fs::write(&main, "[R]\nINCLUDE=inc.rules\n").unwrap();

        let mut diags = Diagnostics::default();
        let set = load_scripts(&[ScriptSource::File(main)], &mut diags);
        assert!(!diags.has_errors(), "{:?}", diags.errors);
        assert!(set.sections.iter().any(|s| s.name == "INCLUDED"));
    }

    #[test]
    fn open_section_survives_an_include() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inc.rules"), "[MACROS]\nW=x\n").unwrap();
        let main = dir.path().join("main.rules");
        std::fs::write(&main, "[R]\nINCLUDE=inc.rules\nBEGIN=abc\n").unwrap();

        let mut diags = Diagnostics::default();
        let set = load_scripts(&[ScriptSource::File(main)], &mut diags);
        assert!(!diags.has_errors(), "{:?}", diags.errors);
        let r = set.sections.iter().find(|s| s.name == "R").unwrap();
        assert_eq!(r.entries.len(), 1);
        assert_eq!(r.entries[0].key, "BEGIN");
    }

    #[test]
    fn sources_retained_for_reference_scan() {
        let (set, _) = load_one("[R]\nBEGIN=abc\n");
        assert_eq!(set.sources.len(), 1);
        assert!(set.sources[0].1.contains("BEGIN=abc"));
    }
}
