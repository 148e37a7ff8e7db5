//! Shared regex cache.
//!
//! Identical resolved regex texts across all rules compile once and share
//! one matcher. Each entry memoises its last evaluation `{line id, capture
//! groups}` so a second clause hitting the same entry on the same line
//! reuses the captures with no engine invocation. The memo is written only
//! from the single-threaded matching loop.

use std::cell::RefCell;
use std::collections::HashMap;

use regex::Regex;

use crate::compile::types::{ClauseBody, RuleSet};
use crate::script::Diagnostics;

/// Capture groups of one evaluation: index 0 is the whole match.
pub type Captures = Vec<Option<String>>;

#[derive(Debug, Default)]
struct Memo {
    line_id: u64,
    /// `Some(result)` once evaluated for `line_id`; the inner `Option` is
    /// whether the regex matched at all.
    result: Option<Option<Captures>>,
}

#[derive(Debug)]
struct CacheEntry {
    re: Regex,
    memo: RefCell<Memo>,
    refcount: usize,
}

/// The cache built over every cacheable clause of a rule set.
#[derive(Debug, Default)]
pub struct RegexCache {
    entries: Vec<CacheEntry>,
}

impl RegexCache {
    /// Dedup and precompile every regex clause without runtime inserts,
    /// assigning cache indices into the rules. Invalid patterns become
    /// clause-scoped diagnostics.
    pub fn build(rules: &mut RuleSet, diags: &mut Diagnostics) -> Self {
        let mut cache = Self::default();
        let mut index: HashMap<String, usize> = HashMap::new();

        for rule in &mut rules.rules {
            let rule_name = rule.name.clone();
            for (i, clause) in rule.clauses.iter_mut().enumerate() {
                if !clause.inserts.is_empty() {
                    continue; // final text known only per instance
                }
                let kind = clause.kind;
                let pattern = match &clause.body {
                    ClauseBody::Regex { text, .. } => full_pattern(&clause.regex_opts, text),
                    ClauseBody::Code { .. } => continue,
                };
                match cache.intern(&mut index, &pattern) {
                    Ok(idx) => {
                        if let ClauseBody::Regex { cache: slot, .. } = &mut clause.body {
                            *slot = Some(idx);
                        }
                    }
                    Err(e) => diags.clause_error(
                        clause.loc.clone(),
                        &rule_name,
                        &format!("{}[{i}]", kind.label()),
                        format!("bad regex: {e}"),
                    ),
                }
            }
            for (i, opt) in rule.optionals.iter_mut().enumerate() {
                if !opt.inserts.is_empty() {
                    continue;
                }
                let pattern = full_pattern(&opt.regex_opts, &opt.text);
                match cache.intern(&mut index, &pattern) {
                    Ok(idx) => opt.cache = Some(idx),
                    Err(e) => diags.clause_error(
                        opt.loc.clone(),
                        &rule_name,
                        &format!("OPTIONAL[{i}]"),
                        format!("bad regex: {e}"),
                    ),
                }
            }
        }
        cache
    }

    fn intern(&mut self, index: &mut HashMap<String, usize>, pattern: &str) -> Result<usize, regex::Error> {
        if let Some(&idx) = index.get(pattern) {
            self.entries[idx].refcount += 1;
            return Ok(idx);
        }
        let re = Regex::new(pattern)?;
        let idx = self.entries.len();
        self.entries.push(CacheEntry {
            re,
            memo: RefCell::new(Memo::default()),
            refcount: 1,
        });
        index.insert(pattern.to_string(), idx);
        Ok(idx)
    }

    /// Evaluate entry `idx` against `line`. The first call for a given
    /// `line_id` runs the regex and memoises; later calls on the same line
    /// return the memoised captures.
    pub fn eval(&self, idx: usize, line_id: u64, line: &str) -> Option<Captures> {
        let entry = &self.entries[idx];
        let mut memo = entry.memo.borrow_mut();
        if memo.line_id == line_id {
            if let Some(ref result) = memo.result {
                return result.clone();
            }
        }
        let result = entry.re.captures(line).map(|caps| {
            caps.iter()
                .map(|g| g.map(|m| m.as_str().to_string()))
                .collect::<Captures>()
        });
        memo.line_id = line_id;
        memo.result = Some(result.clone());
        result
    }

    /// Number of distinct compiled patterns.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many clauses share entry `idx`.
    pub fn refcount(&self, idx: usize) -> usize {
        self.entries[idx].refcount
    }
}

/// Prepend `REGEX_OPTIONS` flags as an inline group.
pub fn full_pattern(opts: &str, text: &str) -> String {
    if opts.is_empty() {
        text.to_string()
    } else {
        format!("(?{opts}){text}")
    }
}
