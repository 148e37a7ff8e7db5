//! Compiled rule model.
//!
//! Everything here is produced by the compiler and immutable at runtime;
//! the whole set serializes to JSON for `--dump`.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::script::SourceLoc;

/// Opaque handle to a compiled action-host callable.
pub type CallableId = usize;

/// Position of a clause within a rule's match sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClauseKind {
    Pre,
    Begin,
    End,
}

impl ClauseKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pre => "PRE",
            Self::Begin => "BEGIN",
            Self::End => "END",
        }
    }
}

/// Rule lifecycle events a script may attach a handler to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ActionKind {
    Create,
    Complete,
    Destroy,
    Timeout,
    MatchTimeout,
    Missing,
    Incomplete,
}

impl ActionKind {
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "CREATE" => Some(Self::Create),
            "COMPLETE" => Some(Self::Complete),
            "DESTROY" => Some(Self::Destroy),
            "TIMEOUT" => Some(Self::Timeout),
            "MATCH_TIMEOUT" => Some(Self::MatchTimeout),
            "MISSING" => Some(Self::Missing),
            "INCOMPLETE" => Some(Self::Incomplete),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Complete => "COMPLETE",
            Self::Destroy => "DESTROY",
            Self::Timeout => "TIMEOUT",
            Self::MatchTimeout => "MATCH_TIMEOUT",
            Self::Missing => "MISSING",
            Self::Incomplete => "INCOMPLETE",
        }
    }
}

/// A named capture bound during resolution: the variable takes the value of
/// the `group`-th capture group of the owning clause on every match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeExtract {
    pub name: String,
    pub group: usize,
    /// `@@NAME` extracts append to an ordered list; `$$NAME` overwrites.
    pub is_list: bool,
}

/// A placeholder in resolved regex text where a runtime variable's current
/// value is substituted per instance before evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInsert {
    pub name: String,
    /// Byte offset of the placeholder in the resolved clause text.
    pub offset: usize,
    /// Byte length of the placeholder.
    pub len: usize,
}

/// Body of a match clause: a resolved regex or an action-host code chunk.
#[derive(Debug, Clone, Serialize)]
pub enum ClauseBody {
    Regex {
        /// Fully-resolved regex text (placeholders still in place when
        /// `inserts` is non-empty).
        text: String,
        /// Index into the shared regex cache; `None` when the clause has
        /// runtime inserts and must compile per instance.
        #[serde(skip_serializing_if = "Option::is_none")]
        cache: Option<usize>,
    },
    Code {
        source: String,
        #[serde(skip)]
        callable: Option<CallableId>,
    },
}

/// One PRE/BEGIN/END entry of a rule.
#[derive(Debug, Clone, Serialize)]
pub struct MatchClause {
    pub kind: ClauseKind,
    pub accum: bool,
    pub raw: String,
    pub regex_opts: String,
    pub body: ClauseBody,
    pub inserts: Vec<RuntimeInsert>,
    pub extracts: Vec<RuntimeExtract>,
    /// Lines the clause may go unmatched before MATCH_TIMEOUT; 0 disables.
    pub match_timeout: u64,
    pub loc: SourceLoc,
}

impl MatchClause {
    pub const fn is_code(&self) -> bool {
        matches!(self.body, ClauseBody::Code { .. })
    }
}

/// An OPTIONAL entry: a side-match tested only while a rule instance is
/// stalled on an END clause. Never advances the match index.
#[derive(Debug, Clone, Serialize)]
pub struct OptionalClause {
    pub text: String,
    pub regex_opts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<usize>,
    pub inserts: Vec<RuntimeInsert>,
    pub extracts: Vec<RuntimeExtract>,
    pub loc: SourceLoc,
}

/// A lifecycle handler body.
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub source: String,
    #[serde(skip)]
    pub callable: Option<CallableId>,
    pub loc: SourceLoc,
}

/// A variable declared on a rule, either compile-time (macro-like value)
/// or runtime (bound per instance from captures or imports).
#[derive(Debug, Clone, Serialize)]
pub struct RuleVar {
    pub name: String,
    pub runtime: bool,
    pub is_list: bool,
    /// Raw value for compile-time variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Capture-group ordinal for `$$`/`@@`-declared variables.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<usize>,
}

/// A compiled rule. Mutated only while the compiler resolves it; immutable
/// once the runtime starts.
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub clauses: Vec<MatchClause>,
    pub optionals: Vec<OptionalClause>,
    pub vars: HashMap<String, RuleVar>,
    pub actions: BTreeMap<ActionKind, Action>,
    /// Lines without forward progress before TIMEOUT; 0 disables.
    pub rule_timeout: u64,
    pub loc: SourceLoc,
}

impl Rule {
    /// Number of leading PRE clauses.
    pub fn pre_len(&self) -> usize {
        self.clauses
            .iter()
            .take_while(|c| c.kind == ClauseKind::Pre)
            .count()
    }

    /// True when the rule has exactly one clause that is not a PRE —
    /// the shape eligible for the fast-mode direct-complete path.
    pub fn single_match(&self) -> bool {
        self.clauses
            .iter()
            .filter(|c| c.kind != ClauseKind::Pre)
            .count()
            == 1
            && self.pre_len() == 0
    }
}

/// A shared-code or termination-code entry, kept in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct CodeEntry {
    pub name: String,
    pub source: String,
    #[serde(skip)]
    pub callable: Option<CallableId>,
    pub loc: SourceLoc,
}

/// The full compiled output of every loaded script.
#[derive(Debug, Default, Serialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    /// Upper-cased rule name to index in `rules`.
    pub by_name: HashMap<String, usize>,
    pub shared_code: Vec<CodeEntry>,
    pub termination_code: Vec<CodeEntry>,
}

impl RuleSet {
    pub fn rule_by_name(&self, name: &str) -> Option<&Rule> {
        self.by_name.get(&name.to_uppercase()).map(|&i| &self.rules[i])
    }
}
