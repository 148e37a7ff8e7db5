//! Rule instances: the live candidates the runtime advances, and the
//! previous-instance snapshots retained for cross-rule queries.

use std::collections::HashSet;

use crate::compile::types::Rule;
use crate::host::VarTable;

/// One partially-matched candidate of a rule.
#[derive(Debug, Clone)]
pub struct RuleInstance {
    pub id: u64,
    /// Index of the owning rule in the rule set.
    pub rule: usize,
    /// Index of the current (next expected) clause in the match list.
    pub match_idx: usize,
    pub start_line: u64,
    pub last_match_line: u64,
    pub logfile: String,
    pub vars: VarTable,
}

impl RuleInstance {
    /// True while the instance has matched nothing past the rule's leading
    /// PRE clauses. Pre-phase instances are re-armed or promoted by the
    /// candidate walk instead of the advancement step, and never fire
    /// INCOMPLETE.
    pub fn in_pre_phase(&self, rule: &Rule) -> bool {
        let pre_len = rule.pre_len();
        pre_len > 0 && self.match_idx <= pre_len
    }
}

/// Read-only snapshot of the last completed instance of a rule. Owns a
/// copy of the variable table; holds no reference into the live list.
#[derive(Debug, Clone)]
pub struct PrevInstance {
    pub start_line: u64,
    pub stop_line: u64,
    pub vars: VarTable,
    /// Controller rules already armed by this snapshot; `compare_rules`
    /// never hands the same snapshot to the same controller twice.
    pub rules_created: HashSet<String>,
}
