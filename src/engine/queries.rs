//! Cross-rule queries exposed to user code through the host builtins.
//!
//! Every operation here runs against [`EngineState`] while an action is
//! executing; the "controller" is the rule whose code is running (a live
//! instance's action or a candidate-walk code clause).

use crate::host::{VarTable, VarValue};

use super::instance::PrevInstance;
use super::state::{ActionCtx, EngineState};

impl EngineState {
    /// Scan `candidates` for completed prerequisites of the controller.
    ///
    /// A candidate passes when it has a previous-instance snapshot, that
    /// snapshot started strictly after the controller's own last completed
    /// start (when the controller has one), and the snapshot has not
    /// already armed this controller. Among passers the one with the
    /// largest stop line wins and is recorded as having armed the
    /// controller.
    pub fn compare_rules(&mut self, candidates: &[String]) -> Option<String> {
        let controller = self.controller_rule()?;
        let controller_prev_start = self.prev.get(&controller).map(|p| p.start_line);

        let mut winner: Option<(String, u64)> = None;
        for name in candidates {
            let upper = name.to_uppercase();
            let Some(prev) = self.prev.get(&upper) else {
                continue;
            };
            if let Some(after) = controller_prev_start {
                if prev.start_line <= after {
                    continue;
                }
            }
            if prev.rules_created.contains(&controller) {
                continue;
            }
            // Ties go to the later-listed candidate.
            if winner.as_ref().is_none_or(|(_, stop)| prev.stop_line >= *stop) {
                winner = Some((upper, prev.stop_line));
            }
        }

        let (name, _) = winner?;
        if let Some(prev) = self.prev.get_mut(&name) {
            prev.rules_created.insert(controller);
        }
        Some(name)
    }

    /// Shallow-copy the named rule's previous-instance variables into the
    /// controller's variable table. Returns false when the rule has no
    /// snapshot or no controller context exists.
    pub fn import_inst_vars(&mut self, rule_name: &str) -> bool {
        let Some(prev) = self.prev.get(&rule_name.to_uppercase()) else {
            return false;
        };
        let vars: Vec<(String, VarValue)> = prev
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let Some(target) = self.target_vars_mut() else {
            return false;
        };
        for (name, value) in vars {
            target.insert(name, value);
        }
        true
    }

    /// `compare_rules` then `import_inst_vars` of the winner.
    pub fn compare_rules_and_import(&mut self, candidates: &[String]) -> Option<String> {
        let winner = self.compare_rules(candidates)?;
        self.import_inst_vars(&winner);
        Some(winner)
    }

    pub fn has_rule_ever_matched(&self, rule_name: &str) -> bool {
        self.found.contains(&rule_name.to_uppercase())
    }

    pub fn last_rule_inst(&self, rule_name: &str) -> Option<&PrevInstance> {
        self.prev.get(&rule_name.to_uppercase())
    }

    pub fn get_user_opt(&self, name: &str) -> Option<Vec<String>> {
        self.user_opts.get(name).map(<[String]>::to_vec)
    }

    /// The variable table the executing action writes into.
    fn target_vars_mut(&mut self) -> Option<&mut VarTable> {
        match self.ctx.clone() {
            ActionCtx::None => None,
            ActionCtx::Instance(id) => self.instance_mut(id).map(|i| &mut i.vars),
            ActionCtx::Walk(_) => Some(&mut self.scratch),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::user_opts::UserOpts;

    fn prev(start: u64, stop: u64) -> PrevInstance {
        PrevInstance {
            start_line: start,
            stop_line: stop,
            vars: VarTable::new(),
            rules_created: HashSet::new(),
        }
    }

    fn state_with_controller(rule: &str) -> EngineState {
        let mut st = EngineState::new(UserOpts::default());
        st.rule_names = vec![rule.to_string()];
        st.ctx = ActionCtx::Walk(rule.to_string());
        st
    }

    #[test]
    fn compare_rules_picks_largest_stopline() {
        let mut st = state_with_controller("C");
        st.prev.insert("A".to_string(), prev(1, 5));
        st.prev.insert("B".to_string(), prev(2, 9));
        let winner = st.compare_rules(&["A".to_string(), "B".to_string()]);
        assert_eq!(winner.as_deref(), Some("B"));
    }

    #[test]
    fn compare_rules_requires_snapshot() {
        let mut st = state_with_controller("C");
        assert!(st.compare_rules(&["A".to_string()]).is_none());
    }

    #[test]
    fn compare_rules_requires_start_after_controllers_prev() {
        let mut st = state_with_controller("C");
        st.prev.insert("C".to_string(), prev(10, 12));
        st.prev.insert("A".to_string(), prev(5, 20));
        assert!(st.compare_rules(&["A".to_string()]).is_none());

        st.prev.insert("B".to_string(), prev(11, 13));
        let winner = st.compare_rules(&["A".to_string(), "B".to_string()]);
        assert_eq!(winner.as_deref(), Some("B"));
    }

    #[test]
    fn compare_rules_never_rearms_same_controller() {
        let mut st = state_with_controller("C");
        st.prev.insert("A".to_string(), prev(1, 5));
        assert_eq!(st.compare_rules(&["A".to_string()]).as_deref(), Some("A"));
        // Second query: A already armed this controller.
        assert!(st.compare_rules(&["A".to_string()]).is_none());
    }

    #[test]
    fn import_copies_vars_into_walk_scratch() {
        let mut st = state_with_controller("C");
        let mut p = prev(1, 2);
        p.vars.insert(
            "TS".to_string(),
            VarValue::Scalar("12:30".to_string()),
        );
        st.prev.insert("A".to_string(), p);
        assert!(st.import_inst_vars("a"));
        assert_eq!(
            st.scratch.get("TS"),
            Some(&VarValue::Scalar("12:30".to_string()))
        );
    }

    #[test]
    fn import_without_snapshot_is_false() {
        let mut st = state_with_controller("C");
        assert!(!st.import_inst_vars("A"));
    }

    #[test]
    fn compare_and_import_imports_winner() {
        let mut st = state_with_controller("C");
        let mut a = prev(1, 5);
        a.vars
            .insert("TS".to_string(), VarValue::Scalar("old".to_string()));
        let mut b = prev(2, 9);
        b.vars
            .insert("TS".to_string(), VarValue::Scalar("new".to_string()));
        st.prev.insert("A".to_string(), a);
        st.prev.insert("B".to_string(), b);
        let winner = st.compare_rules_and_import(&["A".to_string(), "B".to_string()]);
        assert_eq!(winner.as_deref(), Some("B"));
        assert_eq!(
            st.scratch.get("TS"),
            Some(&VarValue::Scalar("new".to_string()))
        );
    }

    #[test]
    fn user_opt_lookup_case_insensitive() {
        let mut st = EngineState::new(
            UserOpts::parse(&["thresh=5".to_string()]).unwrap(),
        );
        st.ctx = ActionCtx::None;
        assert_eq!(st.get_user_opt("THRESH"), Some(vec!["5".to_string()]));
        assert!(st.get_user_opt("other").is_none());
    }
}
