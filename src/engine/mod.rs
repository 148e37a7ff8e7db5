//! The matching runtime.
//!
//! Consumes a line stream and drives rule instances through their match
//! sequences. Per line, in order: advance live instances, run the
//! candidate walk for every enabled rule, then re-check completions.
//! Lifecycle actions fire through the action host; state mutations
//! requested by user code (instance resets, stop) are applied when the
//! invocation returns, never re-entering the host.

pub mod instance;
pub mod queries;
pub mod state;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests;

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use regex::Regex;

use crate::cache::{Captures, RegexCache, full_pattern};
use crate::compile::types::{
    ActionKind, CallableId, ClauseBody, ClauseKind, RuleSet, RuntimeExtract, RuntimeInsert,
};
use crate::host::{ActionHost, Binding, VarTable, bind_var};
use crate::input::{self, LineRecord, LogSpec};

use instance::{PrevInstance, RuleInstance};
use state::{ActionCtx, EngineState};

/// Runtime options from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineOptions {
    /// Complete single-match rules directly, without an instance.
    pub fast: bool,
    pub verbose: bool,
    pub debug: bool,
    /// Progress heartbeat to stderr every N lines; 0 disables.
    pub status: u64,
}

pub struct Engine<H: ActionHost> {
    rules: RuleSet,
    cache: RegexCache,
    host: H,
    state: Rc<RefCell<EngineState>>,
    opts: EngineOptions,
    /// Re-entrancy guard for reset draining.
    draining: Cell<bool>,
}

impl<H: ActionHost> Engine<H> {
    /// Build an engine, compiling every action body, code clause, and
    /// shared/termination entry through the host. A body that fails to
    /// compile is reported and disabled; the run continues without it.
    pub fn new(
        mut rules: RuleSet,
        cache: RegexCache,
        host: H,
        state: Rc<RefCell<EngineState>>,
        opts: EngineOptions,
    ) -> Self {
        for rule in &mut rules.rules {
            let rule_name = rule.name.clone();
            for (kind, action) in &mut rule.actions {
                let label = format!("{rule_name}.ACTION.{}", kind.label());
                match host.compile(&label, &action.source) {
                    Ok(id) => action.callable = Some(id),
                    Err(e) => eprintln!("[logengine] compile error in {label}: {e:#}"),
                }
            }
            for (i, clause) in rule.clauses.iter_mut().enumerate() {
                let label = format!("{rule_name}.{}[{i}]", clause.kind.label());
                if let ClauseBody::Code { source, callable } = &mut clause.body {
                    match host.compile(&label, source) {
                        Ok(id) => *callable = Some(id),
                        Err(e) => eprintln!("[logengine] compile error in {label}: {e:#}"),
                    }
                }
            }
        }
        for entry in &rules.shared_code {
            if let Err(e) = host.declare_global(&entry.name, &entry.source) {
                eprintln!(
                    "[logengine] compile error in SHARED_CODE {} ({}): {e:#}",
                    entry.name, entry.loc
                );
            }
        }
        for entry in &mut rules.termination_code {
            let label = format!("TERMINATION_CODE.{}", entry.name);
            match host.compile(&label, &entry.source) {
                Ok(id) => entry.callable = Some(id),
                Err(e) => eprintln!("[logengine] compile error in {label}: {e:#}"),
            }
        }

        state.borrow_mut().rule_names = rules.rules.iter().map(|r| r.name.clone()).collect();

        Self {
            rules,
            cache,
            host,
            state,
            opts,
            draining: Cell::new(false),
        }
    }

    pub fn state(&self) -> &Rc<RefCell<EngineState>> {
        &self.state
    }

    /// Scan every source in order, then run the end-of-stream protocol.
    pub fn run(&self, specs: &[LogSpec], buffer_kb: usize) -> anyhow::Result<()> {
        'sources: for spec in specs {
            let mut reader = match input::open(spec, buffer_kb) {
                Ok(r) => r,
                Err(e) => {
                    // A broken logfile is skipped; the others still run.
                    eprintln!("[logengine] {e:#}");
                    continue;
                }
            };
            if self.opts.verbose {
                eprintln!("[logengine] scanning {}", reader.name);
            }
            let mut file_line = 0u64;
            loop {
                if self.state.borrow().stop_requested {
                    break 'sources;
                }
                match reader.next_line() {
                    Ok(Some(text)) => {
                        file_line += 1;
                        self.process_line(&LineRecord {
                            file: reader.name.clone(),
                            file_line,
                            text,
                        });
                        if self.opts.status > 0 && file_line % self.opts.status == 0 {
                            eprintln!("[logengine] {}: {file_line} lines", reader.name);
                        }
                    }
                    Ok(None) => {
                        if spec.forever && !self.state.borrow().stop_requested {
                            std::thread::sleep(std::time::Duration::from_millis(200));
                        } else {
                            break;
                        }
                    }
                    Err(e) => {
                        eprintln!(
                            "[logengine] read error on {}: {e}; skipping rest of file",
                            reader.name
                        );
                        break;
                    }
                }
            }
        }
        self.finish();
        Ok(())
    }

    /// Process one line: advance, create candidates, re-check completion.
    pub fn process_line(&self, rec: &LineRecord) {
        {
            let mut st = self.state.borrow_mut();
            st.line_id += 1;
            st.current_file.clone_from(&rec.file);
            st.current_text.clone_from(&rec.text);
        }
        self.advance_instances();
        self.create_candidates();
        self.check_completions();
    }

    // --- step 2: advance live instances -----------------------------------

    fn advance_instances(&self) {
        let ids: Vec<u64> = self.state.borrow().live.iter().map(|i| i.id).collect();
        for id in ids {
            self.advance_one(id);
        }
    }

    fn advance_one(&self, id: u64) {
        let Some((rule_idx, mut match_idx, pre_phase)) = ({
            let st = self.state.borrow();
            st.instance(id)
                .map(|i| (i.rule, i.match_idx, i.in_pre_phase(&self.rules.rules[i.rule])))
        }) else {
            return;
        };
        let clause_count = self.rules.rules[rule_idx].clauses.len();
        let ctx = ActionCtx::Instance(id);

        if match_idx >= clause_count {
            self.complete_instance(id);
            return;
        }

        let mut progressed = false;
        if !pre_phase {
            // Evaluate the current clause; a failed ACCUM cascades to the
            // next clause against the same line, so an END directly after
            // an accumulator can match the line that broke it.
            loop {
                if match_idx >= clause_count {
                    break;
                }
                let caps = self.eval_match_clause(rule_idx, match_idx, &ctx);
                if self.state.borrow().instance(id).is_none() {
                    return; // a code clause reset this instance
                }
                if let Some(caps) = caps {
                    let clause = &self.rules.rules[rule_idx].clauses[match_idx];
                    self.apply_extracts(&ctx, &clause.extracts, &caps);
                    let advance = !clause.accum || clause.is_code();
                    {
                        let mut st = self.state.borrow_mut();
                        let line_id = st.line_id;
                        if let Some(inst) = st.instance_mut(id) {
                            inst.last_match_line = line_id;
                            if advance {
                                inst.match_idx += 1;
                            }
                        }
                    }
                    if advance {
                        match_idx += 1;
                    }
                    progressed = true;
                    break;
                }
                if self.rules.rules[rule_idx].clauses[match_idx].accum {
                    match_idx += 1;
                    if let Some(inst) = self.state.borrow_mut().instance_mut(id) {
                        inst.match_idx = match_idx;
                    }
                } else {
                    break;
                }
            }
            if match_idx >= clause_count {
                self.complete_instance(id);
                return;
            }
        }

        // Both timeout clocks age the instance even without progress.
        let line_id = self.state.borrow().line_id;
        let Some(last_match) = self.state.borrow().instance(id).map(|i| i.last_match_line)
        else {
            return;
        };
        let clause = &self.rules.rules[rule_idx].clauses[match_idx];
        if clause.match_timeout > 0
            && line_id.saturating_sub(last_match) >= clause.match_timeout
        {
            self.fire_action(rule_idx, ActionKind::MatchTimeout, &ctx);
            self.destroy_instance(id);
            return;
        }

        if !progressed && clause.kind == ClauseKind::End {
            self.try_optionals(rule_idx, id);
        }

        let rule_timeout = self.rules.rules[rule_idx].rule_timeout;
        let Some(last_match) = self.state.borrow().instance(id).map(|i| i.last_match_line)
        else {
            return;
        };
        if !progressed && rule_timeout > 0 && line_id.saturating_sub(last_match) >= rule_timeout {
            self.fire_action(rule_idx, ActionKind::Timeout, &ctx);
            let prior_is_pre = match_idx > 0
                && self.rules.rules[rule_idx].clauses[match_idx - 1].kind == ClauseKind::Pre;
            if !prior_is_pre {
                self.fire_action(rule_idx, ActionKind::Incomplete, &ctx);
            }
            self.destroy_instance(id);
        }
    }

    /// Test every OPTIONAL against the current line. A hit extracts its
    /// variables and refreshes the last-match line, but never moves the
    /// match index.
    fn try_optionals(&self, rule_idx: usize, id: u64) {
        let ctx = ActionCtx::Instance(id);
        let count = self.rules.rules[rule_idx].optionals.len();
        for i in 0..count {
            let opt = &self.rules.rules[rule_idx].optionals[i];
            let (line_id, text) = {
                let st = self.state.borrow();
                (st.line_id, st.current_text.clone())
            };
            let caps = if let Some(cidx) = opt.cache {
                self.cache.eval(cidx, line_id, &text)
            } else {
                self.eval_inserted_regex(&opt.text, &opt.regex_opts, &opt.inserts, &ctx, &text)
            };
            if let Some(caps) = caps {
                self.apply_extracts(&ctx, &opt.extracts, &caps);
                let mut st = self.state.borrow_mut();
                let line_id = st.line_id;
                if let Some(inst) = st.instance_mut(id) {
                    inst.last_match_line = line_id;
                }
            }
        }
    }

    // --- step 3: candidate creation and merging ----------------------------

    fn create_candidates(&self) {
        for rule_idx in 0..self.rules.rules.len() {
            if self.rules.rules[rule_idx].enabled {
                self.walk_rule(rule_idx);
            }
        }
    }

    /// Walk a rule's match list from the top against the current line.
    ///
    /// All leading PREs must match to arm a candidate; the first non-PRE
    /// clause is then evaluated. An existing pre-phase instance stands in
    /// for this line's PREs (its preconditions were satisfied earlier), is
    /// re-armed by a fresh PRE match, and is promoted in place when the
    /// first non-PRE clause matches — so at most one candidate per rule
    /// exists while it sits in its pre phase.
    fn walk_rule(&self, rule_idx: usize) {
        let rule = &self.rules.rules[rule_idx];
        let pre_len = rule.pre_len();
        if pre_len >= rule.clauses.len() {
            return;
        }
        let walk_ctx = ActionCtx::Walk(rule.name.clone());
        self.state.borrow_mut().scratch.clear();

        let mut pres_matched = true;
        for i in 0..pre_len {
            match self.eval_match_clause(rule_idx, i, &walk_ctx) {
                Some(caps) => self.apply_extracts(&walk_ctx, &rule.clauses[i].extracts, &caps),
                None => {
                    pres_matched = false;
                    break;
                }
            }
        }

        let armed = if pre_len > 0 {
            self.state
                .borrow()
                .live
                .iter()
                .find(|i| i.rule == rule_idx && i.match_idx <= pre_len)
                .map(|i| i.id)
        } else {
            None
        };
        if pre_len > 0 && !pres_matched && armed.is_none() {
            return;
        }

        let first_idx = pre_len;
        let (start, matched_first) =
            match self.eval_match_clause(rule_idx, first_idx, &walk_ctx) {
                Some(caps) => {
                    self.apply_extracts(&walk_ctx, &rule.clauses[first_idx].extracts, &caps);
                    (first_idx + 1, true)
                }
                None if pres_matched && pre_len > 0 => (first_idx, false),
                None => return,
            };

        let (line_id, file) = {
            let st = self.state.borrow();
            (st.line_id, st.current_file.clone())
        };

        if matched_first && self.opts.fast && rule.single_match() {
            // Single-match fast path: COMPLETE with no instance, so CREATE
            // and DESTROY never fire for this rule in fast mode.
            let name = rule.name.clone();
            self.fire_action(rule_idx, ActionKind::Complete, &walk_ctx);
            let mut st = self.state.borrow_mut();
            let vars = std::mem::take(&mut st.scratch);
            st.found.insert(name.clone());
            st.prev.insert(
                name,
                PrevInstance {
                    start_line: line_id,
                    stop_line: line_id,
                    vars,
                    rules_created: HashSet::new(),
                },
            );
            return;
        }

        if let Some(armed_id) = armed {
            // Candidate merging: re-arm or promote in place, no CREATE.
            let mut st = self.state.borrow_mut();
            let vars = std::mem::take(&mut st.scratch);
            if let Some(inst) = st.instance_mut(armed_id) {
                inst.match_idx = start;
                inst.vars = vars;
                inst.start_line = line_id;
                inst.last_match_line = line_id;
                inst.logfile = file;
            }
            return;
        }

        let id = {
            let mut st = self.state.borrow_mut();
            let id = st.next_instance_id();
            let vars = std::mem::take(&mut st.scratch);
            st.found.insert(rule.name.clone());
            st.live.push(RuleInstance {
                id,
                rule: rule_idx,
                match_idx: start,
                start_line: line_id,
                last_match_line: line_id,
                logfile: file,
                vars,
            });
            id
        };
        if self.opts.debug {
            eprintln!(
                "[logengine] line {line_id}: new candidate for '{}' at clause {start}",
                rule.name
            );
        }
        self.fire_action(rule_idx, ActionKind::Create, &ActionCtx::Instance(id));
    }

    // --- step 4: completion re-check ---------------------------------------

    fn check_completions(&self) {
        let ids: Vec<u64> = self.state.borrow().live.iter().map(|i| i.id).collect();
        for id in ids {
            let done = self
                .state
                .borrow()
                .instance(id)
                .map(|i| i.match_idx >= self.rules.rules[i.rule].clauses.len());
            if done == Some(true) {
                self.complete_instance(id);
            }
        }
    }

    // --- end-of-stream protocol --------------------------------------------

    /// INCOMPLETE for every live instance past its pre phase, MISSING for
    /// every enabled rule that never matched, then termination code in
    /// declaration order. No instance survives.
    pub fn finish(&self) {
        let ids: Vec<u64> = self.state.borrow().live.iter().map(|i| i.id).collect();
        for id in ids {
            let Some((rule_idx, pre_phase, start_line)) = ({
                let st = self.state.borrow();
                st.instance(id).map(|i| {
                    (i.rule, i.in_pre_phase(&self.rules.rules[i.rule]), i.start_line)
                })
            }) else {
                continue;
            };
            if !pre_phase {
                let ctx = ActionCtx::Instance(id);
                if !self.fire_action(rule_idx, ActionKind::Incomplete, &ctx) {
                    eprintln!(
                        "[logengine] W: rule '{}' incomplete at end of input (started line {start_line})",
                        self.rules.rules[rule_idx].name
                    );
                }
            }
            if self.state.borrow().instance(id).is_some() {
                self.destroy_instance(id);
            }
        }

        for rule_idx in 0..self.rules.rules.len() {
            let rule = &self.rules.rules[rule_idx];
            if !rule.enabled || self.state.borrow().found.contains(&rule.name) {
                continue;
            }
            if !self.fire_action(rule_idx, ActionKind::Missing, &ActionCtx::None) {
                eprintln!("[logengine] W: rule '{}' never matched", rule.name);
            }
        }

        for entry in &self.rules.termination_code {
            let Some(callable) = entry.callable else {
                continue;
            };
            let binding = self.binding_for(&ActionCtx::None);
            if let Err(e) = self.host.invoke(callable, &binding) {
                // Termination code is best-effort.
                eprintln!(
                    "[logengine] error in TERMINATION_CODE {} ({}): {e:#}",
                    entry.name, entry.loc
                );
            }
            self.drain_resets();
        }
    }

    // --- clause evaluation --------------------------------------------------

    /// Evaluate one match clause for `ctx`. `Some` carries the capture
    /// groups for extraction (empty for code clauses).
    fn eval_match_clause(
        &self,
        rule_idx: usize,
        clause_idx: usize,
        ctx: &ActionCtx,
    ) -> Option<Captures> {
        let clause = &self.rules.rules[rule_idx].clauses[clause_idx];
        match &clause.body {
            ClauseBody::Code { callable, .. } => {
                let callable = (*callable)?;
                let binding = self.binding_for(ctx);
                let truthy = self.invoke_with_ctx(callable, &binding, ctx);
                self.drain_resets();
                truthy.then(Vec::new)
            }
            ClauseBody::Regex { text, cache } => {
                let (line_id, line) = {
                    let st = self.state.borrow();
                    (st.line_id, st.current_text.clone())
                };
                if let Some(idx) = cache {
                    self.cache.eval(*idx, line_id, &line)
                } else {
                    self.eval_inserted_regex(text, &clause.regex_opts, &clause.inserts, ctx, &line)
                }
            }
        }
    }

    /// Rebuild an insert-bearing regex with the target's current variable
    /// values and evaluate it. Inserted values are escaped — they are data
    /// captured from log text, not patterns.
    fn eval_inserted_regex(
        &self,
        text: &str,
        opts: &str,
        inserts: &[RuntimeInsert],
        ctx: &ActionCtx,
        line: &str,
    ) -> Option<Captures> {
        let mut resolved = text.to_string();
        {
            let st = self.state.borrow();
            let vars = match ctx {
                ActionCtx::Instance(id) => st.instance(*id).map(|i| &i.vars),
                ActionCtx::Walk(_) => Some(&st.scratch),
                ActionCtx::None => None,
            }?;
            for ins in inserts.iter().rev() {
                let value = vars.get(&ins.name).map_or("", |v| v.as_scalar());
                resolved.replace_range(ins.offset..ins.offset + ins.len, &regex::escape(value));
            }
        }
        let pattern = full_pattern(opts, &resolved);
        match Regex::new(&pattern) {
            Ok(re) => re.captures(line).map(|caps| {
                caps.iter()
                    .map(|g| g.map(|m| m.as_str().to_string()))
                    .collect()
            }),
            Err(e) => {
                if self.opts.debug {
                    eprintln!("[logengine] bad runtime regex '{pattern}': {e}");
                }
                None
            }
        }
    }

    fn apply_extracts(&self, ctx: &ActionCtx, extracts: &[RuntimeExtract], caps: &Captures) {
        if extracts.is_empty() {
            return;
        }
        let mut st = self.state.borrow_mut();
        let target: &mut VarTable = match ctx {
            ActionCtx::Instance(id) => match st.instance_mut(*id) {
                Some(inst) => &mut inst.vars,
                None => return,
            },
            ActionCtx::Walk(_) => &mut st.scratch,
            ActionCtx::None => return,
        };
        for ex in extracts {
            if let Some(Some(value)) = caps.get(ex.group) {
                bind_var(target, &ex.name, value.clone(), ex.is_list);
            }
        }
    }

    // --- lifecycle ----------------------------------------------------------

    /// Fire COMPLETE, then DESTROY, record the previous-instance snapshot,
    /// and remove the instance.
    fn complete_instance(&self, id: u64) {
        let Some(rule_idx) = self.state.borrow().instance(id).map(|i| i.rule) else {
            return;
        };
        let ctx = ActionCtx::Instance(id);
        self.fire_action(rule_idx, ActionKind::Complete, &ctx);
        if self.state.borrow().instance(id).is_none() {
            return; // the COMPLETE action reset this rule's instances
        }
        self.fire_action(rule_idx, ActionKind::Destroy, &ctx);
        let mut st = self.state.borrow_mut();
        if let Some(inst) = st.remove_instance(id) {
            let name = self.rules.rules[inst.rule].name.clone();
            if self.opts.debug {
                eprintln!(
                    "[logengine] '{name}' complete, lines {}-{}",
                    inst.start_line, inst.last_match_line
                );
            }
            st.prev.insert(
                name,
                PrevInstance {
                    start_line: inst.start_line,
                    stop_line: inst.last_match_line,
                    vars: inst.vars,
                    rules_created: HashSet::new(),
                },
            );
        }
    }

    /// Fire DESTROY and remove; used for every non-completion terminal
    /// state (timeouts, resets, end of stream).
    fn destroy_instance(&self, id: u64) {
        let Some(rule_idx) = self.state.borrow().instance(id).map(|i| i.rule) else {
            return;
        };
        self.fire_action(rule_idx, ActionKind::Destroy, &ActionCtx::Instance(id));
        self.state.borrow_mut().remove_instance(id);
    }

    // --- host plumbing ------------------------------------------------------

    /// Fire a rule's handler for `kind` if declared. Returns whether a
    /// handler was declared (even one whose compile failed).
    fn fire_action(&self, rule_idx: usize, kind: ActionKind, ctx: &ActionCtx) -> bool {
        let Some(action) = self.rules.rules[rule_idx].actions.get(&kind) else {
            return false;
        };
        let Some(callable) = action.callable else {
            return true;
        };
        let binding = self.binding_for(ctx);
        self.invoke_with_ctx(callable, &binding, ctx);
        self.drain_resets();
        true
    }

    /// Invoke under a controller context, restoring the previous context
    /// afterwards. Host errors are reported and count as false.
    fn invoke_with_ctx(&self, callable: CallableId, binding: &Binding, ctx: &ActionCtx) -> bool {
        let saved = {
            let mut st = self.state.borrow_mut();
            std::mem::replace(&mut st.ctx, ctx.clone())
        };
        let result = self.host.invoke(callable, binding);
        self.state.borrow_mut().ctx = saved;
        match result {
            Ok(truthy) => truthy,
            Err(e) => {
                let rule = match ctx {
                    ActionCtx::Instance(id) => self
                        .state
                        .borrow()
                        .instance(*id)
                        .map(|i| self.rules.rules[i.rule].name.clone()),
                    ActionCtx::Walk(name) => Some(name.clone()),
                    ActionCtx::None => None,
                };
                match rule {
                    Some(rule) => eprintln!("[logengine] action error in rule '{rule}': {e:#}"),
                    None => eprintln!("[logengine] action error: {e:#}"),
                }
                false
            }
        }
    }

    fn binding_for(&self, ctx: &ActionCtx) -> Binding {
        let st = self.state.borrow();
        match ctx {
            ActionCtx::Instance(id) => st.instance(*id).map_or_else(Binding::default, |inst| {
                Binding {
                    vars: inst.vars.clone(),
                    line_start: inst.start_line,
                    line_stop: inst.last_match_line,
                    line_lastread: st.current_text.clone(),
                }
            }),
            ActionCtx::Walk(_) => Binding {
                vars: st.scratch.clone(),
                line_start: st.line_id,
                line_stop: st.line_id,
                line_lastread: st.current_text.clone(),
            },
            ActionCtx::None => Binding {
                vars: VarTable::new(),
                line_start: st.line_id,
                line_stop: st.line_id,
                line_lastread: st.current_text.clone(),
            },
        }
    }

    /// Apply instance resets queued by builtins. Guarded against
    /// re-entrancy: DESTROY handlers firing here may queue more resets,
    /// which the outer round picks up, bounded to keep a mutually
    /// resetting pair of rules from spinning forever.
    fn drain_resets(&self) {
        if self.draining.get() {
            return;
        }
        self.draining.set(true);
        for _ in 0..8 {
            let names = self.state.borrow_mut().take_pending_resets();
            if names.is_empty() {
                self.draining.set(false);
                return;
            }
            for name in names {
                let ids = self.state.borrow().live_ids_of(&name);
                for id in ids {
                    self.destroy_instance(id);
                }
            }
        }
        self.draining.set(false);
        eprintln!("[logengine] W: instance resets still queued after 8 rounds; dropped");
    }
}
