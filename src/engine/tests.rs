use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::cache::RegexCache;
use crate::compile;
use crate::compile::types::CallableId;
use crate::host::{ActionHost, Binding, VarValue};
use crate::input::LineRecord;
use crate::script::{Diagnostics, ScriptSource, load_scripts};
use crate::user_opts::UserOpts;

use super::state::EngineState;
use super::{Engine, EngineOptions};

/// Records every invocation. Action sources double as event labels; a
/// source of `false` is falsy (for code clauses), `reset:NAME` and `stop`
/// emulate the corresponding builtins.
struct TestHost {
    sources: RefCell<Vec<String>>,
    log: Rc<RefCell<Vec<String>>>,
    bindings: Rc<RefCell<Vec<Binding>>>,
    state: RefCell<Option<Rc<RefCell<EngineState>>>>,
}

impl TestHost {
    fn new() -> (Self, Rc<RefCell<Vec<String>>>, Rc<RefCell<Vec<Binding>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let bindings = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                sources: RefCell::new(Vec::new()),
                log: Rc::clone(&log),
                bindings: Rc::clone(&bindings),
                state: RefCell::new(None),
            },
            log,
            bindings,
        )
    }
}

impl ActionHost for TestHost {
    fn compile(&self, _name: &str, source: &str) -> anyhow::Result<CallableId> {
        if source == "badcompile" {
            anyhow::bail!("refused");
        }
        let mut sources = self.sources.borrow_mut();
        sources.push(source.to_string());
        Ok(sources.len() - 1)
    }

    fn invoke(&self, id: CallableId, binding: &Binding) -> anyhow::Result<bool> {
        let source = self.sources.borrow()[id].clone();
        self.log.borrow_mut().push(source.clone());
        self.bindings.borrow_mut().push(binding.clone());
        if let Some(state) = self.state.borrow().as_ref() {
            if let Some(rule) = source.strip_prefix("reset:") {
                state.borrow_mut().request_reset(rule);
            }
            if source == "stop" {
                state.borrow_mut().stop_requested = true;
            }
        }
        Ok(source != "false")
    }

    fn declare_global(&self, _name: &str, _initializer: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Fixture {
    engine: Engine<TestHost>,
    log: Rc<RefCell<Vec<String>>>,
    bindings: Rc<RefCell<Vec<Binding>>>,
    state: Rc<RefCell<EngineState>>,
}

fn fixture(script: &str, opts: EngineOptions) -> Fixture {
    let mut diags = Diagnostics::default();
    let set = load_scripts(
        &[ScriptSource::Text {
            name: "t.rules".to_string(),
            content: script.to_string(),
        }],
        &mut diags,
    );
    let mut rules = compile::compile(&set, &mut diags);
    let cache = RegexCache::build(&mut rules, &mut diags);
    assert!(!diags.has_errors(), "{:?}", diags.errors);

    let state = Rc::new(RefCell::new(EngineState::new(UserOpts::default())));
    let (host, log, bindings) = TestHost::new();
    *host.state.borrow_mut() = Some(Rc::clone(&state));
    let engine = Engine::new(rules, cache, host, Rc::clone(&state), opts);
    Fixture {
        engine,
        log,
        bindings,
        state,
    }
}

impl Fixture {
    fn feed(&self, lines: &[&str]) {
        for (i, text) in lines.iter().enumerate() {
            self.engine.process_line(&LineRecord {
                file: "test.log".to_string(),
                file_line: i as u64 + 1,
                text: (*text).to_string(),
            });
        }
    }

    fn events(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    fn live_count(&self) -> usize {
        self.state.borrow().live.len()
    }

    fn prev_vars(&self, rule: &str) -> HashMap<String, VarValue> {
        self.state.borrow().prev[rule].vars.clone()
    }
}

fn count(events: &[String], label: &str) -> usize {
    events.iter().filter(|e| *e == label).count()
}

#[test]
fn single_begin_creates_and_completes_on_the_same_line() {
    let f = fixture(
        "[R]\nBEGIN=ABR\nACTION.CREATE=on_create\nACTION.COMPLETE=on_complete\nACTION.DESTROY=on_destroy\n",
        EngineOptions::default(),
    );
    f.feed(&["noise", "has ABR inside", "noise"]);
    assert_eq!(
        f.events(),
        vec!["on_create", "on_complete", "on_destroy"]
    );
    assert_eq!(f.live_count(), 0);
    let st = f.state.borrow();
    assert_eq!(st.prev["R"].start_line, 2);
    assert_eq!(st.prev["R"].stop_line, 2);
}

#[test]
fn every_matching_line_completes_once() {
    let f = fixture(
        "[R]\nBEGIN=ABR\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    let lines: Vec<String> = (0..100)
        .map(|i| {
            if i % 5 == 0 {
                format!("{i} ABR event")
            } else {
                format!("{i} other")
            }
        })
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    f.feed(&refs);
    assert_eq!(count(&f.events(), "on_complete"), 20);
}

#[test]
fn fast_mode_skips_create_and_destroy() {
    let f = fixture(
        "[R]\nBEGIN=ABR\nACTION.CREATE=on_create\nACTION.COMPLETE=on_complete\nACTION.DESTROY=on_destroy\n",
        EngineOptions {
            fast: true,
            ..EngineOptions::default()
        },
    );
    f.feed(&["x ABR y"]);
    assert_eq!(f.events(), vec!["on_complete"]);
    assert_eq!(f.live_count(), 0);
    assert!(f.state.borrow().found.contains("R"));
    assert_eq!(f.state.borrow().prev["R"].start_line, 1);
}

#[test]
fn begin_then_end_spans_lines() {
    let f = fixture(
        "[R]\nBEGIN=^start\nEND=^stop\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["start here", "middle", "stop here"]);
    assert_eq!(count(&f.events(), "on_complete"), 1);
    let st = f.state.borrow();
    assert_eq!(st.prev["R"].start_line, 1);
    assert_eq!(st.prev["R"].stop_line, 3);
}

#[test]
fn accum_collects_values_until_a_non_matching_line() {
    let f = fixture(
        "[R]\nBEGIN=^A$\nBEGIN_ACCUM=^X @@VAL(\\S+)\nEND=^Z$\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["A", "X 1", "X 2", "X 3", "Z"]);
    assert_eq!(count(&f.events(), "on_complete"), 1);
    assert_eq!(
        f.prev_vars("R")["VAL"],
        VarValue::List(vec!["1".to_string(), "2".to_string(), "3".to_string()])
    );
}

#[test]
fn accum_may_match_zero_lines() {
    let f = fixture(
        "[R]\nBEGIN=^A$\nBEGIN_ACCUM=^X (\\S+)\nEND=^Z$\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    // The line that breaks the accumulation is the END itself.
    f.feed(&["A", "Z"]);
    assert_eq!(count(&f.events(), "on_complete"), 1);
}

#[test]
fn trailing_accum_completes_on_the_breaking_line() {
    let f = fixture(
        "[R]\nBEGIN=^A$\nEND_ACCUM=^X\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["A", "X", "X", "done"]);
    assert_eq!(count(&f.events(), "on_complete"), 1);
    assert_eq!(f.state.borrow().prev["R"].stop_line, 3);
}

#[test]
fn pre_candidates_merge_instead_of_duplicating() {
    let f = fixture(
        "[R]\nPRE=^T\\d+\nBEGIN=HELLO\nACTION.CREATE=on_create\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["T1", "T2", "T2 HELLO"]);
    let events = f.events();
    assert_eq!(count(&events, "on_create"), 1);
    assert_eq!(count(&events, "on_complete"), 1);
    // The completing candidate is the one re-armed on the final line.
    assert_eq!(f.state.borrow().prev["R"].start_line, 3);
    assert_eq!(f.live_count(), 0);
}

#[test]
fn armed_candidate_promoted_by_a_later_begin_line() {
    // PRE on line 1, BEGIN only on line 3: the armed candidate carries the
    // precondition across lines and is promoted when BEGIN finally matches.
    let f = fixture(
        "[R]\nPRE=^ready\nBEGIN=^go\nEND=^done\nACTION.CREATE=on_create\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["ready", "noise", "go", "done"]);
    let events = f.events();
    assert_eq!(count(&events, "on_create"), 1);
    assert_eq!(count(&events, "on_complete"), 1);
    assert_eq!(f.state.borrow().prev["R"].start_line, 3);
}

#[test]
fn begin_without_its_pre_creates_nothing() {
    let f = fixture(
        "[R]\nPRE=^ready\nBEGIN=^go\nACTION.CREATE=on_create\n",
        EngineOptions::default(),
    );
    f.feed(&["go"]);
    assert!(f.events().is_empty());
    assert_eq!(f.live_count(), 0);
}

#[test]
fn rule_timeout_fires_timeout_then_incomplete_then_destroy() {
    let f = fixture(
        "[R]\nRULE_TIMEOUT=5\nBEGIN=^go\nEND=^never\n\
         ACTION.TIMEOUT=on_timeout\nACTION.INCOMPLETE=on_incomplete\nACTION.DESTROY=on_destroy\n",
        EngineOptions::default(),
    );
    let lines: Vec<String> = std::iter::once("go".to_string())
        .chain((2..=20).map(|i| format!("line {i}")))
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    f.feed(&refs);
    assert_eq!(
        f.events(),
        vec!["on_timeout", "on_incomplete", "on_destroy"]
    );
    assert_eq!(f.live_count(), 0);
}

#[test]
fn timeout_after_pre_skips_incomplete() {
    let f = fixture(
        "[R]\nRULE_TIMEOUT=2\nPRE=^ready\nBEGIN=^go\n\
         ACTION.TIMEOUT=on_timeout\nACTION.INCOMPLETE=on_incomplete\nACTION.DESTROY=on_destroy\n",
        EngineOptions::default(),
    );
    f.feed(&["ready", "x", "y", "z"]);
    let events = f.events();
    assert_eq!(count(&events, "on_timeout"), 1);
    assert_eq!(count(&events, "on_incomplete"), 0);
    assert_eq!(count(&events, "on_destroy"), 1);
}

#[test]
fn match_timeout_requires_the_next_line() {
    let f = fixture(
        "[R]\nBEGIN=ABR\nMATCH_TIMEOUT=1\nEND=strict\n\
         ACTION.COMPLETE=on_complete\nACTION.MATCH_TIMEOUT=on_mt\nACTION.DESTROY=on_destroy\n",
        EngineOptions::default(),
    );
    f.feed(&["ABR one", "strict follows", "ABR two", "not it", "strict too late"]);
    let events = f.events();
    // First pair completes; the second instance dies when line 4 is not
    // strict, and line 5's strict no longer has an instance to finish.
    assert_eq!(count(&events, "on_complete"), 1);
    assert_eq!(count(&events, "on_mt"), 1);
    assert_eq!(count(&events, "on_destroy"), 2);
    assert_eq!(f.live_count(), 0);
}

#[test]
fn optional_extracts_and_refreshes_the_timeout_clock() {
    let f = fixture(
        "[R]\nRULE_TIMEOUT=3\nBEGIN=^A$\nEND=^Z$\nOPTIONAL=^opt $$O(\\w+)\n\
         ACTION.COMPLETE=on_complete\nACTION.TIMEOUT=on_timeout\n",
        EngineOptions::default(),
    );
    // Without the optional refreshing last-match, the rule would time out
    // at line 4; the opt lines keep it alive until Z.
    f.feed(&["A", "opt one", "opt two", "opt three", "opt four", "Z"]);
    let events = f.events();
    assert_eq!(count(&events, "on_complete"), 1);
    assert_eq!(count(&events, "on_timeout"), 0);
    assert_eq!(
        f.prev_vars("R")["O"],
        VarValue::Scalar("four".to_string())
    );
}

#[test]
fn optional_only_consulted_while_stalled_on_end() {
    let f = fixture(
        "[R]\nBEGIN=^A$\nBEGIN=^B$\nEND=^Z$\nOPTIONAL=^opt @@O(\\w+)\n\
         ACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    // "opt x" arrives while the instance still waits on the second BEGIN;
    // only "opt y" (seen while stalled on the END) may be collected.
    f.feed(&["A", "opt x", "B", "opt y", "Z"]);
    assert_eq!(count(&f.events(), "on_complete"), 1);
    assert_eq!(
        f.prev_vars("R")["O"],
        VarValue::List(vec!["y".to_string()])
    );
}

#[test]
fn code_clause_gates_candidate_creation() {
    let blocked = fixture(
        "[R]\nBEGIN_CODE=false\nACTION.CREATE=on_create\n",
        EngineOptions::default(),
    );
    blocked.feed(&["anything"]);
    assert_eq!(count(&blocked.events(), "on_create"), 0);

    let open = fixture(
        "[R]\nBEGIN_CODE=armed\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    open.feed(&["anything"]);
    assert_eq!(count(&open.events(), "on_complete"), 1);
}

#[test]
fn runtime_insert_matches_a_previously_captured_value() {
    let f = fixture(
        "[R]\nBEGIN=^user $$NAME(\\w+)\nEND=^bye $NAME$\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["user alice", "bye bob", "bye alice"]);
    assert_eq!(count(&f.events(), "on_complete"), 1);
    assert_eq!(f.state.borrow().prev["R"].stop_line, 3);
}

#[test]
fn eof_fires_incomplete_for_started_instances() {
    let f = fixture(
        "[R]\nBEGIN=^go\nEND=^never\nACTION.INCOMPLETE=on_incomplete\nACTION.DESTROY=on_destroy\n",
        EngineOptions::default(),
    );
    f.feed(&["go"]);
    f.engine.finish();
    assert_eq!(f.events(), vec!["on_incomplete", "on_destroy"]);
    assert_eq!(f.live_count(), 0);
}

#[test]
fn eof_skips_incomplete_for_pre_phase_candidates() {
    let f = fixture(
        "[R]\nPRE=^ready\nBEGIN=^go\nACTION.INCOMPLETE=on_incomplete\nACTION.DESTROY=on_destroy\n",
        EngineOptions::default(),
    );
    f.feed(&["ready"]);
    f.engine.finish();
    assert_eq!(f.events(), vec!["on_destroy"]);
}

#[test]
fn eof_fires_missing_for_never_matched_rules() {
    let f = fixture(
        "[A]\nBEGIN=^seen\nACTION.MISSING=a_missing\n[B]\nBEGIN=^unseen\nACTION.MISSING=b_missing\n",
        EngineOptions::default(),
    );
    f.feed(&["seen today"]);
    f.engine.finish();
    let events = f.events();
    assert_eq!(count(&events, "a_missing"), 0);
    assert_eq!(count(&events, "b_missing"), 1);
}

#[test]
fn disabled_rule_neither_matches_nor_reports_missing() {
    let f = fixture(
        "[R]\nENABLED=false\nBEGIN=^go\nACTION.CREATE=on_create\nACTION.MISSING=on_missing\n",
        EngineOptions::default(),
    );
    f.feed(&["go"]);
    f.engine.finish();
    assert!(f.events().is_empty());
}

#[test]
fn termination_code_runs_in_declaration_order() {
    let f = fixture(
        "[TERMINATION_CODE]\nFIRST=term_one\nSECOND=term_two\n[R]\nBEGIN=^x\n",
        EngineOptions::default(),
    );
    f.engine.finish();
    assert_eq!(f.events(), vec!["term_one", "term_two"]);
}

#[test]
fn reset_request_destroys_live_instances_with_their_handlers() {
    let f = fixture(
        "[NOISY]\nBEGIN=^N\nEND=^Z\nACTION.DESTROY=noisy_destroy\n\
         [KILLER]\nBEGIN=^K\nACTION.COMPLETE=reset:NOISY\n",
        EngineOptions::default(),
    );
    f.feed(&["N start", "K now"]);
    let events = f.events();
    assert_eq!(count(&events, "noisy_destroy"), 1);
    assert_eq!(f.live_count(), 0);
    // A reset is not a completion: no previous-instance snapshot.
    assert!(!f.state.borrow().prev.contains_key("NOISY"));
}

#[test]
fn stop_request_ends_the_run_after_the_current_line() {
    let f = fixture(
        "[R]\nBEGIN=^go\nACTION.COMPLETE=stop\n",
        EngineOptions::default(),
    );
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("x.log");
    std::fs::write(&path, "go\ngo\ngo\n").expect("write");
    let specs = vec![crate::input::LogSpec {
        source: crate::input::LogSource::File(path),
        forever: false,
    }];
    f.engine.run(&specs, 64).expect("run");
    // Only the first line is processed; MISSING does not apply.
    assert_eq!(count(&f.events(), "stop"), 1);
}

#[test]
fn failed_action_compile_disables_only_that_action() {
    let f = fixture(
        "[R]\nBEGIN=ABR\nACTION.CREATE=badcompile\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["ABR"]);
    assert_eq!(f.events(), vec!["on_complete"]);
}

#[test]
fn complete_binding_carries_line_span_and_vars() {
    let f = fixture(
        "[R]\nBEGIN=^open $$ID(\\d+)\nEND=^close\nACTION.COMPLETE=on_complete\n",
        EngineOptions::default(),
    );
    f.feed(&["open 7", "filler", "close it"]);
    let bindings = f.bindings.borrow();
    let b = bindings.last().expect("one invocation");
    assert_eq!(b.line_start, 1);
    assert_eq!(b.line_stop, 3);
    assert_eq!(b.line_lastread, "close it");
    assert_eq!(b.vars["ID"], VarValue::Scalar("7".to_string()));
    assert_eq!(b.line_range(), "1-3");
}

#[test]
fn two_rules_share_one_line_independently() {
    let f = fixture(
        "[A]\nBEGIN=ABR\nACTION.COMPLETE=a_done\n[B]\nBEGIN=ABR\nACTION.COMPLETE=b_done\n",
        EngineOptions::default(),
    );
    f.feed(&["ABR shared"]);
    let events = f.events();
    assert_eq!(count(&events, "a_done"), 1);
    assert_eq!(count(&events, "b_done"), 1);
}
