//! Rule compiler.
//!
//! Classifies loaded sections (`DEFINE_MACRO`, `SHARED_CODE`,
//! `TERMINATION_CODE`, everything else is a rule), parses entries into
//! typed fields, resolves every match clause through [`resolve`], and
//! validates the result. Problems go to the shared diagnostics list so one
//! run surfaces every script error.

pub mod resolve;
pub mod types;

use std::collections::{BTreeMap, HashMap};

use crate::script::{Diagnostics, Entry, ScriptSet, Section};

use resolve::MacroTable;
use types::{
    Action, ActionKind, ClauseBody, ClauseKind, MatchClause, OptionalClause, Rule, RuleSet,
    RuleVar, CodeEntry,
};

const MACRO_SECTION: &str = "DEFINE_MACRO";
const SHARED_SECTION: &str = "SHARED_CODE";
const TERMINATION_SECTION: &str = "TERMINATION_CODE";

/// Regex flag characters accepted by `REGEX_OPTIONS`.
const REGEX_FLAGS: &str = "imsxU";

/// Compile every section of a loaded script set.
pub fn compile(set: &ScriptSet, diags: &mut Diagnostics) -> RuleSet {
    let macros = collect_macros(set, diags);

    let mut out = RuleSet::default();
    for section in &set.sections {
        match section.name.as_str() {
            MACRO_SECTION => {}
            SHARED_SECTION => collect_code(section, &mut out.shared_code),
            TERMINATION_SECTION => collect_code(section, &mut out.termination_code),
            _ => compile_rule(section, &macros, &mut out, diags),
        }
    }
    out
}

fn collect_macros(set: &ScriptSet, diags: &mut Diagnostics) -> MacroTable {
    let mut macros = MacroTable::new();
    for section in set.sections.iter().filter(|s| s.name == MACRO_SECTION) {
        for entry in &section.entries {
            if macros.contains_key(&entry.key) {
                diags.error(
                    entry.loc.clone(),
                    format!("duplicate macro '{}'", entry.key),
                );
                continue;
            }
            macros.insert(entry.key.clone(), entry.value.clone());
        }
    }
    macros
}

fn collect_code(section: &Section, out: &mut Vec<CodeEntry>) {
    for entry in &section.entries {
        out.push(CodeEntry {
            name: entry.key.clone(),
            source: entry.value.clone(),
            callable: None,
            loc: entry.loc.clone(),
        });
    }
}

/// Per-rule modifier state threaded through entry processing: regex options
/// persist until reset, a match timeout applies to the next clause only.
#[derive(Default)]
struct Modifiers {
    regex_opts: String,
    next_match_timeout: Option<u64>,
}

fn compile_rule(section: &Section, macros: &MacroTable, out: &mut RuleSet, diags: &mut Diagnostics) {
    let name = section.name.clone();
    if out.by_name.contains_key(&name) {
        diags.error(section.loc.clone(), format!("duplicate rule '{name}'"));
        return;
    }

    let mut rule = Rule {
        name: name.clone(),
        enabled: true,
        clauses: Vec::new(),
        optionals: Vec::new(),
        vars: HashMap::new(),
        actions: BTreeMap::new(),
        rule_timeout: 0,
        loc: section.loc.clone(),
    };
    let mut mods = Modifiers::default();

    for entry in &section.entries {
        compile_entry(entry, macros, &mut rule, &mut mods, diags);
    }

    validate_rule(&rule, diags);

    if !rule.clauses.iter().any(|c| c.kind == ClauseKind::Begin) {
        diags.warn(format!(
            "rule '{name}' has no BEGIN clause and was dropped ({})",
            section.loc
        ));
        return;
    }

    out.by_name.insert(name, out.rules.len());
    out.rules.push(rule);
}

fn compile_entry(
    entry: &Entry,
    macros: &MacroTable,
    rule: &mut Rule,
    mods: &mut Modifiers,
    diags: &mut Diagnostics,
) {
    let key = entry.key.as_str();

    if let Some((kind, accum, code)) = parse_clause_key(key) {
        add_clause(entry, kind, accum, code, macros, rule, mods, diags);
        return;
    }
    if key == "OPTIONAL" || key == "OPTIONAL_MATCH" {
        add_optional(entry, macros, rule, mods, diags);
        return;
    }
    if key == "OPTIONAL_CODE" || key == "OPTIONAL_ACCUM" || key == "OPTIONAL_MATCH_CODE"
        || key == "OPTIONAL_MATCH_ACCUM"
    {
        diags.rule_error(
            entry.loc.clone(),
            &rule.name,
            format!("'{key}' is not allowed (OPTIONAL takes a plain regex)"),
        );
        return;
    }
    if let Some(kind_key) = key.strip_prefix("ACTION.") {
        add_action(entry, kind_key, rule, diags);
        return;
    }

    match key {
        "ENABLED" => match parse_bool(&entry.value) {
            Some(v) => rule.enabled = v,
            None => diags.rule_error(
                entry.loc.clone(),
                &rule.name,
                format!("bad boolean '{}' for ENABLED", entry.value),
            ),
        },
        "TIMEOUT" | "RULE_TIMEOUT" => match parse_timeout(&entry.value) {
            Some(v) => rule.rule_timeout = v,
            None => diags.rule_error(
                entry.loc.clone(),
                &rule.name,
                format!("bad timeout value '{}'", entry.value),
            ),
        },
        "MATCH_TIMEOUT" => match parse_timeout(&entry.value) {
            Some(v) => mods.next_match_timeout = Some(v),
            None => diags.rule_error(
                entry.loc.clone(),
                &rule.name,
                format!("bad timeout value '{}'", entry.value),
            ),
        },
        "MATCH_NEXT_LINE" => match parse_bool(&entry.value) {
            Some(true) => mods.next_match_timeout = Some(1),
            Some(false) => mods.next_match_timeout = None,
            None => diags.rule_error(
                entry.loc.clone(),
                &rule.name,
                format!("bad boolean '{}' for MATCH_NEXT_LINE", entry.value),
            ),
        },
        "REGEX_OPTIONS" => {
            let value = entry.value.trim();
            if value.chars().all(|c| REGEX_FLAGS.contains(c)) {
                mods.regex_opts = value.to_string();
            } else {
                diags.rule_error(
                    entry.loc.clone(),
                    &rule.name,
                    format!("bad REGEX_OPTIONS '{value}' (allowed: {REGEX_FLAGS})"),
                );
            }
        }
        _ => add_variable(entry, rule, diags),
    }
}

/// Parse `PRE/BEGIN/END[_MATCH][_ACCUM|_CODE]` keys.
fn parse_clause_key(key: &str) -> Option<(ClauseKind, bool, bool)> {
    let (head, kind) = if let Some(rest) = key.strip_prefix("PRE") {
        (rest, ClauseKind::Pre)
    } else if let Some(rest) = key.strip_prefix("BEGIN") {
        (rest, ClauseKind::Begin)
    } else if let Some(rest) = key.strip_prefix("END") {
        (rest, ClauseKind::End)
    } else {
        return None;
    };
    let tail = head.strip_prefix("_MATCH").unwrap_or(head);
    match tail {
        "" => Some((kind, false, false)),
        "_ACCUM" => Some((kind, true, false)),
        "_CODE" => Some((kind, false, true)),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn add_clause(
    entry: &Entry,
    kind: ClauseKind,
    accum: bool,
    code: bool,
    macros: &MacroTable,
    rule: &mut Rule,
    mods: &mut Modifiers,
    diags: &mut Diagnostics,
) {
    let idx = rule.clauses.len();
    let label = format!("{}[{idx}]", kind.label());
    let match_timeout = mods.next_match_timeout.take().unwrap_or(0);

    let clause = if code {
        MatchClause {
            kind,
            accum,
            raw: entry.value.clone(),
            regex_opts: mods.regex_opts.clone(),
            body: ClauseBody::Code {
                source: entry.value.clone(),
                callable: None,
            },
            inserts: Vec::new(),
            extracts: Vec::new(),
            match_timeout,
            loc: entry.loc.clone(),
        }
    } else {
        match resolve::resolve_clause(&entry.value, macros, &mut rule.vars) {
            Ok(resolved) => MatchClause {
                kind,
                accum,
                raw: entry.value.clone(),
                regex_opts: mods.regex_opts.clone(),
                body: ClauseBody::Regex {
                    text: resolved.text,
                    cache: None,
                },
                inserts: resolved.inserts,
                extracts: resolved.extracts,
                match_timeout,
                loc: entry.loc.clone(),
            },
            Err(msg) => {
                diags.clause_error(entry.loc.clone(), &rule.name, &label, msg);
                return;
            }
        }
    };
    rule.clauses.push(clause);
}

fn add_optional(
    entry: &Entry,
    macros: &MacroTable,
    rule: &mut Rule,
    mods: &Modifiers,
    diags: &mut Diagnostics,
) {
    let label = format!("OPTIONAL[{}]", rule.optionals.len());
    match resolve::resolve_clause(&entry.value, macros, &mut rule.vars) {
        Ok(resolved) => rule.optionals.push(OptionalClause {
            text: resolved.text,
            regex_opts: mods.regex_opts.clone(),
            cache: None,
            inserts: resolved.inserts,
            extracts: resolved.extracts,
            loc: entry.loc.clone(),
        }),
        Err(msg) => diags.clause_error(entry.loc.clone(), &rule.name, &label, msg),
    }
}

fn add_action(entry: &Entry, kind_key: &str, rule: &mut Rule, diags: &mut Diagnostics) {
    let Some(kind) = ActionKind::from_key(kind_key) else {
        diags.rule_error(
            entry.loc.clone(),
            &rule.name,
            format!("unknown action kind '{kind_key}'"),
        );
        return;
    };
    if rule.actions.contains_key(&kind) {
        diags.rule_error(
            entry.loc.clone(),
            &rule.name,
            format!("duplicate ACTION.{}", kind.label()),
        );
        return;
    }
    rule.actions.insert(
        kind,
        Action {
            source: entry.value.clone(),
            callable: None,
            loc: entry.loc.clone(),
        },
    );
}

fn add_variable(entry: &Entry, rule: &mut Rule, diags: &mut Diagnostics) {
    if rule.vars.contains_key(&entry.key) {
        diags.rule_error(
            entry.loc.clone(),
            &rule.name,
            format!("duplicate variable '{}'", entry.key),
        );
        return;
    }
    let runtime = entry.value.trim().eq_ignore_ascii_case("<RTVAR>");
    rule.vars.insert(
        entry.key.clone(),
        RuleVar {
            name: entry.key.clone(),
            runtime,
            is_list: false,
            value: if runtime { None } else { Some(entry.value.clone()) },
            group: None,
        },
    );
}

fn validate_rule(rule: &Rule, diags: &mut Diagnostics) {
    // An ACCUM clause may not open the PRE region or the BEGIN region:
    // accumulation needs a concrete starting match before it.
    let first_pre = rule.clauses.iter().find(|c| c.kind == ClauseKind::Pre);
    if let Some(c) = first_pre {
        if c.accum {
            diags.clause_error(
                c.loc.clone(),
                &rule.name,
                "PRE[0]",
                "the first PRE clause may not be an ACCUM",
            );
        }
    }
    let first_begin = rule.clauses.iter().find(|c| c.kind == ClauseKind::Begin);
    if let Some(c) = first_begin {
        if c.accum {
            diags.clause_error(
                c.loc.clone(),
                &rule.name,
                "BEGIN[0]",
                "the first BEGIN clause may not be an ACCUM",
            );
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_uppercase().as_str() {
        "TRUE" | "YES" | "ON" | "1" => Some(true),
        "FALSE" | "NO" | "OFF" | "0" => Some(false),
        _ => None,
    }
}

/// `n` or `DEFAULT` (= disabled).
fn parse_timeout(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("DEFAULT") {
        return Some(0);
    }
    value.parse().ok()
}
