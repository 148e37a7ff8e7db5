//! Clause text resolution.
//!
//! Expands `$NAME` / `${NAME}` macro and variable references, registers
//! `$$NAME(...)` / `@@NAME(...)` runtime extracts against capture-group
//! ordinals, and records runtime inserts for references to runtime
//! variables. The expansion threads a pure accumulator through recursion:
//! `(text, open_parens, inserts, extracts)`, so ordinals stay accurate
//! across nested macro substitution.

use std::collections::{HashMap, HashSet};

use super::types::{RuleVar, RuntimeExtract, RuntimeInsert};

/// Macro table: upper-cased name to raw replacement text.
pub type MacroTable = HashMap<String, String>;

/// Result of resolving one clause text.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Resolved {
    pub text: String,
    pub open_parens: usize,
    pub inserts: Vec<RuntimeInsert>,
    pub extracts: Vec<RuntimeExtract>,
}

/// Resolve one clause. `vars` is the owning rule's variable table; `$$` and
/// `@@` declarations are added to it as a side effect.
pub fn resolve_clause(
    raw: &str,
    macros: &MacroTable,
    vars: &mut HashMap<String, RuleVar>,
) -> Result<Resolved, String> {
    let mut in_progress = HashSet::new();
    expand(raw, 0, macros, vars, &mut in_progress)
}

fn expand(
    input: &str,
    base_parens: usize,
    macros: &MacroTable,
    vars: &mut HashMap<String, RuleVar>,
    in_progress: &mut HashSet<String>,
) -> Result<Resolved, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut parens = base_parens;
    let mut inserts = Vec::new();
    let mut extracts = Vec::new();
    let mut backslashes = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            backslashes += 1;
            out.push(c);
            i += 1;
            continue;
        }
        let escaped = backslashes % 2 == 1;
        backslashes = 0;
        if escaped {
            // Odd backslash count: the character is literal, and an
            // escaped `(` does not count toward capture ordinals.
            out.push(c);
            i += 1;
            continue;
        }

        match c {
            '(' => {
                parens += 1;
                out.push(c);
                i += 1;
            }
            '$' if chars.get(i + 1) == Some(&'$') => {
                let (name, next) = scan_name(&chars, i + 2);
                register_extract(&name, next, &chars, false, parens, vars, &mut extracts)?;
                i = next;
            }
            '@' if chars.get(i + 1) == Some(&'@') => {
                let (name, next) = scan_name(&chars, i + 2);
                register_extract(&name, next, &chars, true, parens, vars, &mut extracts)?;
                i = next;
            }
            '$' => {
                let (name, next) = scan_reference(&chars, i)?;
                let Some(name) = name else {
                    // A `$` with no name is kept literal: mid-text it is
                    // whatever the regex engine makes of it, at end of
                    // text it is the usual anchor.
                    out.push('$');
                    i = next;
                    continue;
                };
                substitute(
                    &name,
                    macros,
                    vars,
                    in_progress,
                    &mut out,
                    &mut parens,
                    &mut inserts,
                    &mut extracts,
                )?;
                i = next;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(Resolved {
        text: out,
        open_parens: parens,
        inserts,
        extracts,
    })
}

/// Scan an identifier (`[A-Za-z0-9_]+`) starting at `from`; returns the
/// upper-cased name and the index past it.
fn scan_name(chars: &[char], from: usize) -> (String, usize) {
    let mut name = String::new();
    let mut i = from;
    while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
        name.push(chars[i].to_ascii_uppercase());
        i += 1;
    }
    (name, i)
}

/// Scan a `$NAME` or `${NAME}` reference at `at` (which holds the `$`).
/// Returns `(None, index)` when the `$` carries no name.
fn scan_reference(chars: &[char], at: usize) -> Result<(Option<String>, usize), String> {
    if chars.get(at + 1) == Some(&'{') {
        let (name, next) = scan_name(chars, at + 2);
        if chars.get(next) != Some(&'}') {
            return Err(format!("unterminated ${{...}} reference at offset {at}"));
        }
        if name.is_empty() {
            return Err(format!("empty ${{}} reference at offset {at}"));
        }
        return Ok((Some(name), next + 1));
    }
    let (name, next) = scan_name(chars, at + 1);
    if name.is_empty() {
        return Ok((None, at + 1));
    }
    Ok((Some(name), next))
}

/// Register a `$$NAME(...)` / `@@NAME(...)` runtime extract. The ordinal is
/// the open-paren count plus one: the `(` that must follow becomes exactly
/// that capture group. The paren itself is left for the main loop.
fn register_extract(
    name: &str,
    next: usize,
    chars: &[char],
    is_list: bool,
    parens: usize,
    vars: &mut HashMap<String, RuleVar>,
    extracts: &mut Vec<RuntimeExtract>,
) -> Result<(), String> {
    let sigil = if is_list { "@@" } else { "$$" };
    if name.is_empty() {
        return Err(format!("{sigil} with no variable name"));
    }
    if chars.get(next) != Some(&'(') {
        return Err(format!("{sigil}{name} must be followed by a capture group"));
    }
    let group = parens + 1;
    match vars.get_mut(name) {
        None => {
            vars.insert(
                name.to_string(),
                RuleVar {
                    name: name.to_string(),
                    runtime: true,
                    is_list,
                    value: None,
                    group: Some(group),
                },
            );
        }
        // Re-extracting a variable declared `<RTVAR>` binds its group;
        // anything else is a collision within the rule.
        Some(var) if var.runtime && var.group.is_none() => {
            var.is_list = is_list;
            var.group = Some(group);
        }
        Some(_) => {
            return Err(format!("duplicate variable '{name}'"));
        }
    }
    extracts.push(RuntimeExtract {
        name: name.to_string(),
        group,
        is_list,
    });
    Ok(())
}

/// Substitute one `$NAME` reference: macro or compile-time variable text is
/// expanded recursively (adding to the paren count); a runtime variable
/// becomes a placeholder plus a runtime-insert record.
#[allow(clippy::too_many_arguments)]
fn substitute(
    name: &str,
    macros: &MacroTable,
    vars: &mut HashMap<String, RuleVar>,
    in_progress: &mut HashSet<String>,
    out: &mut String,
    parens: &mut usize,
    inserts: &mut Vec<RuntimeInsert>,
    extracts: &mut Vec<RuntimeExtract>,
) -> Result<(), String> {
    if let Some(var) = vars.get(name) {
        if var.runtime {
            inserts.push(RuntimeInsert {
                name: name.to_string(),
                offset: out.len(),
                len: name.len(),
            });
            out.push_str(name);
            return Ok(());
        }
    }

    let replacement = vars
        .get(name)
        .and_then(|v| v.value.clone())
        .or_else(|| macros.get(name).cloned());
    let Some(replacement) = replacement else {
        return Err(format!("undefined macro or variable '{name}'"));
    };

    if !in_progress.insert(name.to_string()) {
        return Err(format!("circular reference through '{name}'"));
    }
    let inner = expand(&replacement, *parens, macros, vars, in_progress)?;
    in_progress.remove(name);

    let base = out.len();
    for mut ins in inner.inserts {
        ins.offset += base;
        inserts.push(ins);
    }
    extracts.extend(inner.extracts);
    out.push_str(&inner.text);
    *parens = inner.open_parens;
    Ok(())
}
