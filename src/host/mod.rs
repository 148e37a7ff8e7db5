//! Action host boundary.
//!
//! User code — lifecycle action bodies, `*_CODE` clauses, shared and
//! termination code — is opaque to the matching runtime. The engine only
//! compiles sources into callables, invokes them with a variable binding,
//! and reads back a truth value. [`LuaHost`](lua::LuaHost) is the
//! production implementation; tests drive the engine with a recording
//! host instead.

pub mod lua;

use std::collections::HashMap;

use serde::Serialize;

use crate::compile::types::CallableId;

/// A runtime variable value: scalar (`$$NAME`, overwritten per match) or
/// an ordered list (`@@NAME`, appended per match).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VarValue {
    Scalar(String),
    List(Vec<String>),
}

impl VarValue {
    /// The value as one string: a scalar as-is, a list's last element.
    pub fn as_scalar(&self) -> &str {
        match self {
            Self::Scalar(s) => s,
            Self::List(items) => items.last().map_or("", String::as_str),
        }
    }
}

/// Ordered variable table for one instance or creation walk.
pub type VarTable = HashMap<String, VarValue>;

/// Bind one extracted value: list variables append, scalars overwrite.
pub fn bind_var(table: &mut VarTable, name: &str, value: String, is_list: bool) {
    if is_list {
        if let Some(VarValue::List(items)) = table.get_mut(name) {
            items.push(value);
            return;
        }
        table.insert(name.to_string(), VarValue::List(vec![value]));
    } else {
        table.insert(name.to_string(), VarValue::Scalar(value));
    }
}

/// Everything an invocation sees: the owning instance's variables plus the
/// ambient line-number fields and the line-read context.
#[derive(Debug, Clone, Default)]
pub struct Binding {
    pub vars: VarTable,
    pub line_start: u64,
    pub line_stop: u64,
    pub line_lastread: String,
}

impl Binding {
    /// `LINENUMBER_RANGE` as user code sees it.
    pub fn line_range(&self) -> String {
        format!("{}-{}", self.line_start, self.line_stop)
    }
}

/// The two-operation boundary the matching runtime depends on, plus global
/// declaration for shared/termination code.
pub trait ActionHost {
    /// Compile `source` once; `name` is used in host error messages.
    fn compile(&self, name: &str, source: &str) -> anyhow::Result<CallableId>;

    /// Run a compiled callable under `binding`. The result is the truth
    /// value of the invocation (used by code clauses).
    fn invoke(&self, id: CallableId, binding: &Binding) -> anyhow::Result<bool>;

    /// Declare a global for a shared-code entry, evaluating `initializer`.
    fn declare_global(&self, name: &str, initializer: &str) -> anyhow::Result<()>;
}
