//! Luau action host.
//!
//! One persistent VM runs every action body, code clause, and shared or
//! termination entry, so user state (counters, tables) carries across
//! invocations. Sources compile expression-first — `return <src>` when
//! that parses, the raw chunk otherwise — so both `COUNT = COUNT + 1` and
//! `LOGENGINE_COMPARE_RULES('A','B')` do what they look like. Luau's
//! default sandbox applies: `os`, `io`, and `package` are absent; file
//! output goes through the `WRITE_*` builtins instead. Every invocation
//! runs under [`SandboxLimits`] — a runaway action errors out instead of
//! hanging the single-threaded matching loop.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context as _;
use mlua::{Lua, Value, Variadic};

use crate::buffer;
use crate::compile::types::CallableId;
use crate::engine::state::EngineState;
use crate::host::{ActionHost, Binding, VarValue};

/// Default instruction budget per invocation (1 million instructions).
const DEFAULT_INSTRUCTION_LIMIT: u32 = 1_000_000;

/// Default memory limit for the VM (16 MB).
const DEFAULT_MEMORY_LIMIT: usize = 16 * 1024 * 1024;

/// Execution limits for user code.
///
/// The instruction budget applies per invocation (the counter resets
/// before each call); the memory limit bounds the whole VM, including
/// state user code keeps between invocations.
pub struct SandboxLimits {
    /// Maximum number of Luau instructions one invocation may execute.
    pub instruction_limit: u32,
    /// Maximum memory in bytes the Luau VM may allocate.
    pub memory_limit: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            instruction_limit: DEFAULT_INSTRUCTION_LIMIT,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

pub struct LuaHost {
    lua: Lua,
    fns: RefCell<Vec<mlua::Function>>,
    /// Interrupt callbacks seen during the current invocation; shared
    /// with the VM's interrupt handler.
    interrupts: Arc<AtomicU32>,
}

impl LuaHost {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_limits(&SandboxLimits::default())
    }

    pub fn with_limits(limits: &SandboxLimits) -> anyhow::Result<Self> {
        let lua = Lua::new();

        // Memory limit (returns the previous limit, which we discard).
        let _ = lua.set_memory_limit(limits.memory_limit);

        // The interrupt handler runs synchronously on the VM's single
        // thread, so Relaxed ordering is safe. Yielding outside a
        // coroutine surfaces as a runtime error, which the engine
        // reports and survives.
        let counter = Arc::new(AtomicU32::new(0));
        let handler_counter = Arc::clone(&counter);
        let instruction_limit = limits.instruction_limit;
        lua.set_interrupt(move |_lua| {
            // Luau fires the interrupt roughly every ~1000 VM
            // instructions; saturating_mul caps at u32::MAX, so overflow
            // cannot bypass the check.
            let calls = handler_counter.fetch_add(1, Ordering::Relaxed);
            if calls.saturating_mul(1000) >= instruction_limit {
                return Ok(mlua::VmState::Yield);
            }
            Ok(mlua::VmState::Continue)
        });

        Ok(Self {
            lua,
            fns: RefCell::new(Vec::new()),
            interrupts: counter,
        })
    }

    /// Give the next invocation a fresh instruction budget.
    fn reset_budget(&self) {
        self.interrupts.store(0, Ordering::Relaxed);
    }

    /// Register the `LOGENGINE_*` and `WRITE_*` builtins against the
    /// engine state. Builtins only read and queue against the shared
    /// state; the engine applies queued mutations (resets, stop) after
    /// the invocation returns.
    #[allow(clippy::too_many_lines)]
    pub fn install_builtins(&self, state: Rc<RefCell<EngineState>>) -> anyhow::Result<()> {
        let globals = self.lua.globals();

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_GET_USER_OPT",
            self.lua
                .create_function(move |lua, name: String| match st.borrow().get_user_opt(&name) {
                    Some(values) => {
                        let t = lua.create_table()?;
                        for (i, v) in values.iter().enumerate() {
                            t.set(i + 1, v.as_str())?;
                        }
                        Ok(Value::Table(t))
                    }
                    None => Ok(Value::Nil),
                })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_RESET_RULE_INSTANCES",
            self.lua.create_function(move |_, name: String| {
                st.borrow_mut().request_reset(&name);
                Ok(true)
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_HAS_RULE_EVER_MATCHED",
            self.lua
                .create_function(move |_, name: String| Ok(st.borrow().has_rule_ever_matched(&name)))?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_GET_LAST_RULE_INST",
            self.lua.create_function(move |lua, name: String| {
                let state = st.borrow();
                let Some(prev) = state.last_rule_inst(&name) else {
                    return Ok(Value::Nil);
                };
                let t = lua.create_table()?;
                for (var, value) in &prev.vars {
                    match value {
                        VarValue::Scalar(s) => t.set(var.as_str(), s.as_str())?,
                        VarValue::List(items) => {
                            let list = lua.create_table()?;
                            for (i, item) in items.iter().enumerate() {
                                list.set(i + 1, item.as_str())?;
                            }
                            t.set(var.as_str(), list)?;
                        }
                    }
                }
                t.set("NAME", name.to_uppercase())?;
                t.set("STARTLINE", prev.start_line)?;
                t.set("STOPLINE", prev.stop_line)?;
                Ok(Value::Table(t))
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_COMPARE_RULES",
            self.lua.create_function(move |_, names: Variadic<String>| {
                Ok(st.borrow_mut().compare_rules(&names))
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_IMPORT_INST_VARS",
            self.lua
                .create_function(move |_, name: String| Ok(st.borrow_mut().import_inst_vars(&name)))?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_COMPARE_RULES_AND_IMPORT",
            self.lua.create_function(move |_, names: Variadic<String>| {
                Ok(st.borrow_mut().compare_rules_and_import(&names))
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "LOGENGINE_PROCESSING_COMPLETE",
            self.lua.create_function(move |_, ()| {
                st.borrow_mut().stop_requested = true;
                Ok(true)
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "WRITE_TO_BUFFER",
            self.lua.create_function(move |_, text: String| {
                st.borrow_mut().buffer.write(&text);
                Ok(())
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "CLEAR_BUFFER",
            self.lua.create_function(move |_, ()| {
                st.borrow_mut().buffer.clear();
                Ok(())
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "WRITE_BUFFER_TO_STDOUT",
            self.lua.create_function(move |_, ()| {
                st.borrow().buffer.to_stdout();
                Ok(())
            })?,
        )?;

        let st = Rc::clone(&state);
        globals.set(
            "WRITE_BUFFER_TO_FILES",
            self.lua.create_function(move |_, paths: Variadic<String>| {
                match st.borrow().buffer.to_files(&paths) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        eprintln!("[logengine] WRITE_BUFFER_TO_FILES: {e:#}");
                        Ok(false)
                    }
                }
            })?,
        )?;

        globals.set(
            "WRITE_LIST_TO_STDOUT",
            self.lua.create_function(|_, list: mlua::Table| {
                let items = table_to_list(&list)?;
                buffer::list_to_stdout(&items);
                Ok(())
            })?,
        )?;

        globals.set(
            "WRITE_LIST_TO_FILES",
            self.lua
                .create_function(|_, (list, paths): (mlua::Table, Variadic<String>)| {
                    let items = table_to_list(&list)?;
                    match buffer::list_to_files(&items, &paths) {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            eprintln!("[logengine] WRITE_LIST_TO_FILES: {e:#}");
                            Ok(false)
                        }
                    }
                })?,
        )?;

        globals.set(
            "XLAT_AR_TO_STRING",
            self.lua
                .create_function(|_, (list, sep): (mlua::Table, Option<String>)| {
                    let items = table_to_list(&list)?;
                    Ok(buffer::xlat_list_to_string(&items, sep.as_deref().unwrap_or("\n")))
                })?,
        )?;

        Ok(())
    }
}

fn table_to_list(table: &mlua::Table) -> mlua::Result<Vec<String>> {
    table.clone().sequence_values::<String>().collect()
}

impl ActionHost for LuaHost {
    fn compile(&self, name: &str, source: &str) -> anyhow::Result<CallableId> {
        // Expression-first: a body like `LOGENGINE_COMPARE_RULES('A')`
        // yields its value; statement bodies fall back to a raw chunk.
        let func = self
            .lua
            .load(format!("return {source}"))
            .set_name(name)
            .into_function()
            .or_else(|_| self.lua.load(source).set_name(name).into_function())
            .with_context(|| format!("cannot compile '{name}'"))?;
        let mut fns = self.fns.borrow_mut();
        fns.push(func);
        Ok(fns.len() - 1)
    }

    fn invoke(&self, id: CallableId, binding: &Binding) -> anyhow::Result<bool> {
        let func = self
            .fns
            .borrow()
            .get(id)
            .cloned()
            .with_context(|| format!("unknown callable #{id}"))?;

        self.reset_budget();
        let globals = self.lua.globals();
        for (name, value) in &binding.vars {
            match value {
                VarValue::Scalar(s) => globals.set(name.as_str(), s.as_str())?,
                VarValue::List(items) => {
                    let t = self.lua.create_table()?;
                    for (i, item) in items.iter().enumerate() {
                        t.set(i + 1, item.as_str())?;
                    }
                    globals.set(name.as_str(), t)?;
                }
            }
        }
        globals.set("LINENUMBER_START", binding.line_start)?;
        globals.set("LINENUMBER_STOP", binding.line_stop)?;
        globals.set("LINENUMBER_RANGE", binding.line_range())?;
        globals.set("LINE_LASTREAD", binding.line_lastread.as_str())?;

        let value: Value = func.call(())?;
        Ok(!matches!(value, Value::Nil | Value::Boolean(false)))
    }

    fn declare_global(&self, name: &str, initializer: &str) -> anyhow::Result<()> {
        self.reset_budget();
        let value: Value = self
            .lua
            .load(format!("return {initializer}"))
            .set_name(name)
            .eval()
            .or_else(|_| self.lua.load(initializer).set_name(name).eval())
            .with_context(|| format!("cannot evaluate initializer for '{name}'"))?;
        self.lua
            .globals()
            .set(name, value)
            .with_context(|| format!("cannot declare global '{name}'"))
    }
}
