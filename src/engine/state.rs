//! Mutable engine state shared between the matching loop and the action
//! host builtins.
//!
//! The loop and the builtins both reach this through `Rc<RefCell<...>>`;
//! the loop never holds a borrow across a host invocation, so builtin
//! closures can borrow freely while user code runs.

use std::collections::{HashMap, HashSet};

use crate::buffer::OutputBuffer;
use crate::host::VarTable;
use crate::user_opts::UserOpts;

use super::instance::{PrevInstance, RuleInstance};

/// Whose variables an executing action binds and mutates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ActionCtx {
    #[default]
    None,
    /// A live instance, by id.
    Instance(u64),
    /// The candidate walk for a rule that has no instance yet; extractions
    /// and imports land in `scratch`.
    Walk(String),
}

#[derive(Debug, Default)]
pub struct EngineState {
    pub line_id: u64,
    pub current_file: String,
    pub current_text: String,

    /// Live instances in creation order.
    pub live: Vec<RuleInstance>,
    next_id: u64,

    /// Last completed instance per rule (upper-cased name).
    pub prev: HashMap<String, PrevInstance>,
    /// Rules that ever created an instance (or fast-completed).
    pub found: HashSet<String>,
    /// Rule names, index-aligned with the compiled rule set.
    pub rule_names: Vec<String>,

    pub ctx: ActionCtx,
    /// Capture table for the candidate walk currently in progress.
    pub scratch: VarTable,

    /// Rule names whose instances a builtin asked to reset; drained by the
    /// engine after the requesting invocation returns.
    pub pending_resets: Vec<String>,
    pub stop_requested: bool,

    pub user_opts: UserOpts,
    pub buffer: OutputBuffer,
}

impl EngineState {
    pub fn new(user_opts: UserOpts) -> Self {
        Self {
            user_opts,
            ..Self::default()
        }
    }

    pub fn next_instance_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn instance(&self, id: u64) -> Option<&RuleInstance> {
        self.live.iter().find(|i| i.id == id)
    }

    pub fn instance_mut(&mut self, id: u64) -> Option<&mut RuleInstance> {
        self.live.iter_mut().find(|i| i.id == id)
    }

    pub fn remove_instance(&mut self, id: u64) -> Option<RuleInstance> {
        let pos = self.live.iter().position(|i| i.id == id)?;
        Some(self.live.remove(pos))
    }

    /// Ids of all live instances of the named rule, in creation order.
    pub fn live_ids_of(&self, rule_name: &str) -> Vec<u64> {
        let Some(rule) = self.rule_index(rule_name) else {
            return Vec::new();
        };
        self.live
            .iter()
            .filter(|i| i.rule == rule)
            .map(|i| i.id)
            .collect()
    }

    pub fn rule_index(&self, name: &str) -> Option<usize> {
        let upper = name.to_uppercase();
        self.rule_names.iter().position(|n| *n == upper)
    }

    /// Rule name of the currently executing action's controller.
    pub fn controller_rule(&self) -> Option<String> {
        match &self.ctx {
            ActionCtx::None => None,
            ActionCtx::Instance(id) => {
                let inst = self.instance(*id)?;
                self.rule_names.get(inst.rule).cloned()
            }
            ActionCtx::Walk(rule) => Some(rule.clone()),
        }
    }

    pub fn request_reset(&mut self, rule_name: &str) {
        self.pending_resets.push(rule_name.to_uppercase());
    }

    pub fn take_pending_resets(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_resets)
    }
}
