//! logengine — streaming log-analysis engine.
//!
//! Declarative multi-line rules (preconditions, beginnings, accumulators,
//! optional side-matches, terminations) with embedded Luau actions, run
//! over one or more log files line by line.

pub mod buffer;
pub mod cache;
pub mod compile;
pub mod engine;
pub mod host;
pub mod input;
pub mod script;
pub mod user_opts;

pub use cache::RegexCache;
pub use engine::state::EngineState;
pub use engine::{Engine, EngineOptions};
pub use host::lua::LuaHost;
pub use host::ActionHost;
