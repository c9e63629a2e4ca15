pub mod callins;
pub mod callouts;
pub mod cli;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod dispatch;
pub mod events;
pub mod guard;
pub mod harness;
pub mod host;
pub mod marshal;
pub mod registry;
pub mod rules;

pub use callins::CallIn;
pub use dispatch::{CallDispatcher, CallOutcome, CallStatus};
pub use rules::{RulesHandler, RulesSlot, RulesSources};
