//! Per-context cache of which call-ins the loaded script implements.
//!
//! The same table type serves both context tags; the context role decides
//! which catalogue entries may ever be flagged present. Entries are only
//! recomputed at load time and on explicit redefinition signals, never lazily
//! in the middle of an invocation.

use std::collections::BTreeMap;

use crate::callins::CallIn;
use crate::context::{ContextRole, ScriptContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceFlags {
    role: ContextRole,
    /// Declared parameter count per catalogue call-in; `None` when undefined.
    bound: [Option<usize>; CallIn::COUNT],
    /// Names outside the catalogue, tracked by the base handler.
    other: BTreeMap<String, bool>,
}

impl PresenceFlags {
    pub fn new(role: ContextRole) -> Self {
        Self { role, bound: [None; CallIn::COUNT], other: BTreeMap::new() }
    }

    pub fn is_defined(&self, call_in: CallIn) -> bool {
        self.bound[call_in.index()].is_some()
    }

    pub fn params(&self, call_in: CallIn) -> Option<usize> {
        self.bound[call_in.index()]
    }

    /// Presence recorded by the base handler for a name outside the catalogue.
    pub fn other(&self, name: &str) -> Option<bool> {
        self.other.get(name).copied()
    }

    pub fn defined(&self) -> impl Iterator<Item = CallIn> + '_ {
        CallIn::ALL.into_iter().filter(|call_in| self.is_defined(*call_in))
    }

    pub(crate) fn refresh_all(&mut self, mut lookup: impl FnMut(&str) -> Option<usize>) {
        for call_in in CallIn::ALL {
            self.bound[call_in.index()] =
                if self.role.allows(call_in.descriptor().affinity) { lookup(call_in.name()) } else { None };
        }
        let names: Vec<String> = self.other.keys().cloned().collect();
        for name in names {
            self.other.insert(name.clone(), lookup(&name).is_some());
        }
    }

    /// Re-records one entry. Names outside the catalogue fall through to the
    /// base handler, which tracks them generically; the return value tells
    /// whether the catalogue handled the name.
    pub(crate) fn update(&mut self, name: &str, params: Option<usize>) -> bool {
        match CallIn::from_name(name) {
            Some(call_in) => {
                self.bound[call_in.index()] =
                    if self.role.allows(call_in.descriptor().affinity) { params } else { None };
                true
            }
            None => {
                self.other.insert(name.to_string(), params.is_some());
                false
            }
        }
    }
}

/// Existence checks and redefinition signals over the routed contexts.
pub struct CallInRegistry;

impl CallInRegistry {
    /// Whether a function named `name` is bound in `context` right now. Never
    /// runs script code.
    pub fn probe(context: &ScriptContext, name: &str) -> bool {
        context.bound_params(name).is_some()
    }

    /// Probes every catalogue call-in; run once the context has loaded.
    pub fn refresh(context: &ScriptContext) {
        context.refresh_presence();
        tracing::debug!(
            context = context.tag().label(),
            defined = context.presence().defined().count(),
            "refreshed call-in presence"
        );
    }

    /// Re-probes just `name` after the script redefined it.
    pub fn update_on_redefinition(context: &ScriptContext, name: &str) -> bool {
        let handled = context.reprobe(name);
        tracing::debug!(context = context.tag().label(), name, handled, "call-in redefined");
        handled
    }

    pub fn is_defined(context: &ScriptContext, call_in: CallIn) -> bool {
        context.has_call_in(call_in)
    }
}
