use std::cell::{Cell, Ref, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use anyhow::{anyhow, bail, Context, Result};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Scope, AST};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::callins::{Affinity, CallIn};
use crate::config::EngineLimits;
use crate::registry::PresenceFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTag {
    Synced,
    Unsynced,
}

impl ContextTag {
    pub const fn label(self) -> &'static str {
        match self {
            ContextTag::Synced => "synced",
            ContextTag::Unsynced => "unsynced",
        }
    }
}

impl fmt::Display for ContextTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which parts of the call-in catalogue and call-out surface a context serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextRole {
    Synced,
    Unsynced,
    /// Single-context hosts run both roles in one environment.
    Combined,
}

impl ContextRole {
    pub const fn serves(self, tag: ContextTag) -> bool {
        matches!(
            (self, tag),
            (ContextRole::Combined, _) | (ContextRole::Synced, ContextTag::Synced) | (ContextRole::Unsynced, ContextTag::Unsynced)
        )
    }

    pub const fn allows(self, affinity: Affinity) -> bool {
        match affinity {
            Affinity::Both => true,
            Affinity::Synced => self.serves(ContextTag::Synced),
            Affinity::Unsynced => self.serves(ContextTag::Unsynced),
        }
    }
}

/// A named script chunk handed over by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSource {
    pub name: String,
    pub code: String,
}

impl ScriptSource {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self { name: name.into(), code: code.into() }
    }
}

/// Bounded working set shared by every call into one context.
///
/// Reservations are counted against the capacity until the owning
/// [`StackFrame`] drops, so nested calls consume budget like a real call stack.
#[derive(Debug)]
pub struct ValueStack {
    values: RefCell<Vec<Dynamic>>,
    reserved: Cell<usize>,
    capacity: usize,
}

impl ValueStack {
    pub fn new(capacity: usize) -> Self {
        Self { values: RefCell::new(Vec::new()), reserved: Cell::new(0), capacity }
    }

    pub fn depth(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn reserved(&self) -> usize {
        self.reserved.get()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claims `slots` of budget; `None` when the stack cannot grow that far.
    pub(crate) fn reserve(&self, slots: usize) -> Option<StackFrame<'_>> {
        let reserved = self.reserved.get().checked_add(slots)?;
        if reserved > self.capacity {
            return None;
        }
        self.reserved.set(reserved);
        Some(StackFrame { stack: self, base: self.depth(), slots })
    }
}

/// Restores the stack to the depth it had at reservation time on drop.
pub(crate) struct StackFrame<'a> {
    stack: &'a ValueStack,
    base: usize,
    slots: usize,
}

impl StackFrame<'_> {
    pub(crate) fn push(&self, value: Dynamic) {
        self.stack.values.borrow_mut().push(value);
    }

    pub(crate) fn extend(&self, values: impl IntoIterator<Item = Dynamic>) {
        self.stack.values.borrow_mut().extend(values);
    }

    /// Pops every value pushed since this frame was opened, bottom first.
    pub(crate) fn take_pushed(&self) -> Vec<Dynamic> {
        let mut values = self.stack.values.borrow_mut();
        let base = self.base.min(values.len());
        values.split_off(base)
    }

    /// Values pushed since this frame was opened, bottom first, left in place.
    pub(crate) fn pushed(&self) -> SmallVec<[Dynamic; 4]> {
        let values = self.stack.values.borrow();
        values.get(self.base..).map(|slice| slice.iter().cloned().collect()).unwrap_or_default()
    }
}

impl Drop for StackFrame<'_> {
    fn drop(&mut self) {
        self.stack.values.borrow_mut().truncate(self.base);
        self.stack.reserved.set(self.stack.reserved.get().saturating_sub(self.slots));
    }
}

/// One isolated script environment.
pub struct ScriptContext {
    tag: ContextTag,
    role: ContextRole,
    engine: Engine,
    ast: RefCell<AST>,
    presence: RefCell<PresenceFlags>,
    stack: ValueStack,
    call_outs: BTreeSet<&'static str>,
    full_read: bool,
    alive: Cell<bool>,
}

impl fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptContext")
            .field("tag", &self.tag)
            .field("role", &self.role)
            .field("call_outs", &self.call_outs)
            .field("full_read", &self.full_read)
            .field("alive", &self.alive.get())
            .finish()
    }
}

pub(crate) fn build_engine(limits: &EngineLimits) -> Engine {
    let mut engine = Engine::new();
    engine.set_fast_operators(true);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_operations(limits.max_operations);
    engine.set_max_string_size(limits.max_string_size);
    engine
}

impl ScriptContext {
    pub(crate) fn new(
        role: ContextRole,
        engine: Engine,
        call_outs: BTreeSet<&'static str>,
        full_read: bool,
        stack_capacity: usize,
    ) -> Self {
        let tag = if role == ContextRole::Unsynced { ContextTag::Unsynced } else { ContextTag::Synced };
        Self {
            tag,
            role,
            engine,
            ast: RefCell::new(AST::empty()),
            presence: RefCell::new(PresenceFlags::new(role)),
            stack: ValueStack::new(stack_capacity),
            call_outs,
            full_read,
            alive: Cell::new(true),
        }
    }

    pub fn tag(&self) -> ContextTag {
        self.tag
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    pub fn full_read(&self) -> bool {
        self.full_read
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub(crate) fn kill(&self) {
        self.alive.set(false);
    }

    pub fn stack(&self) -> &ValueStack {
        &self.stack
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.depth()
    }

    /// Whether a native call-out is installed in this context.
    pub fn resolves_call_out(&self, name: &str) -> bool {
        self.call_outs.contains(name)
    }

    pub fn call_outs(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.call_outs.iter().copied()
    }

    pub fn presence(&self) -> Ref<'_, PresenceFlags> {
        self.presence.borrow()
    }

    /// Cached presence of a catalogue call-in.
    pub fn has_call_in(&self, call_in: CallIn) -> bool {
        self.presence.borrow().is_defined(call_in)
    }

    /// Declared parameter count of the function currently bound to `name`.
    pub(crate) fn bound_params(&self, name: &str) -> Option<usize> {
        let ast = self.ast.try_borrow().ok()?;
        ast.iter_functions().filter(|func| func.name == name).map(|func| func.params.len()).max()
    }

    pub(crate) fn cached_params(&self, call_in: CallIn) -> Option<usize> {
        self.presence.borrow().params(call_in)
    }

    pub(crate) fn refresh_presence(&self) {
        let mut flags = self.presence.borrow_mut();
        flags.refresh_all(|name| self.bound_params(name));
    }

    pub(crate) fn reprobe(&self, name: &str) -> bool {
        let params = self.bound_params(name);
        self.presence.borrow_mut().update(name, params)
    }

    /// Compiles `source`, runs its top-level statements once and merges its
    /// functions into the context. Returns the names of the functions it defines.
    pub(crate) fn load(&self, source: &ScriptSource) -> Result<Vec<String>> {
        if !self.is_alive() {
            bail!("{} context is shut down", self.tag);
        }
        let mut chunk = self
            .engine
            .compile(&source.code)
            .map_err(|err| anyhow!("{err}"))
            .with_context(|| format!("Compiling {} script '{}'", self.tag, source.name))?;
        chunk.set_source(source.name.as_str());
        let mut scope = Scope::new();
        self.engine
            .run_ast_with_scope(&mut scope, &chunk)
            .map_err(|err| anyhow!("{err}"))
            .with_context(|| format!("Running {} script '{}'", self.tag, source.name))?;
        let mut names: Vec<String> = chunk.iter_functions().map(|func| func.name.to_string()).collect();
        names.sort();
        names.dedup();
        chunk.clear_statements();
        let mut ast = self
            .ast
            .try_borrow_mut()
            .map_err(|_| anyhow!("cannot redefine {} functions while a call-in is running", self.tag))?;
        // A chunk's function replaces every earlier overload of the same name.
        ast.retain_functions(|_, _, fn_name, _| names.binary_search_by(|name| name.as_str().cmp(fn_name)).is_err());
        ast.combine(chunk);
        Ok(names)
    }

    /// Removes every overload of `name`. Returns whether anything was removed.
    pub(crate) fn remove_function(&self, name: &str) -> Result<bool> {
        let mut ast = self
            .ast
            .try_borrow_mut()
            .map_err(|_| anyhow!("cannot remove '{name}' while a call-in is running"))?;
        let before = ast.iter_functions().count();
        ast.retain_functions(|_, _, fn_name, _| fn_name != name);
        Ok(ast.iter_functions().count() != before)
    }

    pub(crate) fn call(&self, name: &str, args: Vec<Dynamic>) -> Result<Dynamic, Box<EvalAltResult>> {
        let ast = self
            .ast
            .try_borrow()
            .map_err(|_| -> Box<EvalAltResult> { format!("{} context is being redefined", self.tag).into() })?;
        let mut scope = Scope::new();
        let options = CallFnOptions::new().eval_ast(false).rewind_scope(true);
        self.engine.call_fn_with_options::<Dynamic>(options, &mut scope, &ast, name, args)
    }
}

/// Owns the synced and unsynced contexts; both tags alias one context in
/// single-context mode.
#[derive(Debug)]
pub struct ContextRouter {
    synced: Rc<ScriptContext>,
    unsynced: Rc<ScriptContext>,
}

impl ContextRouter {
    pub(crate) fn single(context: ScriptContext) -> Self {
        let shared = Rc::new(context);
        Self { synced: shared.clone(), unsynced: shared }
    }

    pub(crate) fn dual(synced: ScriptContext, unsynced: ScriptContext) -> Self {
        Self { synced: Rc::new(synced), unsynced: Rc::new(unsynced) }
    }

    pub fn is_single(&self) -> bool {
        Rc::ptr_eq(&self.synced, &self.unsynced)
    }

    pub fn get(&self, tag: ContextTag) -> &ScriptContext {
        match tag {
            ContextTag::Synced => &self.synced,
            ContextTag::Unsynced => &self.unsynced,
        }
    }

    /// Every distinct context, synced first.
    pub fn contexts(&self) -> SmallVec<[&ScriptContext; 2]> {
        let mut contexts: SmallVec<[&ScriptContext; 2]> = SmallVec::new();
        contexts.push(&self.synced);
        if !self.is_single() {
            contexts.push(&self.unsynced);
        }
        contexts
    }

    pub fn for_each_context(&self, mut apply: impl FnMut(&ScriptContext)) {
        for context in self.contexts() {
            apply(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_context(role: ContextRole) -> ScriptContext {
        ScriptContext::new(role, build_engine(&EngineLimits::default()), BTreeSet::new(), true, 16)
    }

    #[test]
    fn frames_restore_depth_and_budget() {
        let stack = ValueStack::new(8);
        {
            let frame = stack.reserve(4).expect("reserve four slots");
            frame.push(Dynamic::from_int(1));
            frame.push(Dynamic::TRUE);
            assert_eq!(stack.depth(), 2);
            assert_eq!(stack.reserved(), 4);
            assert!(stack.reserve(5).is_none(), "nested reservation must respect the outer one");
        }
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.reserved(), 0);
    }

    #[test]
    fn take_pushed_only_returns_frame_values() {
        let stack = ValueStack::new(8);
        let outer = stack.reserve(2).expect("outer");
        outer.push(Dynamic::from_int(7));
        let inner = stack.reserve(2).expect("inner");
        inner.extend([Dynamic::from_int(1), Dynamic::from_int(2)]);
        let taken = inner.take_pushed();
        assert_eq!(taken.len(), 2);
        assert_eq!(stack.depth(), 1);
        drop(inner);
        drop(outer);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn roles_gate_affinities() {
        assert!(ContextRole::Combined.allows(Affinity::Unsynced));
        assert!(!ContextRole::Synced.allows(Affinity::Unsynced));
        assert!(ContextRole::Unsynced.allows(Affinity::Both));
    }

    #[test]
    fn load_merges_functions_and_probes_without_running_them() {
        let context = bare_context(ContextRole::Synced);
        let names = context
            .load(&ScriptSource::new("main", "fn AllowCommand(a, b) { throw \"never run\"; }"))
            .expect("load");
        assert_eq!(names, vec!["AllowCommand".to_string()]);
        assert_eq!(context.bound_params("AllowCommand"), Some(2));
        assert_eq!(context.bound_params("DrawUnit"), None);
    }

    #[test]
    fn later_chunk_replaces_overloads_of_other_arity() {
        let context = bare_context(ContextRole::Synced);
        context.load(&ScriptSource::new("main", "fn Gate(a, b, c, d) { false } fn Keep() { 1 }")).expect("load main");
        context.load(&ScriptSource::new("patch", "fn Gate(a) { true }")).expect("load patch");
        assert_eq!(context.bound_params("Gate"), Some(1));
        assert_eq!(context.bound_params("Keep"), Some(0));
        let returned = context.call("Gate", vec![Dynamic::from_int(1)]).expect("call Gate");
        assert_eq!(returned.as_bool(), Ok(true));
    }

    #[test]
    fn single_router_visits_one_context() {
        let router = ContextRouter::single(bare_context(ContextRole::Combined));
        assert!(router.is_single());
        let mut visited = 0;
        router.for_each_context(|_| visited += 1);
        assert_eq!(visited, 1);

        let dual = ContextRouter::dual(bare_context(ContextRole::Synced), bare_context(ContextRole::Unsynced));
        assert_eq!(dual.contexts().len(), 2);
        assert_eq!(dual.get(ContextTag::Unsynced).tag(), ContextTag::Unsynced);
    }
}
