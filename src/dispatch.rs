//! Invokes call-ins under the fixed protocol: probe, guard, marshal, reserve,
//! protected call, validate, restore.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use anyhow::Result;
use rhai::{Dynamic, FLOAT, INT};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::callins::{Affinity, CallIn, CallInDescriptor, CallMode, Malformed, ResultSlot, SafeDefault, SlotPresence, ValueKind};
use crate::callouts::{self, pack_xz, CallOutEnv};
use crate::config::RulesConfig;
use crate::context::{build_engine, ContextRole, ContextRouter, ContextTag, ScriptContext, ScriptSource};
use crate::diagnostics::DiagnosticsHandle;
use crate::guard::{protected_call, ReentrancyGuard};
use crate::host::{EntityView, HostBindings};
use crate::marshal::{digest_values, marshal, marshal_unit_script, CallInArgs};
use crate::registry::CallInRegistry;

/// Arguments a unit-script callback receives after the identity block.
pub const MAX_UNIT_SCRIPT_ARGS: usize = 10;
/// Results a unit-script callback may hand back.
pub const MAX_UNIT_SCRIPT_RESULTS: usize = MAX_UNIT_SCRIPT_ARGS - 1;

/// Terminal state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Not bound, context dead, or no stack budget. Silent.
    Undefined,
    /// The script raised, or the reentrancy limit stopped the call.
    Faulted,
    /// Ran, but a required result slot had the wrong shape.
    Invalid,
    Valid,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallStatus::Undefined => "undefined",
            CallStatus::Faulted => "faulted",
            CallStatus::Invalid => "invalid",
            CallStatus::Valid => "valid",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotValue {
    Bool(bool),
    Number(f64),
}

impl SlotValue {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            SlotValue::Bool(value) => Some(value),
            SlotValue::Number(_) => None,
        }
    }

    pub fn as_number(self) -> Option<f64> {
        match self {
            SlotValue::Number(value) => Some(value),
            SlotValue::Bool(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub call_in: CallIn,
    pub status: CallStatus,
    /// One entry per declared result slot once the call completed; `None`
    /// for absent optional slots and for malformed slots.
    pub slots: SmallVec<[Option<SlotValue>; 2]>,
}

impl CallOutcome {
    fn unhandled(call_in: CallIn, status: CallStatus) -> Self {
        Self { call_in, status, slots: SmallVec::new() }
    }

    pub fn undefined(call_in: CallIn) -> Self {
        Self::unhandled(call_in, CallStatus::Undefined)
    }

    /// The script ran to completion, even if some slots were malformed.
    pub fn handled(&self) -> bool {
        matches!(self.status, CallStatus::Valid | CallStatus::Invalid)
    }

    pub fn slot(&self, index: usize) -> Option<SlotValue> {
        self.slots.get(index).copied().flatten()
    }

    pub fn number(&self, index: usize) -> Option<f64> {
        self.slot(index).and_then(SlotValue::as_number)
    }

    pub fn safe_default(&self) -> SafeDefault {
        self.call_in.descriptor().default
    }

    /// First slot as a decision, falling back to the call-in's safe default.
    pub fn allowed(&self) -> bool {
        self.slot(0).and_then(SlotValue::as_bool).unwrap_or_else(|| self.safe_default().as_bool())
    }
}

/// Outcome of a unit-script callback. `values` is empty unless `called`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitScriptResult {
    pub called: bool,
    pub values: Vec<i32>,
}

impl UnitScriptResult {
    fn failed() -> Self {
        Self::default()
    }
}

/// Pops the unit-script argument scope opened by [`CallDispatcher::call_unit_script`].
struct UnitArgsScope<'a> {
    stack: &'a RefCell<Vec<SmallVec<[i32; MAX_UNIT_SCRIPT_ARGS]>>>,
}

impl Drop for UnitArgsScope<'_> {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

pub struct CallDispatcher {
    router: ContextRouter,
    guard: ReentrancyGuard,
    diagnostics: DiagnosticsHandle,
    bindings: HostBindings,
    unit_script_args: RefCell<Vec<SmallVec<[i32; MAX_UNIT_SCRIPT_ARGS]>>>,
    sync_trace: RefCell<blake3::Hasher>,
}

impl fmt::Debug for CallDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDispatcher").field("router", &self.router).field("guard", &self.guard).finish()
    }
}

impl CallDispatcher {
    /// Builds the contexts with their call-outs installed. Nothing is loaded yet.
    pub fn new(config: &RulesConfig, bindings: HostBindings, diagnostics: DiagnosticsHandle) -> Rc<Self> {
        Rc::new_cyclic(|weak| {
            let make_context = |role: ContextRole, full_read: bool| {
                let mut engine = build_engine(&config.engine);
                let env = CallOutEnv::new(weak.clone(), bindings.clone(), diagnostics.clone(), role);
                let call_outs = callouts::install(&mut engine, env);
                ScriptContext::new(role, engine, call_outs, full_read, config.stack_capacity)
            };
            let router = if config.single_context {
                ContextRouter::single(make_context(ContextRole::Combined, config.synced_full_read))
            } else {
                ContextRouter::dual(
                    make_context(ContextRole::Synced, config.synced_full_read),
                    make_context(ContextRole::Unsynced, config.unsynced_full_read),
                )
            };
            Self {
                router,
                guard: ReentrancyGuard::new(config.max_call_depth),
                diagnostics: diagnostics.clone(),
                bindings: bindings.clone(),
                unit_script_args: RefCell::new(Vec::new()),
                sync_trace: RefCell::new(blake3::Hasher::new()),
            }
        })
    }

    pub fn router(&self) -> &ContextRouter {
        &self.router
    }

    pub fn context(&self, tag: ContextTag) -> &ScriptContext {
        self.router.get(tag)
    }

    pub fn guard(&self) -> &ReentrancyGuard {
        &self.guard
    }

    pub fn bindings(&self) -> &HostBindings {
        &self.bindings
    }

    pub fn diagnostics(&self) -> &DiagnosticsHandle {
        &self.diagnostics
    }

    pub fn is_defined(&self, call_in: CallIn) -> bool {
        self.route(call_in.descriptor().affinity).iter().any(|context| context.has_call_in(call_in))
    }

    /// Running digest of every value marshaled into the synced context.
    pub fn synced_checksum(&self) -> String {
        self.sync_trace.borrow().finalize().to_hex().to_string()
    }

    /// Merges `source` into the context behind `tag` and re-probes the names it
    /// defines.
    pub fn define(&self, tag: ContextTag, source: &ScriptSource) -> Result<Vec<String>> {
        let context = self.router.get(tag);
        let names = context.load(source)?;
        for name in &names {
            CallInRegistry::update_on_redefinition(context, name);
        }
        Ok(names)
    }

    /// Removes a function from the context behind `tag` and re-probes it.
    pub fn undefine(&self, tag: ContextTag, name: &str) -> Result<bool> {
        let context = self.router.get(tag);
        let removed = context.remove_function(name)?;
        CallInRegistry::update_on_redefinition(context, name);
        Ok(removed)
    }

    /// Runs `Shutdown` in every live context, then marks them dead.
    pub fn shutdown(&self) {
        for context in self.router.contexts() {
            if context.is_alive() {
                self.invoke_in(context, &CallInArgs::Shutdown);
                context.kill();
            }
        }
    }

    fn route(&self, affinity: Affinity) -> SmallVec<[&ScriptContext; 2]> {
        match affinity {
            Affinity::Synced => smallvec![self.router.get(ContextTag::Synced)],
            Affinity::Unsynced => smallvec![self.router.get(ContextTag::Unsynced)],
            Affinity::Both => self.router.contexts(),
        }
    }

    /// Dispatches a call-in to the context(s) its affinity names. For
    /// call-ins offered to both contexts the last handled outcome wins.
    pub fn invoke(&self, args: &CallInArgs<'_>) -> CallOutcome {
        let call_in = args.call_in();
        let mut outcome = CallOutcome::undefined(call_in);
        for context in self.route(call_in.descriptor().affinity) {
            let current = self.invoke_in(context, args);
            if current.status != CallStatus::Undefined {
                outcome = current;
            }
        }
        outcome
    }

    /// Dispatches to one explicitly chosen context.
    pub fn invoke_on(&self, tag: ContextTag, args: &CallInArgs<'_>) -> CallOutcome {
        self.invoke_in(self.router.get(tag), args)
    }

    fn invoke_in(&self, context: &ScriptContext, args: &CallInArgs<'_>) -> CallOutcome {
        let call_in = args.call_in();
        let descriptor = call_in.descriptor();
        if !context.is_alive() || !context.role().allows(descriptor.affinity) {
            return CallOutcome::undefined(call_in);
        }
        let Some(params) = context.cached_params(call_in) else {
            return CallOutcome::undefined(call_in);
        };

        let Some(_depth) = self.guard.enter() else {
            self.diagnostics.warning(&format!(
                "{}() call overflow: nesting exceeds {} levels",
                descriptor.name(),
                self.guard.max_depth()
            ));
            return CallOutcome::unhandled(call_in, CallStatus::Faulted);
        };

        let values = marshal(args, context.full_read());
        debug_assert!(descriptor.arity.accepts(values.len()), "{} marshaled {} values", descriptor.name(), values.len());
        let Some(frame) = context.stack().reserve(descriptor.stack_budget(values.len())) else {
            tracing::debug!(call_in = descriptor.name(), context = context.tag().label(), "stack budget exhausted");
            return CallOutcome::undefined(call_in);
        };
        if context.tag() == ContextTag::Synced && descriptor.affinity != Affinity::Unsynced {
            digest_values(&mut self.sync_trace.borrow_mut(), descriptor.name(), &values);
        }

        frame.extend(values);
        let mut call_args = frame.take_pushed();
        call_args.resize(params, Dynamic::UNIT);

        let returned = match protected_call(context, descriptor.name(), call_args, descriptor.mode) {
            Ok(returned) => returned,
            Err(fault) => {
                self.diagnostics.error(&format!("{}() failed: {fault}", descriptor.name()));
                return CallOutcome::unhandled(call_in, CallStatus::Faulted);
            }
        };
        if descriptor.results.len() > 1 && returned.is_array() {
            frame.extend(returned.into_array().unwrap_or_default());
        } else {
            frame.push(returned);
        }
        let results = frame.pushed();
        self.validate(&descriptor, &results)
    }

    fn validate(&self, descriptor: &CallInDescriptor, results: &[Dynamic]) -> CallOutcome {
        let mut outcome = CallOutcome::unhandled(descriptor.call_in, CallStatus::Valid);
        for (index, slot) in descriptor.results.iter().enumerate() {
            let value = results.get(index).cloned().unwrap_or(Dynamic::UNIT);
            match read_slot(slot, &value) {
                Some(read) => outcome.slots.push(read),
                None if slot.malformed == Malformed::ReadFalse => outcome.slots.push(Some(SlotValue::Bool(false))),
                None => {
                    self.diagnostics.warning(&format!(
                        "{}(): {} return value ({}) should be a {}, got {}",
                        descriptor.name(),
                        ordinal(index),
                        slot.label,
                        slot.kind.label(),
                        describe(&value)
                    ));
                    if slot.presence == SlotPresence::Required {
                        outcome.status = CallStatus::Invalid;
                    }
                    outcome.slots.push(None);
                }
            }
        }
        outcome
    }

    /// Argument `index` (1-based) of the innermost running unit-script
    /// callback. `Err(None)` outside a callback, `Err(Some(count))` when out of range.
    pub fn unit_script_arg(&self, index: INT) -> std::result::Result<i32, Option<usize>> {
        let stack = self.unit_script_args.borrow();
        let current = stack.last().ok_or(None)?;
        usize::try_from(index)
            .ok()
            .and_then(|index| index.checked_sub(1))
            .and_then(|index| current.get(index).copied())
            .ok_or(Some(current.len()))
    }

    /// Calls an arbitrary synced script function on behalf of a unit's
    /// animation script and converts its results to integers.
    pub fn call_unit_script(&self, function: &str, unit: &dyn EntityView, args: &[i32]) -> UnitScriptResult {
        let context = self.router.get(ContextTag::Synced);
        if !context.is_alive() {
            return UnitScriptResult::failed();
        }
        let Some(_depth) = self.guard.enter() else {
            self.diagnostics.warning(&format!("call_unit_script() call overflow: {function}"));
            return UnitScriptResult::failed();
        };
        let args = &args[..args.len().min(MAX_UNIT_SCRIPT_ARGS)];
        let values = marshal_unit_script(unit, args);
        let budget = crate::callins::CALL_OVERHEAD + values.len().max(MAX_UNIT_SCRIPT_RESULTS);
        let Some(frame) = context.stack().reserve(budget) else {
            self.diagnostics.warning(&format!("call_unit_script() stack exhausted: {function}"));
            return UnitScriptResult::failed();
        };
        let Some(params) = context.bound_params(function) else {
            self.diagnostics.warning(&format!("call_unit_script() missing function: {function}"));
            return UnitScriptResult::failed();
        };

        digest_values(&mut self.sync_trace.borrow_mut(), function, &values);
        frame.extend(values);
        let mut call_args = frame.take_pushed();
        call_args.resize(params, Dynamic::UNIT);

        self.unit_script_args.borrow_mut().push(args.iter().copied().collect());
        let scope = UnitArgsScope { stack: &self.unit_script_args };
        let returned = protected_call(context, function, call_args, CallMode::Light);
        drop(scope);

        let returned = match returned {
            Ok(returned) => returned,
            Err(fault) => {
                self.diagnostics.error(&format!("{function}() failed: {fault}"));
                return UnitScriptResult::failed();
            }
        };
        if returned.is_array() {
            frame.extend(returned.into_array().unwrap_or_default());
        } else if !returned.is_unit() {
            frame.push(returned);
        }
        let values = frame.pushed().iter().take(MAX_UNIT_SCRIPT_RESULTS).map(unit_script_value).collect();
        UnitScriptResult { called: true, values }
    }
}

fn read_slot(slot: &ResultSlot, value: &Dynamic) -> Option<Option<SlotValue>> {
    if value.is_unit() && slot.presence == SlotPresence::Optional {
        return Some(None);
    }
    match slot.kind {
        ValueKind::Boolean => value.as_bool().ok().map(|flag| Some(SlotValue::Bool(flag))),
        ValueKind::Number => number(value).map(|number| Some(SlotValue::Number(number))),
    }
}

fn number(value: &Dynamic) -> Option<f64> {
    if let Ok(int) = value.as_int() {
        return Some(int as f64);
    }
    value.as_float().ok().map(|float: FLOAT| float as f64)
}

fn unit_script_value(value: &Dynamic) -> i32 {
    if let Some(number) = number(value) {
        return number as i32;
    }
    if let Ok(flag) = value.as_bool() {
        return flag as i32;
    }
    if let Some(items) = value.read_lock::<rhai::Array>() {
        if let (Some(x), Some(z)) = (items.first().and_then(number), items.get(1).and_then(number)) {
            return pack_xz(x as i32, z as i32);
        }
    }
    0
}

fn ordinal(index: usize) -> String {
    match index {
        0 => "first".to_string(),
        1 => "second".to_string(),
        2 => "third".to_string(),
        n => format!("#{}", n + 1),
    }
}

fn describe(value: &Dynamic) -> &'static str {
    if value.is_unit() {
        "nothing"
    } else {
        value.type_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostics, RecordBuffer};
    use crate::host::EntityRecord;

    fn dispatcher(synced: &str) -> (Rc<CallDispatcher>, RecordBuffer) {
        let diagnostics = Diagnostics::isolated();
        let buffer = RecordBuffer::new();
        diagnostics.register_sink(buffer.sink());
        let dispatcher = CallDispatcher::new(&RulesConfig::default(), HostBindings::new(), diagnostics);
        let context = dispatcher.context(ContextTag::Synced);
        context.load(&ScriptSource::new("main", synced)).expect("load synced");
        CallInRegistry::refresh(context);
        (dispatcher, buffer)
    }

    #[test]
    fn read_slot_accepts_ints_for_numbers() {
        let slot = ResultSlot::required("newDamage", ValueKind::Number);
        assert_eq!(read_slot(&slot, &Dynamic::from_int(3)), Some(Some(SlotValue::Number(3.0))));
        assert_eq!(read_slot(&slot, &Dynamic::UNIT), None);
        let optional = ResultSlot::optional("impulseMult", ValueKind::Number);
        assert_eq!(read_slot(&optional, &Dynamic::UNIT), Some(None));
    }

    #[test]
    fn unit_script_values_convert_by_kind() {
        assert_eq!(unit_script_value(&Dynamic::from_float(7.9)), 7);
        assert_eq!(unit_script_value(&Dynamic::TRUE), 1);
        let xz = Dynamic::from_array(vec![Dynamic::from_int(2), Dynamic::from_int(3)]);
        assert_eq!(unit_script_value(&xz), pack_xz(2, 3));
        assert_eq!(unit_script_value(&Dynamic::from("x".to_string())), 0);
    }

    #[test]
    fn arguments_are_padded_to_declared_params() {
        let (dispatcher, _) = dispatcher("fn AllowResourceLevel(team, resource, level, extra) { type_of(extra) == \"()\" }");
        let outcome = dispatcher.invoke(&CallInArgs::AllowResourceLevel { team: 1, resource: "metal", level: 5.0 });
        assert_eq!(outcome.status, CallStatus::Valid);
        assert!(outcome.allowed());
    }

    #[test]
    fn surplus_arguments_are_dropped() {
        let (dispatcher, _) = dispatcher("fn AllowResourceLevel(team) { team == 2 }");
        let outcome = dispatcher.invoke(&CallInArgs::AllowResourceLevel { team: 2, resource: "energy", level: 1.0 });
        assert!(outcome.allowed());
        assert!(outcome.handled());
    }

    #[test]
    fn fault_is_logged_with_the_call_in_name() {
        let (dispatcher, buffer) = dispatcher("fn MoveCtrlNotify(a, b, c, d) { throw \"bad move\"; }");
        let unit = EntityRecord::new(1, 2, 3);
        let outcome = dispatcher.invoke(&CallInArgs::MoveCtrlNotify { unit: &unit, data: 9 });
        assert_eq!(outcome.status, CallStatus::Faulted);
        assert!(!outcome.allowed());
        assert!(buffer.contains("MoveCtrlNotify() failed"));
        assert_eq!(dispatcher.context(ContextTag::Synced).stack_depth(), 0);
    }

    #[test]
    fn unit_script_arg_lookup_is_one_based() {
        let (dispatcher, _) = dispatcher("");
        assert_eq!(dispatcher.unit_script_arg(1), Err(None));
        dispatcher.unit_script_args.borrow_mut().push(SmallVec::from_slice(&[10, 20]));
        assert_eq!(dispatcher.unit_script_arg(2), Ok(20));
        assert_eq!(dispatcher.unit_script_arg(0), Err(Some(2)));
        assert_eq!(dispatcher.unit_script_arg(3), Err(Some(2)));
    }
}
