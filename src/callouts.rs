//! Native functions rule scripts may call into the host.
//!
//! Each call-out validates every argument before touching host state, so a
//! misuse raises a script-level error and leaves the host unmodified. Which
//! call-outs a context receives depends on its role: replicated-state
//! mutators only reach the synced context, render-state access only the
//! unsynced one.

use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use rhai::{Array, Dynamic, Engine, EvalAltResult, FLOAT, INT};
use thiserror::Error;

use crate::context::{ContextRole, ContextTag};
use crate::diagnostics::DiagnosticsHandle;
use crate::dispatch::CallDispatcher;
use crate::events::RulesEvent;
use crate::host::{HostBindings, LocalState, RulesParam, SyncedState};

/// Argument-shape and usage errors raised back into the calling script.
#[derive(Debug, Error, PartialEq)]
pub enum CallOutError {
    #[error("{call}(): bad argument #{position}, expected {expected}, got {actual}")]
    BadArgument { call: &'static str, position: usize, expected: &'static str, actual: String },
    #[error("{call}(): may only be called from a unit script callback")]
    OutsideUnitScript { call: &'static str },
    #[error("{call}(): argument index {index} is out of range (1..={count})")]
    IndexOutOfRange { call: &'static str, index: INT, count: usize },
    #[error("{call}(): no unit script host is attached")]
    NoUnitScriptHost { call: &'static str },
    #[error("{call}(): host state is busy")]
    StateBusy { call: &'static str },
    #[error("{call}(): the rules handler has been released")]
    Detached { call: &'static str },
}

type CallOutResult<T> = Result<T, CallOutError>;

fn raise<T>(result: CallOutResult<T>) -> Result<T, Box<EvalAltResult>> {
    result.map_err(|err| err.to_string().into())
}

/// Where a call-out may be installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutAccess {
    SyncedOnly,
    UnsyncedOnly,
    Shared,
}

impl CallOutAccess {
    pub const fn installs_in(self, role: ContextRole) -> bool {
        match self {
            CallOutAccess::SyncedOnly => role.serves(ContextTag::Synced),
            CallOutAccess::UnsyncedOnly => role.serves(ContextTag::Unsynced),
            CallOutAccess::Shared => true,
        }
    }
}

pub struct CallOutSpec {
    pub name: &'static str,
    pub access: CallOutAccess,
    register: fn(&mut Engine, Rc<CallOutEnv>),
}

pub const CALL_OUTS: &[CallOutSpec] = &[
    CallOutSpec { name: "PermitHelperAIs", access: CallOutAccess::SyncedOnly, register: register_permit_helper_ais },
    CallOutSpec { name: "SetRulesParam", access: CallOutAccess::SyncedOnly, register: register_set_rules_param },
    CallOutSpec { name: "SetWatchWeapon", access: CallOutAccess::SyncedOnly, register: register_set_watch_weapon },
    CallOutSpec { name: "CallUnitScript", access: CallOutAccess::SyncedOnly, register: register_call_unit_script },
    CallOutSpec { name: "UnpackCobArg", access: CallOutAccess::SyncedOnly, register: register_unpack_cob_arg },
    CallOutSpec { name: "SetUnitLuaDraw", access: CallOutAccess::UnsyncedOnly, register: register_set_unit_lua_draw },
    CallOutSpec { name: "GetDrawMode", access: CallOutAccess::UnsyncedOnly, register: register_get_draw_mode },
    CallOutSpec { name: "IsDrawingEnabled", access: CallOutAccess::UnsyncedOnly, register: register_is_drawing_enabled },
    CallOutSpec { name: "GetRulesParam", access: CallOutAccess::Shared, register: register_get_rules_param },
    CallOutSpec { name: "IsSyncedContext", access: CallOutAccess::Shared, register: register_is_synced_context },
    CallOutSpec { name: "Echo", access: CallOutAccess::Shared, register: register_echo },
];

pub fn spec(name: &str) -> Option<&'static CallOutSpec> {
    CALL_OUTS.iter().find(|spec| spec.name == name)
}

/// What the call-outs of one context can reach.
pub(crate) struct CallOutEnv {
    dispatcher: Weak<CallDispatcher>,
    bindings: HostBindings,
    diagnostics: DiagnosticsHandle,
    role: ContextRole,
}

impl CallOutEnv {
    pub(crate) fn new(
        dispatcher: Weak<CallDispatcher>,
        bindings: HostBindings,
        diagnostics: DiagnosticsHandle,
        role: ContextRole,
    ) -> Self {
        Self { dispatcher, bindings, diagnostics, role }
    }
}

/// Registers every call-out the role may see, plus print/debug routing into
/// the diagnostic sink. Returns the names installed.
pub(crate) fn install(engine: &mut Engine, env: CallOutEnv) -> BTreeSet<&'static str> {
    let env = Rc::new(env);
    let mut installed = BTreeSet::new();
    for spec in CALL_OUTS.iter().filter(|spec| spec.access.installs_in(env.role)) {
        (spec.register)(engine, env.clone());
        installed.insert(spec.name);
    }

    let print_sink = env.diagnostics.clone();
    engine.on_print(move |text| print_sink.info(text));
    let debug_sink = env.diagnostics.clone();
    engine.on_debug(move |text, source, pos| match source {
        Some(source) => debug_sink.info(&format!("{source} @ {pos:?} | {text}")),
        None => debug_sink.info(&format!("{pos:?} | {text}")),
    });
    installed
}

fn actual(value: &Dynamic) -> String {
    if value.is_unit() {
        "nothing".to_string()
    } else {
        value.type_name().to_string()
    }
}

fn bad(call: &'static str, position: usize, expected: &'static str, value: &Dynamic) -> CallOutError {
    CallOutError::BadArgument { call, position, expected, actual: actual(value) }
}

fn int_arg(call: &'static str, position: usize, value: &Dynamic) -> CallOutResult<i32> {
    if let Ok(int) = value.as_int() {
        return i32::try_from(int).map_err(|_| bad(call, position, "32-bit integer", value));
    }
    match value.as_float() {
        Ok(float) if float.is_finite() => Ok(float as i32),
        _ => Err(bad(call, position, "number", value)),
    }
}

fn number_arg(value: &Dynamic) -> Option<f64> {
    value.as_int().map(|int| int as f64).or_else(|_| value.as_float().map(|float| float as f64)).ok()
}

fn bool_arg(call: &'static str, position: usize, value: &Dynamic) -> CallOutResult<bool> {
    value.as_bool().map_err(|_| bad(call, position, "boolean", value))
}

fn string_arg(call: &'static str, position: usize, value: &Dynamic) -> CallOutResult<String> {
    if value.is_string() {
        Ok(value.clone().into_string().unwrap_or_default())
    } else {
        Err(bad(call, position, "string", value))
    }
}

fn with_synced<T>(env: &CallOutEnv, call: &'static str, apply: impl FnOnce(&mut SyncedState) -> T) -> CallOutResult<T> {
    let mut state = env.bindings.synced.try_borrow_mut().map_err(|_| CallOutError::StateBusy { call })?;
    Ok(apply(&mut state))
}

fn with_local<T>(env: &CallOutEnv, call: &'static str, apply: impl FnOnce(&mut LocalState) -> T) -> CallOutResult<T> {
    let mut state = env.bindings.local.try_borrow_mut().map_err(|_| CallOutError::StateBusy { call })?;
    Ok(apply(&mut state))
}

fn register_permit_helper_ais(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("PermitHelperAIs", move |permit: Dynamic| {
        raise(permit_helper_ais(&env, &permit))
    });
}

fn permit_helper_ais(env: &CallOutEnv, permit: &Dynamic) -> CallOutResult<()> {
    const CALL: &str = "PermitHelperAIs";
    let permitted = bool_arg(CALL, 1, permit)?;
    with_synced(env, CALL, |state| {
        state.helper_ais_permitted = permitted;
        state.record(RulesEvent::HelperAisPermitted { permitted });
    })
}

fn register_set_rules_param(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("SetRulesParam", move |name: Dynamic, value: Dynamic| {
        raise(set_rules_param(&env, &name, &value))
    });
}

fn set_rules_param(env: &CallOutEnv, name: &Dynamic, value: &Dynamic) -> CallOutResult<()> {
    const CALL: &str = "SetRulesParam";
    let name = string_arg(CALL, 1, name)?;
    let value = match number_arg(value) {
        Some(number) => RulesParam::Number(number),
        None if value.is_string() => RulesParam::Text(value.clone().into_string().unwrap_or_default()),
        None => return Err(bad(CALL, 2, "number or string", value)),
    };
    with_synced(env, CALL, |state| {
        state.rules_params.insert(name.clone(), value.clone());
        state.record(RulesEvent::RulesParamSet { name, value });
    })
}

fn register_set_watch_weapon(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("SetWatchWeapon", move |weapon_def_id: Dynamic, watch: Dynamic| {
        raise(set_watch_weapon(&env, &weapon_def_id, &watch))
    });
}

fn set_watch_weapon(env: &CallOutEnv, weapon_def_id: &Dynamic, watch: &Dynamic) -> CallOutResult<()> {
    const CALL: &str = "SetWatchWeapon";
    let weapon_def_id = int_arg(CALL, 1, weapon_def_id)?;
    let watched = bool_arg(CALL, 2, watch)?;
    with_synced(env, CALL, |state| {
        if watched {
            state.watched_weapon_defs.insert(weapon_def_id);
        } else {
            state.watched_weapon_defs.remove(&weapon_def_id);
        }
        state.record(RulesEvent::WeaponWatched { weapon_def_id, watched });
    })
}

fn register_call_unit_script(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("CallUnitScript", move |unit_id: Dynamic, function: Dynamic, args: Dynamic| {
        raise(call_unit_script(&env, &unit_id, &function, &args))
    });
}

fn call_unit_script(env: &CallOutEnv, unit_id: &Dynamic, function: &Dynamic, args: &Dynamic) -> CallOutResult<Dynamic> {
    const CALL: &str = "CallUnitScript";
    let unit_id = int_arg(CALL, 1, unit_id)?;
    let function = string_arg(CALL, 2, function)?;
    let raw_args: Array = if args.is_unit() {
        Array::new()
    } else {
        args.clone().into_array().map_err(|_| bad(CALL, 3, "array", args))?
    };
    let script_args =
        raw_args.iter().map(|arg| int_arg(CALL, 3, arg)).collect::<CallOutResult<Vec<i32>>>()?;
    let host = env.bindings.unit_scripts.clone().ok_or(CallOutError::NoUnitScriptHost { call: CALL })?;
    let dispatcher = env.dispatcher.upgrade().ok_or(CallOutError::Detached { call: CALL })?;

    // The host may re-enter the dispatcher, so no state borrow is held here.
    let result = host.call_unit_script(&dispatcher, unit_id, &function, &script_args);
    let recorded = result.as_ref().ok().copied();
    if let Err(message) = &result {
        env.diagnostics.warning(&format!("{CALL}(): unit {unit_id} {function} failed: {message}"));
    }
    with_synced(env, CALL, |state| {
        state.record(RulesEvent::UnitScriptCalled { unit_id, function, result: recorded });
    })?;
    Ok(recorded.map(|value| Dynamic::from_int(value as INT)).unwrap_or(Dynamic::UNIT))
}

fn register_unpack_cob_arg(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("UnpackCobArg", move |index: Dynamic| raise(unpack_cob_arg(&env, &index)));
}

fn unpack_cob_arg(env: &CallOutEnv, index: &Dynamic) -> CallOutResult<Array> {
    const CALL: &str = "UnpackCobArg";
    let index = index.as_int().map_err(|_| bad(CALL, 1, "integer", index))?;
    let dispatcher = env.dispatcher.upgrade().ok_or(CallOutError::Detached { call: CALL })?;
    let packed = dispatcher.unit_script_arg(index).map_err(|count| match count {
        None => CallOutError::OutsideUnitScript { call: CALL },
        Some(count) => CallOutError::IndexOutOfRange { call: CALL, index, count },
    })?;
    let (x, z) = unpack_xz(packed);
    Ok(vec![Dynamic::from_int(x as INT), Dynamic::from_int(z as INT)])
}

/// Splits a packed `x << 16 | z` argument into its signed halves.
pub fn unpack_xz(packed: i32) -> (i16, i16) {
    let bits = packed as u32;
    ((bits >> 16) as u16 as i16, (bits & 0xffff) as u16 as i16)
}

pub fn pack_xz(x: i32, z: i32) -> i32 {
    x.wrapping_shl(16).wrapping_add(z & 0xffff)
}

fn register_set_unit_lua_draw(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("SetUnitLuaDraw", move |unit_id: Dynamic, enabled: Dynamic| {
        raise(set_unit_lua_draw(&env, &unit_id, &enabled))
    });
}

fn set_unit_lua_draw(env: &CallOutEnv, unit_id: &Dynamic, enabled: &Dynamic) -> CallOutResult<()> {
    const CALL: &str = "SetUnitLuaDraw";
    let unit_id = int_arg(CALL, 1, unit_id)?;
    let enabled = bool_arg(CALL, 2, enabled)?;
    with_local(env, CALL, |state| {
        if enabled {
            state.custom_drawn_units.insert(unit_id);
        } else {
            state.custom_drawn_units.remove(&unit_id);
        }
    })
}

fn register_get_draw_mode(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("GetDrawMode", move || {
        raise(with_local(&env, "GetDrawMode", |state| state.draw_mode.code() as INT))
    });
}

fn register_is_drawing_enabled(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("IsDrawingEnabled", move || {
        raise(with_local(&env, "IsDrawingEnabled", |state| state.drawing_enabled))
    });
}

fn register_get_rules_param(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("GetRulesParam", move |name: Dynamic| raise(get_rules_param(&env, &name)));
}

fn get_rules_param(env: &CallOutEnv, name: &Dynamic) -> CallOutResult<Dynamic> {
    const CALL: &str = "GetRulesParam";
    let name = string_arg(CALL, 1, name)?;
    let state = env.bindings.synced.try_borrow().map_err(|_| CallOutError::StateBusy { call: CALL })?;
    Ok(match state.rules_params.get(&name) {
        Some(RulesParam::Number(number)) => Dynamic::from_float(*number as FLOAT),
        Some(RulesParam::Text(text)) => Dynamic::from(text.clone()),
        None => Dynamic::UNIT,
    })
}

fn register_is_synced_context(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("IsSyncedContext", move || env.role.serves(ContextTag::Synced));
}

fn register_echo(engine: &mut Engine, env: Rc<CallOutEnv>) {
    engine.register_fn("Echo", move |message: Dynamic| env.diagnostics.info(&message.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_follows_role() {
        assert!(CallOutAccess::SyncedOnly.installs_in(ContextRole::Synced));
        assert!(!CallOutAccess::SyncedOnly.installs_in(ContextRole::Unsynced));
        assert!(!CallOutAccess::UnsyncedOnly.installs_in(ContextRole::Synced));
        assert!(CallOutAccess::UnsyncedOnly.installs_in(ContextRole::Combined));
        assert!(CallOutAccess::Shared.installs_in(ContextRole::Unsynced));
    }

    #[test]
    fn table_names_are_unique() {
        let names: BTreeSet<_> = CALL_OUTS.iter().map(|spec| spec.name).collect();
        assert_eq!(names.len(), CALL_OUTS.len());
        assert_eq!(spec("SetRulesParam").map(|spec| spec.access), Some(CallOutAccess::SyncedOnly));
        assert!(spec("Spring.Echo").is_none());
    }

    #[test]
    fn xz_packing_keeps_signed_halves() {
        let packed = pack_xz(-3, 1200);
        assert_eq!(unpack_xz(packed), (-3, 1200));
        assert_eq!(unpack_xz(pack_xz(512, -7)), (512, -7));
    }

    #[test]
    fn argument_checks_name_position_and_kind() {
        let err = bool_arg("PermitHelperAIs", 1, &Dynamic::from_int(1)).expect_err("int is not a bool");
        assert_eq!(err.to_string(), "PermitHelperAIs(): bad argument #1, expected boolean, got i64");
        let err = string_arg("GetRulesParam", 1, &Dynamic::UNIT).expect_err("unit is not a string");
        assert!(err.to_string().ends_with("got nothing"));
        assert_eq!(int_arg("SetWatchWeapon", 1, &Dynamic::from_float(4.0)), Ok(4));
    }

    #[test]
    fn misuse_leaves_synced_state_untouched() {
        let bindings = HostBindings::new();
        let env = CallOutEnv::new(
            Weak::new(),
            bindings.clone(),
            crate::diagnostics::Diagnostics::isolated(),
            ContextRole::Synced,
        );
        assert!(set_watch_weapon(&env, &Dynamic::from_int(3), &Dynamic::from("yes".to_string())).is_err());
        assert!(set_rules_param(&env, &Dynamic::from("wind".to_string()), &Dynamic::TRUE).is_err());
        let state = bindings.synced.borrow();
        assert!(state.watched_weapon_defs.is_empty());
        assert!(state.rules_params.is_empty());
        assert!(state.events.is_empty());
    }

    #[test]
    fn unpack_requires_a_live_dispatcher() {
        let env = CallOutEnv::new(
            Weak::new(),
            HostBindings::new(),
            crate::diagnostics::Diagnostics::isolated(),
            ContextRole::Synced,
        );
        let err = unpack_cob_arg(&env, &Dynamic::from_int(1)).expect_err("no dispatcher behind the env");
        assert_eq!(err, CallOutError::Detached { call: "UnpackCobArg" });
    }
}
