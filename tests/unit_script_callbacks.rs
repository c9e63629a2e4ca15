use std::rc::Rc;

use kestrel_rules::callouts::pack_xz;
use kestrel_rules::config::RulesConfig;
use kestrel_rules::context::ContextTag;
use kestrel_rules::diagnostics::{Diagnostics, RecordBuffer};
use kestrel_rules::dispatch::{CallDispatcher, UnitScriptResult};
use kestrel_rules::events::RulesEvent;
use kestrel_rules::host::{Command, EntityRecord, HostBindings, RulesParam, UnitScriptHost};
use kestrel_rules::marshal::CallInArgs;
use kestrel_rules::rules::{RulesHandler, RulesSources};

const UNIT: EntityRecord = EntityRecord::new(31, 4, 0);

/// Animation VM stand-in that immediately calls back into the rules.
struct Loopback;

impl UnitScriptHost for Loopback {
    fn call_unit_script(&self, rules: &CallDispatcher, unit_id: i32, function: &str, args: &[i32]) -> Result<i32, String> {
        let result = rules.call_unit_script(function, &EntityRecord::new(unit_id, UNIT.def_id, UNIT.team), args);
        if result.called {
            Ok(result.values.first().copied().unwrap_or(0))
        } else {
            Err(format!("{function} was not called"))
        }
    }
}

/// Host that answers every unit-script request by raising another transfer
/// call-in, so call-ins trigger each other through the host.
struct EventRelay;

impl UnitScriptHost for EventRelay {
    fn call_unit_script(&self, rules: &CallDispatcher, unit_id: i32, _function: &str, args: &[i32]) -> Result<i32, String> {
        let unit = EntityRecord::new(unit_id, UNIT.def_id, UNIT.team);
        let new_team = args.first().copied().unwrap_or_default();
        let outcome = rules.invoke(&CallInArgs::AllowUnitTransfer { unit: &unit, new_team, capture: false });
        Ok(outcome.allowed() as i32)
    }
}

fn load(synced: &str) -> (RulesHandler, RecordBuffer) {
    let diagnostics = Diagnostics::isolated();
    let buffer = RecordBuffer::new();
    diagnostics.register_sink(buffer.sink());
    let bindings = HostBindings::new().with_unit_scripts(Rc::new(Loopback));
    let handler = RulesHandler::new(&RulesConfig::default(), &RulesSources::new(synced, ""), bindings, diagnostics)
        .expect("load rules");
    (handler, buffer)
}

#[test]
fn results_convert_to_integers_by_kind() {
    let (handler, _) = load(r#"fn Aim(unit_id, def_id, team, heading, pitch) { [heading + 1, true, [3, 4], "x", 2.75] }"#);
    let result = handler.call_unit_script("Aim", &UNIT, &[90, 10]);
    assert_eq!(result, UnitScriptResult { called: true, values: vec![91, 1, pack_xz(3, 4), 0, 2] });
    assert_eq!(handler.dispatcher().context(ContextTag::Synced).stack_depth(), 0);
}

#[test]
fn single_values_and_nothing_are_both_accepted() {
    let (handler, _) = load(
        r#"
        fn Single(unit_id) { unit_id * 2 }
        fn Silent(unit_id) { }
        "#,
    );
    assert_eq!(handler.call_unit_script("Single", &UNIT, &[]).values, vec![62]);
    let silent = handler.call_unit_script("Silent", &UNIT, &[1, 2, 3]);
    assert!(silent.called);
    assert!(silent.values.is_empty());
}

#[test]
fn missing_function_fails_with_a_warning() {
    let (handler, buffer) = load("");
    let result = handler.call_unit_script("Nowhere", &UNIT, &[1]);
    assert!(!result.called);
    assert!(buffer.contains("call_unit_script() missing function: Nowhere"));
}

#[test]
fn packed_arguments_unpack_inside_callbacks_only() {
    let (handler, buffer) = load(
        r#"
        fn Packed(unit_id, def_id, team, packed) {
            let xz = UnpackCobArg(1);
            xz[0] + xz[1]
        }
        fn OutOfRange(unit_id, def_id, team, packed) { UnpackCobArg(2) }
        fn AllowCommand(a, b, c, d, e, f, g, h) { UnpackCobArg(1); true }
        "#,
    );
    let result = handler.call_unit_script("Packed", &UNIT, &[pack_xz(-5, 12)]);
    assert_eq!(result.values, vec![7]);

    let out_of_range = handler.call_unit_script("OutOfRange", &UNIT, &[pack_xz(1, 1)]);
    assert!(!out_of_range.called);
    assert!(buffer.contains("UnpackCobArg(): argument index 2 is out of range (1..=1)"));

    assert!(handler.allow_command(&UNIT, &Command::new(1), true));
    assert!(buffer.contains("UnpackCobArg(): may only be called from a unit script callback"));
}

#[test]
fn call_unit_script_call_out_round_trips_through_the_host() {
    let (handler, _) = load(
        r#"
        fn Bump(unit_id, def_id, team, value) { value + 100 }
        fn AllowUnitTransfer(unit_id, def_id, team, new_team, capture) {
            let bumped = CallUnitScript(unit_id, "Bump", [new_team]);
            SetRulesParam("bumped", bumped);
            bumped == 105
        }
        "#,
    );
    assert!(handler.allow_unit_transfer(&UNIT, 5, false));
    assert_eq!(handler.bindings().synced.borrow().rules_params.get("bumped"), Some(&RulesParam::Number(105.0)));
    let events = handler.drain_events();
    assert_eq!(
        events[0],
        RulesEvent::UnitScriptCalled { unit_id: UNIT.id, function: "Bump".to_string(), result: Some(105) }
    );
}

#[test]
fn call_unit_script_without_a_host_raises() {
    let diagnostics = Diagnostics::isolated();
    let buffer = RecordBuffer::new();
    diagnostics.register_sink(buffer.sink());
    let handler = RulesHandler::new(
        &RulesConfig::default(),
        &RulesSources::new(
            r#"fn AllowUnitTransfer(unit_id, def_id, team, new_team, capture) { CallUnitScript(unit_id, "Bump", []); false }"#,
            "",
        ),
        HostBindings::new(),
        diagnostics,
    )
    .expect("load rules");
    assert!(handler.allow_unit_transfer(&UNIT, 5, false));
    assert!(buffer.contains("CallUnitScript(): no unit script host is attached"));
}

#[test]
fn runaway_recursion_stops_at_the_depth_limit() {
    let (handler, buffer) = load(
        r#"
        fn Recurse(unit_id, def_id, team, level) {
            SetRulesParam("deepest", level);
            CallUnitScript(unit_id, "Recurse", [level + 1]);
            level
        }
        fn AllowCommand(unit_id, def_id, team, cmd_id, params, options, tag, from_synced) {
            CallUnitScript(unit_id, "Recurse", [1]);
            true
        }
        "#,
    );
    assert!(handler.allow_command(&UNIT, &Command::new(1), true));
    let deepest = handler.bindings().synced.borrow().rules_params.get("deepest").cloned();
    let max_depth = handler.dispatcher().guard().max_depth() as f64;
    assert_eq!(deepest, Some(RulesParam::Number(max_depth - 1.0)));
    assert!(buffer.contains("call_unit_script() call overflow: Recurse"));
    assert_eq!(handler.dispatcher().guard().depth(), 0);
    assert_eq!(handler.dispatcher().context(ContextTag::Synced).stack_depth(), 0);
    assert_eq!(handler.dispatcher().context(ContextTag::Synced).stack().reserved(), 0);
}

#[test]
fn lower_depth_limit_cuts_the_chain_early() {
    let config = RulesConfig { max_call_depth: 2, ..RulesConfig::default() };
    let diagnostics = Diagnostics::isolated();
    let buffer = RecordBuffer::new();
    diagnostics.register_sink(buffer.sink());
    let bindings = HostBindings::new().with_unit_scripts(Rc::new(Loopback));
    let handler = RulesHandler::new(
        &config,
        &RulesSources::new(
            r#"
            fn Nested(unit_id) { CallUnitScript(unit_id, "Nested", []); 1 }
            fn AllowUnitTransfer(unit_id, def_id, team, new_team, capture) {
                CallUnitScript(unit_id, "Nested", []);
                false
            }
            "#,
            "",
        ),
        bindings,
        diagnostics,
    )
    .expect("load rules");
    assert!(!handler.allow_unit_transfer(&UNIT, 1, false));
    assert!(buffer.contains("call_unit_script() call overflow: Nested"));
}

#[test]
fn call_in_chain_overflows_past_the_limit() {
    let diagnostics = Diagnostics::isolated();
    let buffer = RecordBuffer::new();
    diagnostics.register_sink(buffer.sink());
    let bindings = HostBindings::new().with_unit_scripts(Rc::new(EventRelay));
    let handler = RulesHandler::new(
        &RulesConfig::default(),
        &RulesSources::new(
            r#"
            fn AllowUnitTransfer(unit_id, def_id, team, new_team, capture) {
                SetRulesParam("depth", new_team);
                CallUnitScript(unit_id, "relay", [new_team + 1]);
                new_team != 1
            }
            "#,
            "",
        ),
        bindings,
        diagnostics,
    )
    .expect("load rules");
    assert!(!handler.allow_unit_transfer(&UNIT, 1, false));
    let depth = handler.bindings().synced.borrow().rules_params.get("depth").cloned();
    assert_eq!(depth, Some(RulesParam::Number(16.0)));
    assert!(buffer.contains("AllowUnitTransfer() call overflow: nesting exceeds 16 levels"));
    assert_eq!(handler.dispatcher().guard().depth(), 0);
    assert_eq!(handler.dispatcher().context(ContextTag::Synced).stack_depth(), 0);
}
