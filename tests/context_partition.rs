use kestrel_rules::callins::CallIn;
use kestrel_rules::config::RulesConfig;
use kestrel_rules::context::{ContextRole, ContextTag};
use kestrel_rules::diagnostics::{Diagnostics, Level, RecordBuffer};
use kestrel_rules::dispatch::CallStatus;
use kestrel_rules::events::RulesEvent;
use kestrel_rules::host::{Command, DrawMode, EntityRecord, HostBindings, ProjectileView};
use kestrel_rules::marshal::CallInArgs;
use kestrel_rules::rules::{RulesHandler, RulesSources};

const UNIT: EntityRecord = EntityRecord::new(11, 3, 1);

fn load(config: &RulesConfig, synced: &str, unsynced: &str) -> (RulesHandler, RecordBuffer) {
    let diagnostics = Diagnostics::isolated();
    let buffer = RecordBuffer::new();
    diagnostics.register_sink(buffer.sink());
    let handler = RulesHandler::new(config, &RulesSources::new(synced, unsynced), HostBindings::new(), diagnostics)
        .expect("load rules");
    (handler, buffer)
}

#[test]
fn call_out_surfaces_are_disjoint_where_required() {
    let (handler, _) = load(&RulesConfig::default(), "", "");
    let synced = handler.dispatcher().context(ContextTag::Synced);
    let unsynced = handler.dispatcher().context(ContextTag::Unsynced);

    for name in ["PermitHelperAIs", "SetRulesParam", "SetWatchWeapon", "CallUnitScript", "UnpackCobArg"] {
        assert!(synced.resolves_call_out(name), "{name} missing from synced");
        assert!(!unsynced.resolves_call_out(name), "{name} leaked into unsynced");
    }
    for name in ["SetUnitLuaDraw", "GetDrawMode", "IsDrawingEnabled"] {
        assert!(unsynced.resolves_call_out(name), "{name} missing from unsynced");
        assert!(!synced.resolves_call_out(name), "{name} leaked into synced");
    }
    for name in ["GetRulesParam", "IsSyncedContext", "Echo"] {
        assert!(synced.resolves_call_out(name) && unsynced.resolves_call_out(name), "{name} should be shared");
    }
}

#[test]
fn synced_code_cannot_reach_render_state() {
    let (handler, buffer) = load(
        &RulesConfig::default(),
        "fn AllowCommand(unit_id, a, b, c, d, e, f, g) { SetUnitLuaDraw(unit_id, true); false }",
        "",
    );
    let outcome = handler.invoke(&CallInArgs::AllowCommand { unit: &UNIT, command: &Command::new(1), from_synced: true });
    assert_eq!(outcome.status, CallStatus::Faulted);
    assert!(outcome.allowed());
    assert!(handler.bindings().local.borrow().custom_drawn_units.is_empty());
    assert!(buffer.contains("SetUnitLuaDraw"));
}

#[test]
fn unsynced_code_cannot_mutate_replicated_state() {
    let (handler, buffer) = load(
        &RulesConfig::default(),
        "",
        "fn DrawUnit(unit_id, mode) { PermitHelperAIs(false); true }",
    );
    assert!(handler.is_defined(CallIn::DrawUnit));
    assert!(!handler.draw_unit(&UNIT));
    assert!(handler.bindings().synced.borrow().helper_ais_permitted);
    assert!(handler.bindings().synced.borrow().events.is_empty());
    assert_eq!(buffer.count_at(Level::Error), 1);
}

#[test]
fn synced_call_ins_are_not_offered_to_the_unsynced_context() {
    let (handler, _) = load(
        &RulesConfig::default(),
        "",
        "fn AllowCommand(a, b, c, d, e, f, g, h) { false }",
    );
    assert!(!handler.is_defined(CallIn::AllowCommand));
    assert!(handler.allow_command(&UNIT, &Command::new(1), true));
    let outcome =
        handler.dispatcher().invoke_on(ContextTag::Unsynced, &CallInArgs::AllowCommand {
            unit: &UNIT,
            command: &Command::new(1),
            from_synced: true,
        });
    assert_eq!(outcome.status, CallStatus::Undefined);
}

#[test]
fn shared_call_outs_report_their_context() {
    let (handler, _) = load(
        &RulesConfig::default(),
        r#"SetRulesParam("synced_ctx", if IsSyncedContext() { 1 } else { 0 });"#,
        r#"fn DrawFeature(feature_id, mode) { IsSyncedContext() == false && GetRulesParam("synced_ctx") == 1.0 }"#,
    );
    assert!(handler.draw_feature(&UNIT));
}

#[test]
fn misused_call_out_leaves_host_state_alone() {
    let (handler, buffer) = load(
        &RulesConfig::default(),
        r#"fn AllowUnitTransfer(unit_id, def_id, team, new_team, capture) { SetWatchWeapon("twelve", true); false }"#,
        "",
    );
    assert!(handler.allow_unit_transfer(&UNIT, 2, false));
    let synced = handler.bindings().synced.borrow();
    assert!(synced.watched_weapon_defs.is_empty());
    assert!(synced.events.is_empty());
    assert!(buffer.contains("SetWatchWeapon(): bad argument #1, expected number, got string"));
}

#[test]
fn draw_call_ins_see_the_drawing_flag_and_mode() {
    let (handler, _) = load(
        &RulesConfig::default(),
        "",
        r#"
        fn DrawUnit(unit_id, mode) {
            SetUnitLuaDraw(unit_id, true);
            IsDrawingEnabled() && GetDrawMode() == mode
        }
        fn DrawProjectile(projectile_id, mode) { true }
        "#,
    );
    handler.bindings().local.borrow_mut().draw_mode = DrawMode::Shadow;
    assert!(handler.draw_unit(&UNIT));
    let local = handler.bindings().local.borrow();
    assert!(!local.drawing_enabled, "the flag is cleared once the draw call returns");
    assert!(local.custom_drawn_units.contains(&UNIT.id));
    drop(local);

    let stray = ProjectileView { id: 4, owner_id: 11, from_weapon: false, from_piece: false };
    assert!(!handler.draw_projectile(&stray));
    let fired = ProjectileView { from_weapon: true, ..stray };
    assert!(handler.draw_projectile(&fired));
}

#[test]
fn single_context_mode_serves_both_roles() {
    let config = RulesConfig { single_context: true, ..RulesConfig::default() };
    let (handler, _) = load(
        &config,
        "fn AllowResourceLevel(team, resource, level) { IsSyncedContext() }",
        "fn DrawUnit(unit_id, mode) { PermitHelperAIs(false); SetUnitLuaDraw(unit_id, true); true }",
    );
    let router = handler.dispatcher().router();
    assert!(router.is_single());
    assert_eq!(router.get(ContextTag::Unsynced).role(), ContextRole::Combined);
    assert!(router.get(ContextTag::Unsynced).resolves_call_out("SetRulesParam"));

    assert!(handler.is_defined(CallIn::AllowResourceLevel));
    assert!(handler.is_defined(CallIn::DrawUnit));
    assert!(handler.allow_resource_level(0, "energy", 1.0));
    assert!(handler.draw_unit(&UNIT));
    assert!(!handler.bindings().synced.borrow().helper_ais_permitted);
    assert_eq!(handler.drain_events(), vec![RulesEvent::HelperAisPermitted { permitted: false }]);
}

#[test]
fn shutdown_runs_in_every_context_once() {
    let (handler, buffer) = load(
        &RulesConfig::default(),
        r#"fn Shutdown() { Echo("synced down"); }"#,
        r#"fn Shutdown() { Echo("unsynced down"); }"#,
    );
    handler.shutdown();
    handler.shutdown();
    let messages: Vec<String> =
        buffer.snapshot().into_iter().filter(|record| record.level == Level::Info).map(|record| record.message).collect();
    assert_eq!(messages, vec!["synced down".to_string(), "unsynced down".to_string()]);
    assert!(!handler.dispatcher().context(ContextTag::Unsynced).is_alive());
}

#[test]
fn failed_load_is_reported_with_the_chunk_name() {
    let diagnostics = Diagnostics::isolated();
    let err = RulesHandler::new(
        &RulesConfig::default(),
        &RulesSources::scoped("broken", "fn AllowCommand( {", ""),
        HostBindings::new(),
        diagnostics,
    )
    .expect_err("syntax error");
    let chain = format!("{err:#}");
    assert!(chain.contains("broken"));
    assert!(chain.contains("broken/main.rhai"));
}
