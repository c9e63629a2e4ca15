use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::config::RulesConfig;
use crate::context::{ContextTag, ScriptSource};
use crate::diagnostics::{Diagnostics, Record, RecordBuffer};
use crate::dispatch::{CallDispatcher, CallOutcome, CallStatus, UnitScriptResult};
use crate::events::RulesEvent;
use crate::host::{
    BuildInfo, Command, DrawMode, EntityRecord, EntityView, HostBindings, ProjectileView, RulesParam, UnitScriptHost, WeaponView,
};
use crate::marshal::CallInArgs;
use crate::rules::{RulesHandler, RulesSources};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessFixture {
    #[serde(default)]
    pub synced_script: String,
    #[serde(default)]
    pub unsynced_script: String,
    #[serde(default)]
    pub single_context: bool,
    #[serde(default)]
    pub max_call_depth: Option<u32>,
    #[serde(default)]
    pub stack_capacity: Option<usize>,
    #[serde(default)]
    pub restricted_read: bool,
    #[serde(default)]
    pub draw_mode: DrawMode,
    pub steps: Vec<FixtureStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FixtureStep {
    pub event: FixtureEvent,
    #[serde(default)]
    pub expect: Option<Expectation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureEvent {
    CommandFallback {
        unit: EntityRecord,
        command: Command,
    },
    AllowCommand {
        unit: EntityRecord,
        command: Command,
        #[serde(default)]
        from_synced: bool,
    },
    AllowUnitCreation {
        unit_def_id: i32,
        builder: EntityRecord,
        #[serde(default)]
        position: Option<[f32; 3]>,
        #[serde(default)]
        facing: i32,
    },
    AllowUnitTransfer {
        unit: EntityRecord,
        new_team: i32,
        #[serde(default)]
        capture: bool,
    },
    AllowResourceLevel {
        team: i32,
        resource: String,
        level: f32,
    },
    AllowResourceTransfer {
        old_team: i32,
        new_team: i32,
        resource: String,
        amount: f32,
    },
    MoveCtrlNotify {
        unit: EntityRecord,
        data: i32,
    },
    UnitPreDamaged {
        unit: EntityRecord,
        #[serde(default)]
        attacker: Option<EntityRecord>,
        damage: f32,
        #[serde(default)]
        weapon_def_id: i32,
        #[serde(default)]
        projectile_id: i32,
        #[serde(default)]
        paralyzer: bool,
    },
    AllowWeaponTarget {
        attacker_id: i32,
        target_id: i32,
        weapon_num: i32,
        weapon_def_id: i32,
        priority: f32,
    },
    ShieldPreDamaged {
        projectile: ProjectileView,
        shield: WeaponView,
        carrier: EntityRecord,
        #[serde(default)]
        bounce: bool,
    },
    DrawUnit {
        unit: EntityRecord,
    },
    UnitScript {
        function: String,
        unit: EntityRecord,
        #[serde(default)]
        args: Vec<i32>,
    },
    Define {
        context: ContextTag,
        name: String,
        code: String,
    },
    Undefine {
        context: ContextTag,
        name: String,
    },
}

impl FixtureEvent {
    fn label(&self) -> String {
        match self {
            FixtureEvent::CommandFallback { .. } => "CommandFallback".into(),
            FixtureEvent::AllowCommand { .. } => "AllowCommand".into(),
            FixtureEvent::AllowUnitCreation { .. } => "AllowUnitCreation".into(),
            FixtureEvent::AllowUnitTransfer { .. } => "AllowUnitTransfer".into(),
            FixtureEvent::AllowResourceLevel { .. } => "AllowResourceLevel".into(),
            FixtureEvent::AllowResourceTransfer { .. } => "AllowResourceTransfer".into(),
            FixtureEvent::MoveCtrlNotify { .. } => "MoveCtrlNotify".into(),
            FixtureEvent::UnitPreDamaged { .. } => "UnitPreDamaged".into(),
            FixtureEvent::AllowWeaponTarget { .. } => "AllowWeaponTarget".into(),
            FixtureEvent::ShieldPreDamaged { .. } => "ShieldPreDamaged".into(),
            FixtureEvent::DrawUnit { .. } => "DrawUnit".into(),
            FixtureEvent::UnitScript { function, .. } => format!("unit_script:{function}"),
            FixtureEvent::Define { context, name, .. } => format!("define:{context}:{name}"),
            FixtureEvent::Undefine { context, name } => format!("undefine:{context}:{name}"),
        }
    }
}

/// What a step must produce; unset fields are not checked.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Expectation {
    #[serde(default)]
    pub status: Option<CallStatus>,
    #[serde(default)]
    pub allowed: Option<bool>,
    #[serde(default)]
    pub numbers: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub unit_script: Option<UnitScriptResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepReport {
    pub step: usize,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numbers: Vec<Option<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_script: Option<UnitScriptResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stack_restored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSummary {
    pub helper_ais_permitted: bool,
    pub rules_params: BTreeMap<String, RulesParam>,
    pub watched_weapon_defs: Vec<i32>,
    pub custom_drawn_units: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessReport {
    pub steps: Vec<StepReport>,
    pub diagnostics: Vec<Record>,
    pub rules_events: Vec<RulesEvent>,
    pub final_state: StateSummary,
    pub sync_checksum: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mismatches: Vec<String>,
}

/// Stand-in animation VM: forwards `CallUnitScript` straight back into the
/// rules' unit-script callbacks and returns the first converted value.
struct LoopbackUnitScripts;

impl UnitScriptHost for LoopbackUnitScripts {
    fn call_unit_script(&self, rules: &CallDispatcher, unit_id: i32, function: &str, args: &[i32]) -> Result<i32, String> {
        let unit = EntityRecord::new(unit_id, 0, 0);
        let result = rules.call_unit_script(function, &unit, args);
        if !result.called {
            return Err(format!("{function} was not called"));
        }
        Ok(result.values.first().copied().unwrap_or(0))
    }
}

pub fn run_fixture(fixture: &HarnessFixture) -> Result<HarnessReport> {
    let mut config = RulesConfig { single_context: fixture.single_context, ..RulesConfig::default() };
    if let Some(depth) = fixture.max_call_depth {
        config.max_call_depth = depth;
    }
    if let Some(capacity) = fixture.stack_capacity {
        config.stack_capacity = capacity;
    }
    if fixture.restricted_read {
        config.synced_full_read = false;
        config.unsynced_full_read = false;
    }

    let diagnostics = Diagnostics::isolated();
    let buffer = RecordBuffer::new();
    diagnostics.register_sink(buffer.sink());
    let bindings = HostBindings::new().with_unit_scripts(Rc::new(LoopbackUnitScripts));
    bindings.local.borrow_mut().draw_mode = fixture.draw_mode;

    let sources = RulesSources::scoped("fixture", fixture.synced_script.as_str(), fixture.unsynced_script.as_str());
    let handler = RulesHandler::new(&config, &sources, bindings.clone(), diagnostics).context("creating rules handler")?;

    let mut steps = Vec::with_capacity(fixture.steps.len());
    let mut mismatches = Vec::new();
    for (idx, step) in fixture.steps.iter().enumerate() {
        let before = stack_depths(&handler);
        let mut report = run_step(&handler, idx, &step.event);
        report.stack_restored = stack_depths(&handler) == before;
        if let Some(expect) = &step.expect {
            check(&report, expect, &mut mismatches);
        }
        steps.push(report);
    }

    let rules_events = handler.drain_events();
    let sync_checksum = handler.synced_checksum();
    drop(handler);

    let synced = bindings.synced.borrow();
    let local = bindings.local.borrow();
    let final_state = StateSummary {
        helper_ais_permitted: synced.helper_ais_permitted,
        rules_params: synced.rules_params.clone(),
        watched_weapon_defs: synced.watched_weapon_defs.iter().copied().collect(),
        custom_drawn_units: local.custom_drawn_units.iter().copied().collect(),
    };
    Ok(HarnessReport { steps, diagnostics: buffer.take(), rules_events, final_state, sync_checksum, mismatches })
}

pub fn load_fixture<P: AsRef<Path>>(path: P) -> Result<HarnessFixture> {
    let file = File::open(path.as_ref()).with_context(|| format!("opening fixture '{}'", path.as_ref().display()))?;
    serde_json::from_reader(file).with_context(|| "parsing fixture JSON")
}

/// Writes `report` as pretty JSON, creating missing parent directories.
pub fn write_report<P: AsRef<Path>>(report: &HarnessReport, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("creating output directory '{}'", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("writing harness report to '{}'", path.display()))?;
    serde_json::to_writer_pretty(file, report).context("serializing harness report")
}

/// Compares `report` with a stored golden report and names every section
/// that differs. An empty list means the reports match.
pub fn compare_golden<P: AsRef<Path>>(report: &HarnessReport, path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("opening golden file '{}'", path.display()))?;
    let golden: HarnessReport = serde_json::from_reader(file).context("parsing golden JSON")?;
    Ok(report_differences(&golden, report))
}

fn report_differences(golden: &HarnessReport, actual: &HarnessReport) -> Vec<String> {
    let mut differences = Vec::new();
    if golden.steps.len() != actual.steps.len() {
        differences.push(format!("step count: golden {}, actual {}", golden.steps.len(), actual.steps.len()));
    }
    for (expected, got) in golden.steps.iter().zip(&actual.steps) {
        if expected != got {
            differences.push(format!("step {} ({}): golden {expected:?}, actual {got:?}", got.step, got.label));
        }
    }
    if golden.diagnostics != actual.diagnostics {
        differences.push(format!(
            "diagnostics: golden has {} record(s), actual {}",
            golden.diagnostics.len(),
            actual.diagnostics.len()
        ));
    }
    if golden.rules_events != actual.rules_events {
        differences.push(format!("rules events: golden {:?}, actual {:?}", golden.rules_events, actual.rules_events));
    }
    if golden.final_state != actual.final_state {
        differences.push(format!("final state: golden {:?}, actual {:?}", golden.final_state, actual.final_state));
    }
    if golden.sync_checksum != actual.sync_checksum {
        differences.push(format!("sync checksum: golden {}, actual {}", golden.sync_checksum, actual.sync_checksum));
    }
    differences
}

fn stack_depths(handler: &RulesHandler) -> (usize, usize) {
    let router = handler.dispatcher().router();
    (router.get(ContextTag::Synced).stack_depth(), router.get(ContextTag::Unsynced).stack_depth())
}

fn call_in_report(step: usize, label: String, outcome: &CallOutcome) -> StepReport {
    StepReport {
        step,
        label,
        status: Some(outcome.status),
        allowed: Some(outcome.allowed()),
        numbers: outcome.slots.iter().map(|slot| slot.and_then(|value| value.as_number())).collect(),
        unit_script: None,
        error: None,
        stack_restored: true,
    }
}

fn plain_report(step: usize, label: String) -> StepReport {
    StepReport {
        step,
        label,
        status: None,
        allowed: None,
        numbers: Vec::new(),
        unit_script: None,
        error: None,
        stack_restored: true,
    }
}

fn run_step(handler: &RulesHandler, step: usize, event: &FixtureEvent) -> StepReport {
    let label = event.label();
    let outcome = match event {
        FixtureEvent::CommandFallback { unit, command } => handler.invoke(&CallInArgs::CommandFallback { unit, command }),
        FixtureEvent::AllowCommand { unit, command, from_synced } => {
            handler.invoke(&CallInArgs::AllowCommand { unit, command, from_synced: *from_synced })
        }
        FixtureEvent::AllowUnitCreation { unit_def_id, builder, position, facing } => {
            let build = position.map(|[x, y, z]| BuildInfo { position: Vec3::new(x, y, z), facing: *facing });
            handler.invoke(&CallInArgs::AllowUnitCreation { unit_def_id: *unit_def_id, builder, build: build.as_ref() })
        }
        FixtureEvent::AllowUnitTransfer { unit, new_team, capture } => {
            handler.invoke(&CallInArgs::AllowUnitTransfer { unit, new_team: *new_team, capture: *capture })
        }
        FixtureEvent::AllowResourceLevel { team, resource, level } => {
            handler.invoke(&CallInArgs::AllowResourceLevel { team: *team, resource, level: *level })
        }
        FixtureEvent::AllowResourceTransfer { old_team, new_team, resource, amount } => {
            handler.invoke(&CallInArgs::AllowResourceTransfer {
                old_team: *old_team,
                new_team: *new_team,
                resource,
                amount: *amount,
            })
        }
        FixtureEvent::MoveCtrlNotify { unit, data } => handler.invoke(&CallInArgs::MoveCtrlNotify { unit, data: *data }),
        FixtureEvent::UnitPreDamaged { unit, attacker, damage, weapon_def_id, projectile_id, paralyzer } => {
            handler.invoke(&CallInArgs::UnitPreDamaged {
                unit,
                attacker: attacker.as_ref().map(|attacker| attacker as &dyn EntityView),
                damage: *damage,
                weapon_def_id: *weapon_def_id,
                projectile_id: *projectile_id,
                paralyzer: *paralyzer,
            })
        }
        FixtureEvent::AllowWeaponTarget { attacker_id, target_id, weapon_num, weapon_def_id, priority } => {
            let mut priority = *priority;
            let allowed = handler.allow_weapon_target(*attacker_id, *target_id, *weapon_num, *weapon_def_id, &mut priority);
            let mut report = plain_report(step, label);
            report.allowed = Some(allowed);
            report.numbers = vec![Some(priority as f64)];
            return report;
        }
        FixtureEvent::ShieldPreDamaged { projectile, shield, carrier, bounce } => {
            handler.invoke(&CallInArgs::ShieldPreDamaged { projectile, shield, carrier, bounce: *bounce })
        }
        FixtureEvent::DrawUnit { unit } => {
            let mut report = plain_report(step, label);
            report.allowed = Some(handler.draw_unit(unit));
            return report;
        }
        FixtureEvent::UnitScript { function, unit, args } => {
            let mut report = plain_report(step, label);
            report.unit_script = Some(handler.call_unit_script(function, unit, args));
            return report;
        }
        FixtureEvent::Define { context, name, code } => {
            let mut report = plain_report(step, label);
            if let Err(err) = handler.define(*context, &ScriptSource::new(name.as_str(), code.as_str())) {
                report.error = Some(format!("{err:#}"));
            }
            return report;
        }
        FixtureEvent::Undefine { context, name } => {
            let mut report = plain_report(step, label);
            match handler.undefine(*context, name) {
                Ok(removed) => report.allowed = Some(removed),
                Err(err) => report.error = Some(format!("{err:#}")),
            }
            return report;
        }
    };
    call_in_report(step, label, &outcome)
}

fn check(report: &StepReport, expect: &Expectation, mismatches: &mut Vec<String>) {
    let prefix = format!("step {} ({})", report.step, report.label);
    if let Some(status) = expect.status {
        if report.status != Some(status) {
            mismatches.push(format!("{prefix}: expected status {status}, got {:?}", report.status));
        }
    }
    if let Some(allowed) = expect.allowed {
        if report.allowed != Some(allowed) {
            mismatches.push(format!("{prefix}: expected allowed={allowed}, got {:?}", report.allowed));
        }
    }
    if let Some(numbers) = &expect.numbers {
        if &report.numbers != numbers {
            mismatches.push(format!("{prefix}: expected numbers {numbers:?}, got {:?}", report.numbers));
        }
    }
    if let Some(unit_script) = &expect.unit_script {
        if report.unit_script.as_ref() != Some(unit_script) {
            mismatches.push(format!("{prefix}: expected unit script {unit_script:?}, got {:?}", report.unit_script));
        }
    }
    if !report.stack_restored {
        mismatches.push(format!("{prefix}: stack depth changed"));
    }
}
