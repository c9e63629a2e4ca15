use std::cell::RefCell;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use glam::Vec3;

use crate::callins::CallIn;
use crate::config::{RulesConfig, ScriptPaths};
use crate::context::{ContextTag, ScriptSource};
use crate::diagnostics::DiagnosticsHandle;
use crate::dispatch::{CallDispatcher, CallOutcome, UnitScriptResult};
use crate::events::RulesEvent;
use crate::host::{BuildInfo, Command, DrawMode, EntityView, HostBindings, LocalState, ProjectileView, WeaponView};
use crate::marshal::CallInArgs;
use crate::registry::CallInRegistry;

const SYNCED_FILE: &str = "main.rhai";
const UNSYNCED_FILE: &str = "draw.rhai";
const DEFAULT_SCOPE: &str = "rules";

/// The two script chunks of one rules instance plus the scope they load under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RulesSources {
    pub synced: ScriptSource,
    pub unsynced: ScriptSource,
    pub scope: String,
}

impl RulesSources {
    pub fn new(synced: impl Into<String>, unsynced: impl Into<String>) -> Self {
        Self::scoped(DEFAULT_SCOPE, synced, unsynced)
    }

    pub fn scoped(scope: impl Into<String>, synced: impl Into<String>, unsynced: impl Into<String>) -> Self {
        let scope = scope.into();
        Self {
            synced: ScriptSource::new(format!("{scope}/{SYNCED_FILE}"), synced),
            unsynced: ScriptSource::new(format!("{scope}/{UNSYNCED_FILE}"), unsynced),
            scope,
        }
    }

    /// Reads `main.rhai` (required) and `draw.rhai` (optional) from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let paths = ScriptPaths { synced: dir.join(SYNCED_FILE), unsynced: dir.join(UNSYNCED_FILE) };
        let scope = dir.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_else(|| DEFAULT_SCOPE.to_string());
        Self::from_paths(scope, &paths)
    }

    pub fn from_paths(scope: impl Into<String>, paths: &ScriptPaths) -> Result<Self> {
        let synced = fs::read_to_string(&paths.synced)
            .with_context(|| format!("Failed to read synced rules script {}", paths.synced.display()))?;
        let unsynced = if paths.unsynced.exists() {
            fs::read_to_string(&paths.unsynced)
                .with_context(|| format!("Failed to read unsynced rules script {}", paths.unsynced.display()))?
        } else {
            tracing::debug!(path = %paths.unsynced.display(), "no unsynced rules script, using an empty one");
            String::new()
        };
        Ok(Self::scoped(scope, synced, unsynced))
    }
}

/// Result of a pre-damage hook. `None` fields leave the host value unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PreDamaged {
    pub handled: bool,
    pub new_damage: Option<f32>,
    pub impulse_mult: Option<f32>,
}

impl PreDamaged {
    fn from_outcome(outcome: &CallOutcome) -> Self {
        Self {
            handled: outcome.handled(),
            new_damage: outcome.number(0).map(|value| value as f32),
            impulse_mult: outcome.number(1).map(|value| value as f32),
        }
    }

    pub fn apply(&self, damage: &mut f32, impulse_mult: &mut f32) {
        if let Some(new_damage) = self.new_damage {
            *damage = new_damage;
        }
        if let Some(mult) = self.impulse_mult {
            *impulse_mult = mult;
        }
    }
}

/// Sets the local drawing flag for the duration of a draw call-in.
struct DrawingScope {
    local: Rc<RefCell<LocalState>>,
    previous: bool,
}

impl DrawingScope {
    fn enter(local: &Rc<RefCell<LocalState>>) -> Self {
        let previous = std::mem::replace(&mut local.borrow_mut().drawing_enabled, true);
        Self { local: local.clone(), previous }
    }
}

impl Drop for DrawingScope {
    fn drop(&mut self) {
        self.local.borrow_mut().drawing_enabled = self.previous;
    }
}

/// A loaded rules instance: both contexts, their call-outs and the typed
/// call-in entry points the simulation uses.
pub struct RulesHandler {
    dispatcher: Rc<CallDispatcher>,
    scope: String,
}

impl std::fmt::Debug for RulesHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RulesHandler").field("scope", &self.scope).field("dispatcher", &self.dispatcher).finish()
    }
}

impl RulesHandler {
    /// Builds the contexts and runs the top-level statements of both sources.
    /// A handler that fails to load is torn down without running `Shutdown`.
    pub fn new(
        config: &RulesConfig,
        sources: &RulesSources,
        bindings: HostBindings,
        diagnostics: DiagnosticsHandle,
    ) -> Result<Self> {
        let dispatcher = CallDispatcher::new(config, bindings, diagnostics);
        let handler = Self { dispatcher, scope: sources.scope.clone() };
        if let Err(err) = handler.load_sources(sources) {
            handler.dispatcher.router().for_each_context(|context| context.kill());
            return Err(err).with_context(|| format!("Failed to load rules '{}'", sources.scope));
        }
        tracing::info!(
            scope = %handler.scope,
            single_context = handler.dispatcher.router().is_single(),
            "rules loaded"
        );
        Ok(handler)
    }

    fn load_sources(&self, sources: &RulesSources) -> Result<()> {
        let router = self.dispatcher.router();
        router.get(ContextTag::Synced).load(&sources.synced)?;
        router.get(ContextTag::Unsynced).load(&sources.unsynced)?;
        router.for_each_context(CallInRegistry::refresh);
        Ok(())
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn dispatcher(&self) -> &Rc<CallDispatcher> {
        &self.dispatcher
    }

    pub fn bindings(&self) -> &HostBindings {
        self.dispatcher.bindings()
    }

    pub fn is_defined(&self, call_in: CallIn) -> bool {
        self.dispatcher.is_defined(call_in)
    }

    pub fn invoke(&self, args: &CallInArgs<'_>) -> CallOutcome {
        self.dispatcher.invoke(args)
    }

    pub fn define(&self, tag: ContextTag, source: &ScriptSource) -> Result<Vec<String>> {
        self.dispatcher.define(tag, source).with_context(|| format!("Redefining {tag} chunk '{}'", source.name))
    }

    pub fn undefine(&self, tag: ContextTag, name: &str) -> Result<bool> {
        self.dispatcher.undefine(tag, name)
    }

    pub fn synced_checksum(&self) -> String {
        self.dispatcher.synced_checksum()
    }

    pub fn drain_events(&self) -> Vec<RulesEvent> {
        self.bindings().synced.borrow_mut().events.drain()
    }

    pub fn call_unit_script(&self, function: &str, unit: &dyn EntityView, args: &[i32]) -> UnitScriptResult {
        self.dispatcher.call_unit_script(function, unit, args)
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }

    fn decide(&self, args: CallInArgs<'_>) -> bool {
        self.invoke(&args).allowed()
    }

    fn weapon_watched(&self, weapon_def_id: i32) -> bool {
        self.bindings().synced.borrow().is_watched(weapon_def_id)
    }

    fn draw_mode(&self) -> DrawMode {
        self.bindings().local.borrow().draw_mode
    }

    fn draw(&self, args: CallInArgs<'_>) -> bool {
        if !self.is_defined(args.call_in()) {
            return false;
        }
        let _drawing = DrawingScope::enter(&self.bindings().local);
        self.invoke(&args).allowed()
    }

    /// `true` removes the command from the unit's queue.
    pub fn command_fallback(&self, unit: &dyn EntityView, command: &Command) -> bool {
        self.decide(CallInArgs::CommandFallback { unit, command })
    }

    pub fn allow_command(&self, unit: &dyn EntityView, command: &Command, from_synced: bool) -> bool {
        self.decide(CallInArgs::AllowCommand { unit, command, from_synced })
    }

    pub fn allow_unit_creation(&self, unit_def_id: i32, builder: &dyn EntityView, build: Option<&BuildInfo>) -> bool {
        self.decide(CallInArgs::AllowUnitCreation { unit_def_id, builder, build })
    }

    pub fn allow_unit_transfer(&self, unit: &dyn EntityView, new_team: i32, capture: bool) -> bool {
        self.decide(CallInArgs::AllowUnitTransfer { unit, new_team, capture })
    }

    pub fn allow_unit_build_step(&self, builder: &dyn EntityView, unit: &dyn EntityView, part: f32) -> bool {
        self.decide(CallInArgs::AllowUnitBuildStep { builder, unit, part })
    }

    pub fn allow_feature_creation(&self, feature_def_id: i32, team: i32, position: Vec3) -> bool {
        self.decide(CallInArgs::AllowFeatureCreation { feature_def_id, team, position })
    }

    pub fn allow_feature_build_step(&self, builder: &dyn EntityView, feature: &dyn EntityView, part: f32) -> bool {
        self.decide(CallInArgs::AllowFeatureBuildStep { builder, feature, part })
    }

    pub fn allow_resource_level(&self, team: i32, resource: &str, level: f32) -> bool {
        self.decide(CallInArgs::AllowResourceLevel { team, resource, level })
    }

    pub fn allow_resource_transfer(&self, old_team: i32, new_team: i32, resource: &str, amount: f32) -> bool {
        self.decide(CallInArgs::AllowResourceTransfer { old_team, new_team, resource, amount })
    }

    pub fn allow_direct_unit_control(&self, player_id: i32, unit: &dyn EntityView) -> bool {
        self.decide(CallInArgs::AllowDirectUnitControl { player_id, unit })
    }

    pub fn allow_start_position(&self, player_id: i32, ready_state: u8, clamped: Vec3, raw_pick: Vec3) -> bool {
        self.decide(CallInArgs::AllowStartPosition { player_id, ready_state, clamped, raw_pick })
    }

    pub fn move_ctrl_notify(&self, unit: &dyn EntityView, data: i32) -> bool {
        self.decide(CallInArgs::MoveCtrlNotify { unit, data })
    }

    pub fn terraform_complete(&self, unit: &dyn EntityView, build: &dyn EntityView) -> bool {
        self.decide(CallInArgs::TerraformComplete { unit, build })
    }

    pub fn unit_pre_damaged(
        &self,
        unit: &dyn EntityView,
        attacker: Option<&dyn EntityView>,
        damage: f32,
        weapon_def_id: i32,
        projectile_id: i32,
        paralyzer: bool,
    ) -> PreDamaged {
        let args = CallInArgs::UnitPreDamaged { unit, attacker, damage, weapon_def_id, projectile_id, paralyzer };
        PreDamaged::from_outcome(&self.invoke(&args))
    }

    pub fn feature_pre_damaged(
        &self,
        feature: &dyn EntityView,
        attacker: Option<&dyn EntityView>,
        damage: f32,
        weapon_def_id: i32,
        projectile_id: i32,
    ) -> PreDamaged {
        let args = CallInArgs::FeaturePreDamaged { feature, attacker, damage, weapon_def_id, projectile_id };
        PreDamaged::from_outcome(&self.invoke(&args))
    }

    /// `true` lets the shield ignore the projectile.
    pub fn shield_pre_damaged(
        &self,
        projectile: &ProjectileView,
        shield: &WeaponView,
        carrier: &dyn EntityView,
        bounce: bool,
    ) -> bool {
        self.decide(CallInArgs::ShieldPreDamaged { projectile, shield, carrier, bounce })
    }

    /// -1 when the script did not decide, otherwise 0 or 1.
    pub fn allow_weapon_target_check(&self, attacker_id: i32, weapon_num: i32, weapon_def_id: i32) -> i32 {
        const UNDECIDED: i32 = -1;
        if !self.weapon_watched(weapon_def_id) {
            return UNDECIDED;
        }
        let outcome = self.invoke(&CallInArgs::AllowWeaponTargetCheck { attacker_id, weapon_num, weapon_def_id });
        if outcome.handled() {
            outcome.allowed() as i32
        } else {
            UNDECIDED
        }
    }

    pub fn allow_weapon_target(
        &self,
        attacker_id: i32,
        target_id: i32,
        weapon_num: i32,
        weapon_def_id: i32,
        priority: &mut f32,
    ) -> bool {
        if !self.weapon_watched(weapon_def_id) {
            return true;
        }
        let outcome = self.invoke(&CallInArgs::AllowWeaponTarget {
            attacker_id,
            target_id,
            weapon_num,
            weapon_def_id,
            priority: *priority,
        });
        if let Some(new_priority) = outcome.number(1) {
            *priority = new_priority as f32;
        }
        outcome.allowed()
    }

    pub fn allow_weapon_intercept_target(
        &self,
        interceptor: &dyn EntityView,
        weapon: &WeaponView,
        target: &ProjectileView,
    ) -> bool {
        if !self.weapon_watched(weapon.def_id) {
            return true;
        }
        self.decide(CallInArgs::AllowWeaponInterceptTarget { interceptor, weapon, target })
    }

    pub fn draw_unit(&self, unit: &dyn EntityView) -> bool {
        self.draw(CallInArgs::DrawUnit { unit, mode: self.draw_mode() })
    }

    pub fn draw_feature(&self, feature: &dyn EntityView) -> bool {
        self.draw(CallInArgs::DrawFeature { feature, mode: self.draw_mode() })
    }

    pub fn draw_shield(&self, unit: &dyn EntityView, weapon: &WeaponView) -> bool {
        self.draw(CallInArgs::DrawShield { unit, weapon, mode: self.draw_mode() })
    }

    /// Only projectiles fired by a weapon or a piece are offered to the script.
    pub fn draw_projectile(&self, projectile: &ProjectileView) -> bool {
        if !(projectile.from_weapon || projectile.from_piece) {
            return false;
        }
        self.draw(CallInArgs::DrawProjectile { projectile, mode: self.draw_mode() })
    }
}

impl Drop for RulesHandler {
    fn drop(&mut self) {
        self.dispatcher.shutdown();
    }
}

/// Owner of at most one live rules instance. Load and unload take `&mut self`,
/// so ownership serializes them.
#[derive(Debug, Default)]
pub struct RulesSlot {
    handler: Option<RulesHandler>,
}

impl RulesSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the handler unless one is already loaded.
    pub fn load(
        &mut self,
        config: &RulesConfig,
        sources: &RulesSources,
        bindings: HostBindings,
        diagnostics: DiagnosticsHandle,
    ) -> Result<&RulesHandler> {
        if self.handler.is_none() {
            self.handler = Some(RulesHandler::new(config, sources, bindings, diagnostics)?);
        } else {
            tracing::debug!(scope = %sources.scope, "rules already loaded");
        }
        self.handler.as_ref().context("rules handler missing after load")
    }

    /// Shuts the handler down and releases it. Returns whether one was loaded.
    pub fn unload(&mut self) -> bool {
        match self.handler.take() {
            Some(handler) => {
                tracing::info!(scope = %handler.scope, "rules unloaded");
                drop(handler);
                true
            }
            None => false,
        }
    }

    pub fn get(&self) -> Option<&RulesHandler> {
        self.handler.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.handler.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use std::io::Write;

    #[test]
    fn sources_are_named_under_their_scope() {
        let sources = RulesSources::scoped("mod", "fn Shutdown() {}", "");
        assert_eq!(sources.synced.name, "mod/main.rhai");
        assert_eq!(sources.unsynced.name, "mod/draw.rhai");
    }

    #[test]
    fn from_dir_tolerates_missing_draw_script() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut main = fs::File::create(dir.path().join("main.rhai")).expect("create main");
        writeln!(main, "fn AllowCommand() {{ false }}").expect("write main");
        let sources = RulesSources::from_dir(dir.path()).expect("read sources");
        assert!(sources.synced.code.contains("AllowCommand"));
        assert!(sources.unsynced.code.is_empty());
    }

    #[test]
    fn from_dir_requires_main_script() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = RulesSources::from_dir(dir.path()).expect_err("main.rhai is missing");
        assert!(err.to_string().contains("synced rules script"));
    }

    #[test]
    fn pre_damaged_applies_only_present_fields() {
        let result = PreDamaged { handled: true, new_damage: None, impulse_mult: Some(0.5) };
        let (mut damage, mut impulse) = (40.0, 1.0);
        result.apply(&mut damage, &mut impulse);
        assert_eq!((damage, impulse), (40.0, 0.5));
    }

    #[test]
    fn slot_load_is_idempotent() {
        let mut slot = RulesSlot::new();
        let sources = RulesSources::new("let loads = 1;", "");
        slot.load(&RulesConfig::default(), &sources, HostBindings::new(), Diagnostics::isolated()).expect("load");
        let scope = slot
            .load(&RulesConfig::default(), &RulesSources::scoped("other", "", ""), HostBindings::new(), Diagnostics::isolated())
            .expect("second load is a no-op")
            .scope()
            .to_string();
        assert_eq!(scope, "rules");
        assert!(slot.unload());
        assert!(!slot.unload());
        assert!(slot.get().is_none());
    }

    #[test]
    fn drawing_scope_restores_previous_flag() {
        let local = Rc::new(RefCell::new(LocalState::default()));
        {
            let _scope = DrawingScope::enter(&local);
            assert!(local.borrow().drawing_enabled);
        }
        assert!(!local.borrow().drawing_enabled);
    }
}
