use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use bitflags::bitflags;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::dispatch::CallDispatcher;
use crate::events::{EventBus, RulesEvent};

/// Read-only identity of a simulation object handed to rule scripts.
pub trait EntityView {
    fn id(&self) -> i32;
    fn def_id(&self) -> i32;
    fn team(&self) -> i32;
}

/// Plain identity record for hosts that do not keep their own object types around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: i32,
    pub def_id: i32,
    pub team: i32,
}

impl EntityRecord {
    pub const fn new(id: i32, def_id: i32, team: i32) -> Self {
        Self { id, def_id, team }
    }
}

impl EntityView for EntityRecord {
    fn id(&self) -> i32 {
        self.id
    }

    fn def_id(&self) -> i32 {
        self.def_id
    }

    fn team(&self) -> i32 {
        self.team
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CommandOptions: u8 {
        const META = 1 << 2;
        const INTERNAL = 1 << 3;
        const RIGHT = 1 << 4;
        const SHIFT = 1 << 5;
        const CTRL = 1 << 6;
        const ALT = 1 << 7;
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Command {
    pub id: i32,
    #[serde(default)]
    pub params: Vec<f32>,
    #[serde(default)]
    pub options: CommandOptions,
    #[serde(default)]
    pub tag: u32,
}

impl Command {
    pub fn new(id: i32) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn with_params(mut self, params: impl Into<Vec<f32>>) -> Self {
        self.params = params.into();
        self
    }

    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BuildInfo {
    pub position: Vec3,
    pub facing: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectileView {
    pub id: i32,
    pub owner_id: i32,
    #[serde(default)]
    pub from_weapon: bool,
    #[serde(default)]
    pub from_piece: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeaponView {
    pub num: i32,
    pub def_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawMode {
    #[default]
    Normal,
    Shadow,
    Reflection,
    Refraction,
}

impl DrawMode {
    pub const fn code(self) -> i32 {
        match self {
            DrawMode::Normal => 1,
            DrawMode::Shadow => 2,
            DrawMode::Reflection => 3,
            DrawMode::Refraction => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RulesParam {
    Number(f64),
    Text(String),
}

/// Replicated state reachable from the synced context.
#[derive(Debug)]
pub struct SyncedState {
    pub helper_ais_permitted: bool,
    pub rules_params: BTreeMap<String, RulesParam>,
    pub watched_weapon_defs: BTreeSet<i32>,
    pub events: EventBus,
}

impl Default for SyncedState {
    fn default() -> Self {
        Self {
            helper_ais_permitted: true,
            rules_params: BTreeMap::new(),
            watched_weapon_defs: BTreeSet::new(),
            events: EventBus::default(),
        }
    }
}

impl SyncedState {
    pub fn is_watched(&self, weapon_def_id: i32) -> bool {
        self.watched_weapon_defs.contains(&weapon_def_id)
    }

    pub(crate) fn record(&mut self, event: RulesEvent) {
        self.events.push(event);
    }
}

/// Local, never-replicated state reachable from the unsynced context.
#[derive(Debug, Default)]
pub struct LocalState {
    pub draw_mode: DrawMode,
    pub drawing_enabled: bool,
    pub custom_drawn_units: BTreeSet<i32>,
}

/// The host-side animation script VM that `CallUnitScript` forwards to.
///
/// Implementations may re-enter the dispatcher (a unit script calling back into
/// the rules), which is bounded by the dispatcher's reentrancy guard.
pub trait UnitScriptHost {
    fn call_unit_script(&self, rules: &CallDispatcher, unit_id: i32, function: &str, args: &[i32])
        -> Result<i32, String>;
}

/// Host state shared with the installed call-outs.
#[derive(Clone, Default)]
pub struct HostBindings {
    pub synced: Rc<RefCell<SyncedState>>,
    pub local: Rc<RefCell<LocalState>>,
    pub unit_scripts: Option<Rc<dyn UnitScriptHost>>,
}

impl HostBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit_scripts(mut self, host: Rc<dyn UnitScriptHost>) -> Self {
        self.unit_scripts = Some(host);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_builder_keeps_fields() {
        let cmd = Command::new(20).with_params([1.0, 2.0]).with_options(CommandOptions::SHIFT).with_tag(7);
        assert_eq!(cmd.id, 20);
        assert_eq!(cmd.params, vec![1.0, 2.0]);
        assert!(cmd.options.contains(CommandOptions::SHIFT));
        assert_eq!(cmd.tag, 7);
    }

    #[test]
    fn synced_state_permits_helper_ais_by_default() {
        let state = SyncedState::default();
        assert!(state.helper_ais_permitted);
        assert!(!state.is_watched(3));
    }
}
