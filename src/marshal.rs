//! Host object to script value conversion.
//!
//! The push order of every call-in is a wire contract: identity fields
//! (id, def id, team) come first, then payload, then trailing metadata.
//! Scripts rely on positions, so entries must never be reordered; new
//! fields may only be appended.

use rhai::{Array, Dynamic, Map, FLOAT, INT};
use smallvec::SmallVec;

use crate::callins::CallIn;
use crate::host::{BuildInfo, Command, CommandOptions, DrawMode, EntityView, ProjectileView, WeaponView};

/// Identity snapshot of a host object taken at marshaling time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshaledEntity {
    pub id: i32,
    pub def_id: i32,
    pub team: i32,
}

impl MarshaledEntity {
    pub fn of(view: &dyn EntityView) -> Self {
        Self { id: view.id(), def_id: view.def_id(), team: view.team() }
    }
}

/// Arguments of one call-in invocation, borrowed from the host.
pub enum CallInArgs<'a> {
    CommandFallback { unit: &'a dyn EntityView, command: &'a Command },
    AllowCommand { unit: &'a dyn EntityView, command: &'a Command, from_synced: bool },
    AllowUnitCreation { unit_def_id: i32, builder: &'a dyn EntityView, build: Option<&'a BuildInfo> },
    AllowUnitTransfer { unit: &'a dyn EntityView, new_team: i32, capture: bool },
    AllowUnitBuildStep { builder: &'a dyn EntityView, unit: &'a dyn EntityView, part: f32 },
    AllowFeatureCreation { feature_def_id: i32, team: i32, position: glam::Vec3 },
    AllowFeatureBuildStep { builder: &'a dyn EntityView, feature: &'a dyn EntityView, part: f32 },
    AllowResourceLevel { team: i32, resource: &'a str, level: f32 },
    AllowResourceTransfer { old_team: i32, new_team: i32, resource: &'a str, amount: f32 },
    AllowDirectUnitControl { player_id: i32, unit: &'a dyn EntityView },
    AllowStartPosition { player_id: i32, ready_state: u8, clamped: glam::Vec3, raw_pick: glam::Vec3 },
    MoveCtrlNotify { unit: &'a dyn EntityView, data: i32 },
    TerraformComplete { unit: &'a dyn EntityView, build: &'a dyn EntityView },
    UnitPreDamaged {
        unit: &'a dyn EntityView,
        attacker: Option<&'a dyn EntityView>,
        damage: f32,
        weapon_def_id: i32,
        projectile_id: i32,
        paralyzer: bool,
    },
    FeaturePreDamaged {
        feature: &'a dyn EntityView,
        attacker: Option<&'a dyn EntityView>,
        damage: f32,
        weapon_def_id: i32,
        projectile_id: i32,
    },
    ShieldPreDamaged { projectile: &'a ProjectileView, shield: &'a WeaponView, carrier: &'a dyn EntityView, bounce: bool },
    AllowWeaponTargetCheck { attacker_id: i32, weapon_num: i32, weapon_def_id: i32 },
    AllowWeaponTarget { attacker_id: i32, target_id: i32, weapon_num: i32, weapon_def_id: i32, priority: f32 },
    AllowWeaponInterceptTarget { interceptor: &'a dyn EntityView, weapon: &'a WeaponView, target: &'a ProjectileView },
    DrawUnit { unit: &'a dyn EntityView, mode: DrawMode },
    DrawFeature { feature: &'a dyn EntityView, mode: DrawMode },
    DrawShield { unit: &'a dyn EntityView, weapon: &'a WeaponView, mode: DrawMode },
    DrawProjectile { projectile: &'a ProjectileView, mode: DrawMode },
    Shutdown,
}

impl CallInArgs<'_> {
    pub fn call_in(&self) -> CallIn {
        match self {
            CallInArgs::CommandFallback { .. } => CallIn::CommandFallback,
            CallInArgs::AllowCommand { .. } => CallIn::AllowCommand,
            CallInArgs::AllowUnitCreation { .. } => CallIn::AllowUnitCreation,
            CallInArgs::AllowUnitTransfer { .. } => CallIn::AllowUnitTransfer,
            CallInArgs::AllowUnitBuildStep { .. } => CallIn::AllowUnitBuildStep,
            CallInArgs::AllowFeatureCreation { .. } => CallIn::AllowFeatureCreation,
            CallInArgs::AllowFeatureBuildStep { .. } => CallIn::AllowFeatureBuildStep,
            CallInArgs::AllowResourceLevel { .. } => CallIn::AllowResourceLevel,
            CallInArgs::AllowResourceTransfer { .. } => CallIn::AllowResourceTransfer,
            CallInArgs::AllowDirectUnitControl { .. } => CallIn::AllowDirectUnitControl,
            CallInArgs::AllowStartPosition { .. } => CallIn::AllowStartPosition,
            CallInArgs::MoveCtrlNotify { .. } => CallIn::MoveCtrlNotify,
            CallInArgs::TerraformComplete { .. } => CallIn::TerraformComplete,
            CallInArgs::UnitPreDamaged { .. } => CallIn::UnitPreDamaged,
            CallInArgs::FeaturePreDamaged { .. } => CallIn::FeaturePreDamaged,
            CallInArgs::ShieldPreDamaged { .. } => CallIn::ShieldPreDamaged,
            CallInArgs::AllowWeaponTargetCheck { .. } => CallIn::AllowWeaponTargetCheck,
            CallInArgs::AllowWeaponTarget { .. } => CallIn::AllowWeaponTarget,
            CallInArgs::AllowWeaponInterceptTarget { .. } => CallIn::AllowWeaponInterceptTarget,
            CallInArgs::DrawUnit { .. } => CallIn::DrawUnit,
            CallInArgs::DrawFeature { .. } => CallIn::DrawFeature,
            CallInArgs::DrawShield { .. } => CallIn::DrawShield,
            CallInArgs::DrawProjectile { .. } => CallIn::DrawProjectile,
            CallInArgs::Shutdown => CallIn::Shutdown,
        }
    }
}

pub type Marshaled = SmallVec<[Dynamic; 10]>;

#[derive(Default)]
struct ArgWriter {
    values: Marshaled,
}

impl ArgWriter {
    fn int(&mut self, value: i32) -> &mut Self {
        self.values.push(Dynamic::from_int(value as INT));
        self
    }

    fn number(&mut self, value: f32) -> &mut Self {
        self.values.push(Dynamic::from_float(value as FLOAT));
        self
    }

    fn boolean(&mut self, value: bool) -> &mut Self {
        self.values.push(Dynamic::from_bool(value));
        self
    }

    fn text(&mut self, value: &str) -> &mut Self {
        self.values.push(Dynamic::from(value.to_string()));
        self
    }

    fn entity(&mut self, view: &dyn EntityView) -> &mut Self {
        let entity = MarshaledEntity::of(view);
        self.int(entity.id).int(entity.def_id).int(entity.team)
    }

    fn vec3(&mut self, value: glam::Vec3) -> &mut Self {
        self.number(value.x).number(value.y).number(value.z)
    }

    fn command(&mut self, unit: &dyn EntityView, command: &Command) -> &mut Self {
        self.entity(unit).int(command.id);
        let params: Array = command.params.iter().map(|param| Dynamic::from_float(*param as FLOAT)).collect();
        self.values.push(Dynamic::from_array(params));
        self.values.push(Dynamic::from_map(options_map(command.options)));
        self.int(command.tag as i32)
    }

    /// The privileged damage block: weapon, projectile and attacker identity.
    fn damage_source(&mut self, full_read: bool, weapon_def_id: i32, projectile_id: i32, attacker: Option<&dyn EntityView>) {
        if !full_read {
            return;
        }
        self.int(weapon_def_id).int(projectile_id);
        if let Some(attacker) = attacker {
            self.entity(attacker);
        }
    }
}

fn options_map(options: CommandOptions) -> Map {
    let mut map = Map::new();
    map.insert("coded".into(), Dynamic::from_int(options.bits() as INT));
    map.insert("alt".into(), Dynamic::from_bool(options.contains(CommandOptions::ALT)));
    map.insert("ctrl".into(), Dynamic::from_bool(options.contains(CommandOptions::CTRL)));
    map.insert("shift".into(), Dynamic::from_bool(options.contains(CommandOptions::SHIFT)));
    map.insert("right".into(), Dynamic::from_bool(options.contains(CommandOptions::RIGHT)));
    map.insert("meta".into(), Dynamic::from_bool(options.contains(CommandOptions::META)));
    map.insert("internal".into(), Dynamic::from_bool(options.contains(CommandOptions::INTERNAL)));
    map
}

/// Builds the ordered argument list for one invocation. `full_read` selects
/// the privileged argument blocks, so the count varies per context.
pub fn marshal(args: &CallInArgs<'_>, full_read: bool) -> Marshaled {
    let mut w = ArgWriter::default();
    match *args {
        CallInArgs::CommandFallback { unit, command } => {
            w.command(unit, command);
        }
        CallInArgs::AllowCommand { unit, command, from_synced } => {
            w.command(unit, command).boolean(from_synced);
        }
        CallInArgs::AllowUnitCreation { unit_def_id, builder, build } => {
            w.int(unit_def_id).int(builder.id()).int(builder.team());
            if let Some(build) = build {
                w.vec3(build.position).int(build.facing);
            }
        }
        CallInArgs::AllowUnitTransfer { unit, new_team, capture } => {
            w.entity(unit).int(new_team).boolean(capture);
        }
        CallInArgs::AllowUnitBuildStep { builder, unit, part } => {
            w.int(builder.id()).int(builder.team()).int(unit.id()).int(unit.def_id()).number(part);
        }
        CallInArgs::AllowFeatureCreation { feature_def_id, team, position } => {
            w.int(feature_def_id).int(team).vec3(position);
        }
        CallInArgs::AllowFeatureBuildStep { builder, feature, part } => {
            w.int(builder.id()).int(builder.team()).int(feature.id()).int(feature.def_id()).number(part);
        }
        CallInArgs::AllowResourceLevel { team, resource, level } => {
            w.int(team).text(resource).number(level);
        }
        CallInArgs::AllowResourceTransfer { old_team, new_team, resource, amount } => {
            w.int(old_team).int(new_team).text(resource).number(amount);
        }
        CallInArgs::AllowDirectUnitControl { player_id, unit } => {
            w.entity(unit).int(player_id);
        }
        CallInArgs::AllowStartPosition { player_id, ready_state, clamped, raw_pick } => {
            w.vec3(clamped).int(player_id).int(ready_state as i32).vec3(raw_pick);
        }
        CallInArgs::MoveCtrlNotify { unit, data } => {
            w.entity(unit).int(data);
        }
        CallInArgs::TerraformComplete { unit, build } => {
            w.entity(unit).entity(build);
        }
        CallInArgs::UnitPreDamaged { unit, attacker, damage, weapon_def_id, projectile_id, paralyzer } => {
            w.entity(unit).number(damage).boolean(paralyzer);
            w.damage_source(full_read, weapon_def_id, projectile_id, attacker);
        }
        CallInArgs::FeaturePreDamaged { feature, attacker, damage, weapon_def_id, projectile_id } => {
            w.entity(feature).number(damage);
            w.damage_source(full_read, weapon_def_id, projectile_id, attacker);
        }
        CallInArgs::ShieldPreDamaged { projectile, shield, carrier, bounce } => {
            w.int(projectile.id).int(projectile.owner_id).int(shield.num).int(carrier.id()).boolean(bounce);
        }
        CallInArgs::AllowWeaponTargetCheck { attacker_id, weapon_num, weapon_def_id } => {
            w.int(attacker_id).int(weapon_num).int(weapon_def_id);
        }
        CallInArgs::AllowWeaponTarget { attacker_id, target_id, weapon_num, weapon_def_id, priority } => {
            w.int(attacker_id).int(target_id).int(weapon_num).int(weapon_def_id).number(priority);
        }
        CallInArgs::AllowWeaponInterceptTarget { interceptor, weapon, target } => {
            w.int(interceptor.id()).int(weapon.num).int(target.id);
        }
        CallInArgs::DrawUnit { unit, mode } => {
            w.int(unit.id()).int(mode.code());
        }
        CallInArgs::DrawFeature { feature, mode } => {
            w.int(feature.id()).int(mode.code());
        }
        CallInArgs::DrawShield { unit, weapon, mode } => {
            w.int(unit.id()).int(weapon.num).int(mode.code());
        }
        CallInArgs::DrawProjectile { projectile, mode } => {
            w.int(projectile.id).int(mode.code());
        }
        CallInArgs::Shutdown => {}
    }
    w.values
}

/// Unit-script callbacks: identity block followed by the raw integer args.
pub fn marshal_unit_script(unit: &dyn EntityView, args: &[i32]) -> Marshaled {
    let mut w = ArgWriter::default();
    w.entity(unit);
    for arg in args {
        w.int(*arg);
    }
    w.values
}

/// Folds values into a digest in a canonical, platform-independent encoding.
pub(crate) fn digest_values(hasher: &mut blake3::Hasher, tag: &str, values: &[Dynamic]) {
    hasher.update(tag.as_bytes());
    hasher.update(&(values.len() as u32).to_le_bytes());
    for value in values {
        digest_value(hasher, value);
    }
}

fn digest_value(hasher: &mut blake3::Hasher, value: &Dynamic) {
    if let Some(int) = value.clone().try_cast::<INT>() {
        hasher.update(b"i");
        hasher.update(&int.to_le_bytes());
    } else if let Some(float) = value.clone().try_cast::<FLOAT>() {
        hasher.update(b"f");
        hasher.update(&float.to_bits().to_le_bytes());
    } else if let Some(flag) = value.clone().try_cast::<bool>() {
        hasher.update(&[b'b', flag as u8]);
    } else if value.is_string() {
        let text = value.clone().into_string().unwrap_or_default();
        hasher.update(b"s");
        hasher.update(&(text.len() as u32).to_le_bytes());
        hasher.update(text.as_bytes());
    } else if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        hasher.update(b"a");
        hasher.update(&(items.len() as u32).to_le_bytes());
        for item in &items {
            digest_value(hasher, item);
        }
    } else if value.is_map() {
        // Map iterates in key order, so the digest is stable across peers.
        let map = value.clone().try_cast::<Map>().unwrap_or_default();
        hasher.update(b"m");
        hasher.update(&(map.len() as u32).to_le_bytes());
        for (key, item) in &map {
            hasher.update(key.as_bytes());
            digest_value(hasher, item);
        }
    } else {
        hasher.update(b"u");
    }
}
