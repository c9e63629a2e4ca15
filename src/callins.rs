use serde::{Deserialize, Serialize};

/// Every extension point the host may offer to rule scripts.
///
/// The discriminant doubles as the index into per-context presence tables, so
/// new entries must be appended to [`CallIn::ALL`] in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CallIn {
    CommandFallback,
    AllowCommand,
    AllowUnitCreation,
    AllowUnitTransfer,
    AllowUnitBuildStep,
    AllowFeatureCreation,
    AllowFeatureBuildStep,
    AllowResourceLevel,
    AllowResourceTransfer,
    AllowDirectUnitControl,
    AllowStartPosition,
    MoveCtrlNotify,
    TerraformComplete,
    UnitPreDamaged,
    FeaturePreDamaged,
    ShieldPreDamaged,
    AllowWeaponTargetCheck,
    AllowWeaponTarget,
    AllowWeaponInterceptTarget,
    DrawUnit,
    DrawFeature,
    DrawShield,
    DrawProjectile,
    Shutdown,
}

impl CallIn {
    pub const ALL: [CallIn; 24] = [
        CallIn::CommandFallback,
        CallIn::AllowCommand,
        CallIn::AllowUnitCreation,
        CallIn::AllowUnitTransfer,
        CallIn::AllowUnitBuildStep,
        CallIn::AllowFeatureCreation,
        CallIn::AllowFeatureBuildStep,
        CallIn::AllowResourceLevel,
        CallIn::AllowResourceTransfer,
        CallIn::AllowDirectUnitControl,
        CallIn::AllowStartPosition,
        CallIn::MoveCtrlNotify,
        CallIn::TerraformComplete,
        CallIn::UnitPreDamaged,
        CallIn::FeaturePreDamaged,
        CallIn::ShieldPreDamaged,
        CallIn::AllowWeaponTargetCheck,
        CallIn::AllowWeaponTarget,
        CallIn::AllowWeaponInterceptTarget,
        CallIn::DrawUnit,
        CallIn::DrawFeature,
        CallIn::DrawShield,
        CallIn::DrawProjectile,
        CallIn::Shutdown,
    ];

    pub const COUNT: usize = Self::ALL.len();

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            CallIn::CommandFallback => "CommandFallback",
            CallIn::AllowCommand => "AllowCommand",
            CallIn::AllowUnitCreation => "AllowUnitCreation",
            CallIn::AllowUnitTransfer => "AllowUnitTransfer",
            CallIn::AllowUnitBuildStep => "AllowUnitBuildStep",
            CallIn::AllowFeatureCreation => "AllowFeatureCreation",
            CallIn::AllowFeatureBuildStep => "AllowFeatureBuildStep",
            CallIn::AllowResourceLevel => "AllowResourceLevel",
            CallIn::AllowResourceTransfer => "AllowResourceTransfer",
            CallIn::AllowDirectUnitControl => "AllowDirectUnitControl",
            CallIn::AllowStartPosition => "AllowStartPosition",
            CallIn::MoveCtrlNotify => "MoveCtrlNotify",
            CallIn::TerraformComplete => "TerraformComplete",
            CallIn::UnitPreDamaged => "UnitPreDamaged",
            CallIn::FeaturePreDamaged => "FeaturePreDamaged",
            CallIn::ShieldPreDamaged => "ShieldPreDamaged",
            CallIn::AllowWeaponTargetCheck => "AllowWeaponTargetCheck",
            CallIn::AllowWeaponTarget => "AllowWeaponTarget",
            CallIn::AllowWeaponInterceptTarget => "AllowWeaponInterceptTarget",
            CallIn::DrawUnit => "DrawUnit",
            CallIn::DrawFeature => "DrawFeature",
            CallIn::DrawShield => "DrawShield",
            CallIn::DrawProjectile => "DrawProjectile",
            CallIn::Shutdown => "Shutdown",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|call_in| call_in.name() == name)
    }

    pub const fn descriptor(self) -> CallInDescriptor {
        use Affinity::{Both, Synced, Unsynced};
        use CallMode::{Light, Traceback};
        match self {
            CallIn::CommandFallback => CallInDescriptor::new(self, Synced, Arity::Fixed(7), ALLOW_RESULT, SafeDefault::Bool(true), Light),
            CallIn::AllowCommand => CallInDescriptor::new(self, Synced, Arity::Fixed(8), ALLOW_RESULT, SafeDefault::Bool(true), Light),
            CallIn::AllowUnitCreation => CallInDescriptor::new(
                self,
                Synced,
                Arity::Variable { min: 3, max: 7 },
                ALLOW_RESULT,
                SafeDefault::Bool(true),
                Light,
            ),
            CallIn::AllowUnitTransfer
            | CallIn::AllowUnitBuildStep
            | CallIn::AllowFeatureCreation
            | CallIn::AllowFeatureBuildStep => {
                CallInDescriptor::new(self, Synced, Arity::Fixed(5), ALLOW_RESULT, SafeDefault::Bool(true), Light)
            }
            CallIn::AllowResourceLevel => CallInDescriptor::new(self, Synced, Arity::Fixed(3), ALLOW_RESULT, SafeDefault::Bool(true), Light),
            CallIn::AllowResourceTransfer | CallIn::AllowDirectUnitControl => {
                CallInDescriptor::new(self, Synced, Arity::Fixed(4), ALLOW_RESULT, SafeDefault::Bool(true), Light)
            }
            CallIn::AllowStartPosition => CallInDescriptor::new(self, Synced, Arity::Fixed(8), ALLOW_RESULT, SafeDefault::Bool(true), Light),
            CallIn::MoveCtrlNotify => CallInDescriptor::new(self, Synced, Arity::Fixed(4), NOTIFY_RESULT, SafeDefault::Bool(false), Light),
            CallIn::TerraformComplete => CallInDescriptor::new(self, Synced, Arity::Fixed(6), NOTIFY_RESULT, SafeDefault::Bool(false), Light),
            CallIn::UnitPreDamaged => CallInDescriptor::new(
                self,
                Synced,
                Arity::Variable { min: 5, max: 10 },
                PRE_DAMAGE_RESULT,
                SafeDefault::Bool(false),
                Traceback,
            ),
            CallIn::FeaturePreDamaged => CallInDescriptor::new(
                self,
                Synced,
                Arity::Variable { min: 4, max: 9 },
                PRE_DAMAGE_RESULT,
                SafeDefault::Bool(false),
                Traceback,
            ),
            CallIn::ShieldPreDamaged => CallInDescriptor::new(self, Synced, Arity::Fixed(5), LENIENT_RESULT, SafeDefault::Bool(false), Traceback),
            CallIn::AllowWeaponTargetCheck => CallInDescriptor::new(self, Synced, Arity::Fixed(3), LENIENT_RESULT, SafeDefault::Int(-1), Traceback),
            CallIn::AllowWeaponTarget => CallInDescriptor::new(self, Synced, Arity::Fixed(5), WEAPON_TARGET_RESULT, SafeDefault::Bool(true), Traceback),
            CallIn::AllowWeaponInterceptTarget => {
                CallInDescriptor::new(self, Synced, Arity::Fixed(3), LENIENT_RESULT, SafeDefault::Bool(true), Traceback)
            }
            CallIn::DrawUnit | CallIn::DrawFeature | CallIn::DrawProjectile => {
                CallInDescriptor::new(self, Unsynced, Arity::Fixed(2), NOTIFY_RESULT, SafeDefault::Bool(false), Light)
            }
            CallIn::DrawShield => CallInDescriptor::new(self, Unsynced, Arity::Fixed(3), NOTIFY_RESULT, SafeDefault::Bool(false), Light),
            CallIn::Shutdown => CallInDescriptor::new(self, Both, Arity::Fixed(0), &[], SafeDefault::None, Light),
        }
    }
}

const ALLOW_RESULT: &[ResultSlot] = &[ResultSlot::required("allow", ValueKind::Boolean)];
const NOTIFY_RESULT: &[ResultSlot] = &[ResultSlot::required("handled", ValueKind::Boolean)];
const LENIENT_RESULT: &[ResultSlot] = &[ResultSlot::lenient("allow")];
const PRE_DAMAGE_RESULT: &[ResultSlot] = &[
    ResultSlot::required("newDamage", ValueKind::Number),
    ResultSlot::optional("impulseMult", ValueKind::Number),
];
const WEAPON_TARGET_RESULT: &[ResultSlot] =
    &[ResultSlot::lenient("allow"), ResultSlot::optional("targetPriority", ValueKind::Number)];

/// Which context role a call-in belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Affinity {
    Synced,
    Unsynced,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variable { min: usize, max: usize },
}

impl Arity {
    pub const fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Fixed(expected) => count == expected,
            Arity::Variable { min, max } => count >= min && count <= max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Boolean,
    Number,
}

impl ValueKind {
    pub const fn label(self) -> &'static str {
        match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPresence {
    Required,
    Optional,
}

/// What a slot resolves to when the script hands back the wrong kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    /// Log a warning and fall back to the call-in default for this slot.
    Warn,
    /// Silently read as `false`; weapon and shield hooks treat anything but `true` as a veto.
    ReadFalse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultSlot {
    pub label: &'static str,
    pub kind: ValueKind,
    pub presence: SlotPresence,
    pub malformed: Malformed,
}

impl ResultSlot {
    pub const fn required(label: &'static str, kind: ValueKind) -> Self {
        Self { label, kind, presence: SlotPresence::Required, malformed: Malformed::Warn }
    }

    pub const fn optional(label: &'static str, kind: ValueKind) -> Self {
        Self { label, kind, presence: SlotPresence::Optional, malformed: Malformed::Warn }
    }

    const fn lenient(label: &'static str) -> Self {
        Self { label, kind: ValueKind::Boolean, presence: SlotPresence::Required, malformed: Malformed::ReadFalse }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafeDefault {
    None,
    Bool(bool),
    Int(i32),
}

impl SafeDefault {
    pub const fn as_bool(self) -> bool {
        match self {
            SafeDefault::Bool(value) => value,
            SafeDefault::Int(value) => value > 0,
            SafeDefault::None => false,
        }
    }
}

/// Which flavour of protected call runs the call-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Light,
    Traceback,
}

/// Static description of one call-in: shape, affinity and fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallInDescriptor {
    pub call_in: CallIn,
    pub affinity: Affinity,
    pub arity: Arity,
    pub results: &'static [ResultSlot],
    pub default: SafeDefault,
    pub mode: CallMode,
}

/// Slots every call reserves on top of its arguments (callee and error handler).
pub const CALL_OVERHEAD: usize = 2;

impl CallInDescriptor {
    const fn new(
        call_in: CallIn,
        affinity: Affinity,
        arity: Arity,
        results: &'static [ResultSlot],
        default: SafeDefault,
        mode: CallMode,
    ) -> Self {
        Self { call_in, affinity, arity, results, default, mode }
    }

    pub const fn name(&self) -> &'static str {
        self.call_in.name()
    }

    /// Stack slots needed for a call pushing `args` values.
    pub const fn stack_budget(&self, args: usize) -> usize {
        let values = if args > self.results.len() { args } else { self.results.len() };
        CALL_OVERHEAD + values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_indices_follow_declaration_order() {
        for (idx, call_in) in CallIn::ALL.iter().enumerate() {
            assert_eq!(call_in.index(), idx, "{} is out of order", call_in.name());
            assert_eq!(call_in.descriptor().call_in, *call_in);
        }
    }

    #[test]
    fn names_roundtrip_through_lookup() {
        for call_in in CallIn::ALL {
            assert_eq!(CallIn::from_name(call_in.name()), Some(call_in));
        }
        assert_eq!(CallIn::from_name("GameFrame"), None);
    }

    #[test]
    fn permission_gates_default_to_allow() {
        for call_in in CallIn::ALL {
            if call_in.name().starts_with("Allow") && call_in != CallIn::AllowWeaponTargetCheck {
                assert_eq!(call_in.descriptor().default, SafeDefault::Bool(true), "{}", call_in.name());
            }
        }
        assert_eq!(CallIn::MoveCtrlNotify.descriptor().default, SafeDefault::Bool(false));
        assert_eq!(CallIn::AllowWeaponTargetCheck.descriptor().default, SafeDefault::Int(-1));
    }

    #[test]
    fn draw_hooks_are_unsynced_only() {
        for call_in in [CallIn::DrawUnit, CallIn::DrawFeature, CallIn::DrawShield, CallIn::DrawProjectile] {
            assert_eq!(call_in.descriptor().affinity, Affinity::Unsynced);
        }
        assert_eq!(CallIn::AllowCommand.descriptor().affinity, Affinity::Synced);
    }

    #[test]
    fn stack_budget_covers_arguments_and_results() {
        let pre_damaged = CallIn::UnitPreDamaged.descriptor();
        assert_eq!(pre_damaged.stack_budget(10), CALL_OVERHEAD + 10);
        assert_eq!(CallIn::Shutdown.descriptor().stack_budget(0), CALL_OVERHEAD);
        assert!(pre_damaged.arity.accepts(7));
        assert!(!pre_damaged.arity.accepts(4));
    }
}
