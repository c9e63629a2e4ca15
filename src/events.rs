use std::fmt;

use serde::{Deserialize, Serialize};

use crate::host::RulesParam;

/// State changes requested by rule scripts through the native call-outs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RulesEvent {
    HelperAisPermitted { permitted: bool },
    RulesParamSet { name: String, value: RulesParam },
    WeaponWatched { weapon_def_id: i32, watched: bool },
    UnitScriptCalled { unit_id: i32, function: String, result: Option<i32> },
}

impl fmt::Display for RulesEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulesEvent::HelperAisPermitted { permitted } => {
                write!(f, "HelperAisPermitted permitted={permitted}")
            }
            RulesEvent::RulesParamSet { name, value } => match value {
                RulesParam::Number(number) => write!(f, "RulesParamSet name={name} value={number}"),
                RulesParam::Text(text) => write!(f, "RulesParamSet name={name} value={text:?}"),
            },
            RulesEvent::WeaponWatched { weapon_def_id, watched } => {
                write!(f, "WeaponWatched weapon_def={weapon_def_id} watched={watched}")
            }
            RulesEvent::UnitScriptCalled { unit_id, function, result } => match result {
                Some(value) => write!(f, "UnitScriptCalled unit={unit_id} function={function} result={value}"),
                None => write!(f, "UnitScriptCalled unit={unit_id} function={function} failed"),
            },
        }
    }
}

/// Ordered queue of [`RulesEvent`]s; drained by the host once per frame.
#[derive(Debug, Default)]
pub struct EventBus {
    events: Vec<RulesEvent>,
}

impl EventBus {
    pub fn push(&mut self, event: RulesEvent) {
        self.events.push(event);
    }

    pub fn drain(&mut self) -> Vec<RulesEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_push_order() {
        let mut bus = EventBus::default();
        bus.push(RulesEvent::HelperAisPermitted { permitted: false });
        bus.push(RulesEvent::WeaponWatched { weapon_def_id: 4, watched: true });
        assert_eq!(bus.len(), 2);
        let drained = bus.drain();
        assert!(bus.is_empty());
        assert_eq!(drained[0].to_string(), "HelperAisPermitted permitted=false");
        assert_eq!(drained[1].to_string(), "WeaponWatched weapon_def=4 watched=true");
    }
}
