use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use rhai::{Dynamic, EvalAltResult};

use crate::callins::CallMode;
use crate::context::ScriptContext;

pub const DEFAULT_MAX_CALL_DEPTH: u32 = 16;

/// Bounds nested host -> script -> host chains across every context of one
/// rules instance.
#[derive(Debug, Clone)]
pub struct ReentrancyGuard {
    depth: Rc<Cell<u32>>,
    max_depth: u32,
}

impl Default for ReentrancyGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALL_DEPTH)
    }
}

impl ReentrancyGuard {
    pub fn new(max_depth: u32) -> Self {
        Self { depth: Rc::new(Cell::new(0)), max_depth }
    }

    pub fn depth(&self) -> u32 {
        self.depth.get()
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Claims one level; `None` once the chain is already at the maximum.
    pub fn enter(&self) -> Option<DepthToken> {
        let depth = self.depth.get();
        if depth >= self.max_depth {
            return None;
        }
        self.depth.set(depth + 1);
        Some(DepthToken { depth: self.depth.clone() })
    }
}

/// Releases its level on drop, so the counter is back at zero once the root
/// call of a chain returns.
#[derive(Debug)]
pub struct DepthToken {
    depth: Rc<Cell<u32>>,
}

impl Drop for DepthToken {
    fn drop(&mut self) {
        self.depth.set(self.depth.get().saturating_sub(1));
    }
}

/// A script error caught at the host boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFault {
    pub message: String,
    /// Innermost frame last; only captured for traceback calls.
    pub traceback: Vec<String>,
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if !self.traceback.is_empty() {
            f.write_str("\nstack traceback:")?;
            for frame in &self.traceback {
                write!(f, "\n\t{frame}")?;
            }
        }
        Ok(())
    }
}

impl ScriptFault {
    fn light(err: &EvalAltResult) -> Self {
        Self { message: root_cause(err).to_string(), traceback: Vec::new() }
    }

    fn with_traceback(err: &EvalAltResult) -> Self {
        let mut traceback = Vec::new();
        let mut current = err;
        while let EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) = current {
            if source.is_empty() {
                traceback.push(format!("in function '{name}' at {pos}"));
            } else {
                traceback.push(format!("{source}: in function '{name}' at {pos}"));
            }
            current = inner;
        }
        Self { message: current.to_string(), traceback }
    }
}

fn root_cause(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => root_cause(inner),
        other => other,
    }
}

/// Runs `name` in `context` with faults caught; nothing raised by the script
/// crosses into the host as anything but a [`ScriptFault`].
pub(crate) fn protected_call(
    context: &ScriptContext,
    name: &str,
    args: Vec<Dynamic>,
    mode: CallMode,
) -> Result<Dynamic, ScriptFault> {
    if !context.is_alive() {
        return Err(ScriptFault { message: format!("{} context is shut down", context.tag()), traceback: Vec::new() });
    }
    context.call(name, args).map_err(|err| match mode {
        CallMode::Light => ScriptFault::light(&err),
        CallMode::Traceback => ScriptFault::with_traceback(&err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rhai::Position;

    #[test]
    fn guard_fails_closed_at_the_maximum() {
        let guard = ReentrancyGuard::new(2);
        let first = guard.enter().expect("depth 1");
        let second = guard.enter().expect("depth 2");
        assert!(guard.enter().is_none());
        drop(second);
        assert_eq!(guard.depth(), 1);
        drop(first);
        assert_eq!(guard.depth(), 0);
    }

    #[test]
    fn clones_share_one_counter() {
        let guard = ReentrancyGuard::default();
        let other = guard.clone();
        let _token = guard.enter().expect("enter");
        assert_eq!(other.depth(), 1);
        assert_eq!(other.max_depth(), DEFAULT_MAX_CALL_DEPTH);
    }

    #[test]
    fn traceback_lists_frames_outermost_first() {
        let inner = EvalAltResult::ErrorRuntime(Dynamic::from("boom"), Position::NONE);
        let middle = EvalAltResult::ErrorInFunctionCall(
            "helper".to_string(),
            String::new(),
            Box::new(inner),
            Position::NONE,
        );
        let outer = EvalAltResult::ErrorInFunctionCall(
            "UnitPreDamaged".to_string(),
            "main".to_string(),
            Box::new(middle),
            Position::NONE,
        );
        let fault = ScriptFault::with_traceback(&outer);
        assert_eq!(fault.traceback.len(), 2);
        assert!(fault.traceback[0].contains("UnitPreDamaged"));
        assert!(fault.traceback[1].contains("helper"));
        assert!(fault.message.contains("boom"));

        let light = ScriptFault::light(&outer);
        assert!(light.traceback.is_empty());
        assert_eq!(light.message, fault.message);
    }
}
