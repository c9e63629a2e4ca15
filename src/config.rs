use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptPaths {
    #[serde(default = "ScriptPaths::default_synced")]
    pub synced: PathBuf,
    #[serde(default = "ScriptPaths::default_unsynced")]
    pub unsynced: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineLimits {
    #[serde(default = "EngineLimits::default_max_call_levels")]
    pub max_call_levels: usize,
    /// Zero leaves the operation count unbounded.
    #[serde(default)]
    pub max_operations: u64,
    #[serde(default = "EngineLimits::default_max_string_size")]
    pub max_string_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesConfig {
    /// Run synced and unsynced code in one shared context.
    #[serde(default)]
    pub single_context: bool,
    #[serde(default = "RulesConfig::default_max_call_depth")]
    pub max_call_depth: u32,
    #[serde(default = "RulesConfig::default_stack_capacity")]
    pub stack_capacity: usize,
    #[serde(default = "RulesConfig::default_full_read")]
    pub synced_full_read: bool,
    #[serde(default = "RulesConfig::default_full_read")]
    pub unsynced_full_read: bool,
    #[serde(default)]
    pub engine: EngineLimits,
    #[serde(default)]
    pub scripts: ScriptPaths,
}

#[derive(Debug, Clone, Default)]
pub struct RulesConfigOverrides {
    pub single_context: Option<bool>,
    pub max_call_depth: Option<u32>,
    pub stack_capacity: Option<usize>,
}

impl Default for ScriptPaths {
    fn default() -> Self {
        Self { synced: Self::default_synced(), unsynced: Self::default_unsynced() }
    }
}

impl ScriptPaths {
    fn default_synced() -> PathBuf {
        PathBuf::from("rules/main.rhai")
    }

    fn default_unsynced() -> PathBuf {
        PathBuf::from("rules/draw.rhai")
    }
}

impl EngineLimits {
    const fn default_max_call_levels() -> usize {
        64
    }

    const fn default_max_string_size() -> usize {
        64 * 1024
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_call_levels: Self::default_max_call_levels(),
            max_operations: 0,
            max_string_size: Self::default_max_string_size(),
        }
    }
}

impl RulesConfig {
    const fn default_max_call_depth() -> u32 {
        16
    }

    const fn default_stack_capacity() -> usize {
        8_000
    }

    const fn default_full_read() -> bool {
        true
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            single_context: false,
            max_call_depth: Self::default_max_call_depth(),
            stack_capacity: Self::default_stack_capacity(),
            synced_full_read: Self::default_full_read(),
            unsynced_full_read: Self::default_full_read(),
            engine: EngineLimits::default(),
            scripts: ScriptPaths::default(),
        }
    }
}

impl RulesConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &RulesConfigOverrides) {
        if let Some(single) = overrides.single_context {
            self.single_context = single;
        }
        if let Some(depth) = overrides.max_call_depth {
            self.max_call_depth = depth;
        }
        if let Some(capacity) = overrides.stack_capacity {
            self.stack_capacity = capacity;
        }
    }
}

impl RulesConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.single_context.is_none() && self.max_call_depth.is_none() && self.stack_capacity.is_none()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.single_context.is_some() {
            fields.push("single_context");
        }
        if self.max_call_depth.is_some() {
            fields.push("max_call_depth");
        }
        if self.stack_capacity.is_some() {
            fields.push("stack_capacity");
        }
        fields
    }
}
