use crate::config::RulesConfigOverrides;
use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::iter::Peekable;

/// Flags accepted by the `kestrel_rules` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flag {
    SingleContext,
    MaxCallDepth,
    StackCapacity,
}

impl Flag {
    const ALL: [Flag; 3] = [Flag::SingleContext, Flag::MaxCallDepth, Flag::StackCapacity];

    fn name(self) -> &'static str {
        match self {
            Flag::SingleContext => "single-context",
            Flag::MaxCallDepth => "max-call-depth",
            Flag::StackCapacity => "stack-capacity",
        }
    }

    fn lookup(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.name() == name)
    }

    /// A bare switch reads as `on`.
    fn is_switch(self) -> bool {
        self == Flag::SingleContext
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    single_context: Option<bool>,
    max_call_depth: Option<u32>,
    stack_capacity: Option<usize>,
}

impl CliOverrides {
    pub fn parse_from_env() -> Result<Self> {
        Self::parse(env::args())
    }

    /// Parses `--flag value`, `--flag=value` and a bare `--single-context`.
    /// The first item is the program name.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = CliOverrides::default();
        let mut args = args.into_iter().skip(1).peekable();
        while let Some(raw) = args.next() {
            let raw = raw.as_ref();
            let Some(body) = raw.strip_prefix("--") else {
                bail!("Unexpected argument '{raw}'. Flags start with '--'.");
            };
            let (name, inline) = match body.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (body, None),
            };
            let Some(flag) = Flag::lookup(name) else {
                let known: Vec<_> = Flag::ALL.iter().map(|flag| format!("--{}", flag.name())).collect();
                bail!("Unknown flag '{raw}'. Supported flags: {}.", known.join(", "));
            };
            let value = match inline {
                Some(value) => value,
                None => next_value(flag, &mut args)?,
            };
            overrides.set(flag, &value)?;
        }
        Ok(overrides)
    }

    fn set(&mut self, flag: Flag, value: &str) -> Result<()> {
        match flag {
            Flag::SingleContext => self.single_context = Some(parse_switch(flag, value)?),
            Flag::MaxCallDepth => {
                self.max_call_depth = Some(value.parse().with_context(|| format!("Invalid max call depth '{value}'"))?);
            }
            Flag::StackCapacity => {
                self.stack_capacity = Some(value.parse().with_context(|| format!("Invalid stack capacity '{value}'"))?);
            }
        }
        Ok(())
    }

    pub fn into_config_overrides(self) -> RulesConfigOverrides {
        RulesConfigOverrides {
            single_context: self.single_context,
            max_call_depth: self.max_call_depth,
            stack_capacity: self.stack_capacity,
        }
    }

    #[cfg(test)]
    pub fn as_tuple(&self) -> (Option<bool>, Option<u32>, Option<usize>) {
        (self.single_context, self.max_call_depth, self.stack_capacity)
    }
}

fn next_value<I, S>(flag: Flag, args: &mut Peekable<I>) -> Result<String>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let follows_flag = args.peek().map_or(true, |next| next.as_ref().starts_with("--"));
    if follows_flag {
        if flag.is_switch() {
            return Ok("on".to_string());
        }
        return Err(anyhow!("Expected a value after '--{}'", flag.name()));
    }
    args.next().map(|value| value.as_ref().to_string()).ok_or_else(|| anyhow!("Expected a value after '--{}'", flag.name()))
}

fn parse_switch(flag: Flag, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        other => bail!("Invalid --{} value '{other}'. Use on/off or true/false.", flag.name()),
    }
}
