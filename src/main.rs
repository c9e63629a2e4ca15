use anyhow::{Context, Result};
use kestrel_rules::callins::CallIn;
use kestrel_rules::cli::CliOverrides;
use kestrel_rules::config::RulesConfig;
use kestrel_rules::diagnostics::{tracing_sink, Diagnostics};
use kestrel_rules::host::HostBindings;
use kestrel_rules::rules::{RulesSlot, RulesSources};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli_overrides = match CliOverrides::parse_from_env() {
        Ok(parsed) => parsed.into_config_overrides(),
        Err(err) => {
            eprintln!("[cli] {err}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(&cli_overrides) {
        eprintln!("Rules error: {err:?}");
        std::process::exit(1);
    }
}

fn run(overrides: &kestrel_rules::config::RulesConfigOverrides) -> Result<()> {
    let mut config = RulesConfig::load_or_default("config/rules.json");
    if !overrides.is_empty() {
        tracing::info!(fields = ?overrides.applied_fields(), "applying command line overrides");
        config.apply_overrides(overrides);
    }

    let diagnostics = Diagnostics::global();
    diagnostics.register_sink(tracing_sink());

    let sources = RulesSources::from_paths("rules", &config.scripts).context("Failed to read rules scripts")?;
    let mut slot = RulesSlot::new();
    let handler = slot.load(&config, &sources, HostBindings::new(), diagnostics.clone())?;
    let defined: Vec<&str> =
        CallIn::ALL.into_iter().filter(|call_in| handler.is_defined(*call_in)).map(CallIn::name).collect();
    tracing::info!(?defined, "call-ins bound");
    for event in handler.drain_events() {
        tracing::info!("rules event: {event}");
    }
    slot.unload();
    diagnostics.cleanup();
    Ok(())
}
