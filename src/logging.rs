use anyhow::{bail, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

pub const LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Lets the shell change verbosity after startup.
#[derive(Clone)]
pub struct LogHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init(level: &str) -> LogHandle {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    LogHandle { handle }
}

pub fn parse_level(level: &str) -> Result<&'static str> {
    match LEVELS.iter().find(|l| l.eq_ignore_ascii_case(level)) {
        Some(l) => Ok(l),
        None => bail!("invalid level {:?}, expected one of {}", level, LEVELS.join(", ")),
    }
}

impl LogHandle {
    pub fn set_level(&self, level: &str) -> Result<()> {
        let level = parse_level(level)?;
        self.handle.reload(EnvFilter::new(level))?;
        Ok(())
    }

    pub fn current(&self) -> String {
        self.handle
            .with_current(|filter| filter.to_string())
            .unwrap_or_default()
    }
}
