use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

pub fn init() -> Result<()> {
    init_with(&LoggingSettings::default())
}

/// Fails if a global subscriber is already installed.
pub fn init_with(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.filter))
        .map_err(|e| anyhow::anyhow!("invalid log filter {:?}: {e}", settings.filter))?;

    let builder = fmt().with_env_filter(filter).with_target(false);
    if settings.json {
        builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("init json logging: {e}"))
    } else {
        builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("init logging: {e}"))
    }
}
