//! Service configuration

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::machine::DeadlinePolicy;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarketConfig {
    /// Location of the sled database.
    pub db_path: PathBuf,
    /// Default lifetime of a proposal when the caller supplies no deadline.
    pub proposal_ttl_hours: Option<i64>,
    /// Default lifetime of an agreement when the caller supplies no deadline.
    pub agreement_ttl_hours: Option<i64>,
    pub trust_job_max_attempts: u32,
    /// Run queued trust jobs straight after the event that queued them.
    pub reactive_trust_recompute: bool,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("card_trade.db"),
            proposal_ttl_hours: Some(72),
            agreement_ttl_hours: Some(168),
            trust_job_max_attempts: 3,
            reactive_trust_recompute: true,
        }
    }
}

impl MarketConfig {
    /// Load configuration from an optional TOML file and the environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (`CARD_TRADE__PROPOSAL_TTL_HOURS`, ...)
    /// 2. Configuration file
    /// 3. Default values
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("CARD_TRADE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn deadline_policy(&self) -> DeadlinePolicy {
        DeadlinePolicy {
            proposal_ttl_hours: self.proposal_ttl_hours,
            agreement_ttl_hours: self.agreement_ttl_hours,
        }
    }
}
