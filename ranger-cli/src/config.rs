//! Config loading: CLI flags layered over an optional TOML file layered
//! over environment variables, mirroring `dwctl::config`'s
//! file-then-env merge (§6 ambient configuration).

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangerConfig {
    /// `postgres://...` connection string; absent means run against an
    /// in-process `InMemoryDatastore` (fine for `build`/local smoke runs,
    /// never for more than one process sharing state).
    pub database_url: Option<String>,
    pub worker_queue: String,
    pub claim_batch_size: usize,
    pub bind_addr: String,
}

impl Default for RangerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_queue: "W".to_string(),
            claim_batch_size: 50,
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl RangerConfig {
    /// `config_path` is optional: operators without a file can drive
    /// everything through `RANGER_`-prefixed environment variables.
    pub fn load(config_path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(RangerConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("RANGER_"));
        Ok(figment.extract()?)
    }
}
