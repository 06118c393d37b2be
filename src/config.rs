use argon2::password_hash::PasswordHashString;
use chrono::TimeDelta;
use serde::Deserialize;

use crate::engine::MessageLimits;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Memory,
}

/// Server configuration, read from `LEASEMQ_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    #[serde(default)]
    pub store: StoreKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Argon2 PHC string of the API key. Authentication is disabled when unset.
    pub api_key_hash: Option<String>,
    #[serde(default = "default_dedupe_retention_secs")]
    pub dedupe_retention_secs: u64,
    #[serde(default = "default_dead_letter_retention_secs")]
    pub dead_letter_retention_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_dedupe_retention_secs() -> u64 {
    5 * 60
}

fn default_dead_letter_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_max_payload_bytes() -> usize {
    256 * 1024
}

fn default_max_delay_secs() -> u64 {
    15 * 60
}

fn seconds(secs: u64) -> TimeDelta {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("LEASEMQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("leasemq.db")
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn api_key_hash(&self) -> eyre::Result<Option<PasswordHashString>> {
        self.api_key_hash
            .as_deref()
            .map(|hash| {
                PasswordHashString::new(hash)
                    .map_err(|e| eyre::eyre!("Invalid LEASEMQ_API_KEY_HASH: {e}"))
            })
            .transpose()
    }

    pub fn dedupe_retention(&self) -> TimeDelta {
        seconds(self.dedupe_retention_secs)
    }

    pub fn dead_letter_retention(&self) -> TimeDelta {
        seconds(self.dead_letter_retention_secs)
    }

    pub fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn message_limits(&self) -> MessageLimits {
        MessageLimits {
            max_payload_bytes: self.max_payload_bytes,
            max_delay: seconds(self.max_delay_secs),
            dedupe_retention: self.dedupe_retention(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            store: StoreKind::default(),
            host: None,
            port: None,
            api_key_hash: None,
            dedupe_retention_secs: default_dedupe_retention_secs(),
            dead_letter_retention_secs: default_dead_letter_retention_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            max_payload_bytes: default_max_payload_bytes(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}
