//! Configuration management

use crate::application::DEFAULT_USER_AGENT;
use crate::infrastructure::protocols::sip::ListenAddr;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhoneConfig {
    /// Listen addresses; empty picks an interface address and a free port
    pub listen: Vec<ListenAddr>,
    pub user_agent: String,
    /// Host used in From instead of the local address
    pub hostname: Option<String>,
    pub sip_timers: SipTimerConfig,
    pub register: Option<RegisterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipTimerConfig {
    /// RTT estimate (T1) in milliseconds
    pub t1_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Registrar URI, e.g. `sip:pbx.example.com`
    pub uri: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Seconds
    #[serde(default = "default_expiry")]
    pub expiry: u32,
}

fn default_expiry() -> u32 {
    3600
}

impl Default for PhoneConfig {
    fn default() -> Self {
        Self {
            listen: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            hostname: None,
            sip_timers: SipTimerConfig::default(),
            register: None,
        }
    }
}

impl Default for SipTimerConfig {
    fn default() -> Self {
        Self { t1_ms: 500 }
    }
}

impl PhoneConfig {
    /// Load from an optional file, overridden by `YAKPHONE__*` variables
    /// (e.g. `YAKPHONE__USER_AGENT`, `YAKPHONE__REGISTER__URI`).
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }
        builder
            .add_source(Environment::with_prefix("YAKPHONE").prefix_separator("__").separator("__"))
            .build()?
            .try_deserialize()
    }
}
